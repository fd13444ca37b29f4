//! Prometheus counters for the gate.
//!
//! Counters live on the default registry and are registered lazily on
//! first use; the text-format endpoint is served from `main` behind the
//! `metrics` feature.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "convgate_requests_total",
        "Requests handled by the gate, by terminal outcome",
        &["outcome"]
    )
    .expect("requests counter registers once")
});

static CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "convgate_cache_hits_total",
        "Static asset responses served from the in-memory cache"
    )
    .expect("cache counter registers once")
});

static INTERCEPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "convgate_intercepts_total",
        "Buffered responses rewritten by an interceptor rule",
        &["rule"]
    )
    .expect("intercept counter registers once")
});

/// Record a finished request by outcome label (`ok`, `unauthenticated`,
/// `denied`, `store_error`, ...).
pub fn record_request(outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a cache hit.
pub fn record_cache_hit() {
    CACHE_HITS_TOTAL.inc();
}

/// Record an applied interceptor rule.
pub fn record_intercept(rule: &str) {
    INTERCEPTS_TOTAL.with_label_values(&[rule]).inc();
}

/// Render the default registry in Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::{Encoder, TextEncoder};

    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
