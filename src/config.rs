//! Centralized configuration for the convgate proxy.
//!
//! The gate reads its settings once at startup from an optional JSON file,
//! then applies `CONVGATE_*` environment overrides. The resulting
//! [`GateConfig`] is shared through a [`ConfigHandle`] (an `ArcSwap`), so a
//! file watcher living outside the core can install a fresh config without
//! the request path ever taking a lock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Config file was not valid JSON.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed
        path: String,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// A field failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration for the gate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Upstream host the gate fronts (authority only, e.g. "chat.example.com").
    pub upstream_host: String,

    /// Scheme used for upstream requests. "https" in production; "http" is
    /// accepted so the gate can be exercised against a plain local upstream.
    pub upstream_scheme: String,

    /// Login password for `GET /login?password=...`.
    pub password: String,

    /// Process-wide secret keying token signatures. Rotating it invalidates
    /// every outstanding token at once.
    pub signing_secret: String,

    /// Upstream session key substituted for the placeholder in request paths.
    pub session_key: String,

    /// Sensitive string scrubbed from HTML responses (typically the upstream
    /// account email). Empty disables the substitution.
    pub redact_email: String,

    /// Extra cookies injected into every upstream request, after the
    /// caller's own cookies.
    pub cookies: BTreeMap<String, String>,

    /// User-Agent presented to the upstream host.
    pub user_agent: String,

    /// Extra HTML appended to the login confirmation page.
    pub login_extra_html: String,

    /// Path suffixes treated as immutable build assets and cached.
    pub asset_suffixes: Vec<String>,

    /// Maximum buffered request body size in bytes.
    pub req_buffer_max: usize,

    /// Maximum buffered response body size in bytes (cacheable and
    /// intercepted responses only; streamed responses are unbounded).
    pub resp_buffer_max: usize,

    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval in seconds.
    pub tcp_keepalive_secs: u64,

    /// Socket buffer size (SO_RCVBUF / SO_SNDBUF).
    pub socket_buffer_size: usize,

    /// Maximum concurrent in-flight connections.
    pub max_concurrent_streams: usize,

    /// Prometheus metrics endpoint port.
    pub metrics_port: u16,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            upstream_host: String::new(),
            upstream_scheme: "https".to_string(),
            password: String::new(),
            signing_secret: String::new(),
            session_key: String::new(),
            redact_email: String::new(),
            cookies: BTreeMap::new(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
            login_extra_html: String::new(),
            asset_suffixes: vec![
                ".woff2".to_string(),
                ".otf".to_string(),
                ".js".to_string(),
                ".css".to_string(),
            ],
            req_buffer_max: 500 * 1024 * 1024, // 500 MB, matches upstream payload ceiling
            resp_buffer_max: 50 * 1024 * 1024, // 50 MB
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            socket_buffer_size: 262144, // 256 KB
            max_concurrent_streams: 10000,
            metrics_port: 9090,
        }
    }
}

impl GateConfig {
    /// Load configuration: defaults, then the JSON file (if given), then
    /// `CONVGATE_*` environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `CONVGATE_*` environment variables over the current values.
    ///
    /// Only the secrets and the upstream host are overridable this way; the
    /// rest comes from the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONVGATE_UPSTREAM_HOST") {
            self.upstream_host = v;
        }
        if let Ok(v) = std::env::var("CONVGATE_PASSWORD") {
            self.password = v;
        }
        if let Ok(v) = std::env::var("CONVGATE_SIGNING_SECRET") {
            self.signing_secret = v;
        }
        if let Ok(v) = std::env::var("CONVGATE_SESSION_KEY") {
            self.session_key = v;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_host.is_empty() {
            return Err(ConfigError::Invalid("upstream_host is required".into()));
        }
        // The host field is an authority, not a URL; parse it as one to
        // reject schemes, paths and other surprises early.
        let probe = format!("{}://{}", self.upstream_scheme, self.upstream_host);
        let parsed = Url::parse(&probe)
            .map_err(|e| ConfigError::Invalid(format!("upstream_host is not a valid host: {e}")))?;
        if parsed.host_str().is_none() || parsed.path() != "/" {
            return Err(ConfigError::Invalid(format!(
                "upstream_host must be a bare authority, got {}",
                self.upstream_host
            )));
        }
        if !matches!(self.upstream_scheme.as_str(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "upstream_scheme must be http or https, got {}",
                self.upstream_scheme
            )));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Invalid("password is required".into()));
        }
        if self.signing_secret.is_empty() {
            return Err(ConfigError::Invalid("signing_secret is required".into()));
        }
        Ok(())
    }
}

/// Shared, swap-in-place handle to the current [`GateConfig`].
///
/// The core only ever calls [`ConfigHandle::current`]; whoever owns the
/// reload policy (a file watcher, a signal handler, a test) calls
/// [`ConfigHandle::replace`].
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<GateConfig>>,
}

impl ConfigHandle {
    /// Wrap a validated config.
    pub fn new(config: GateConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Snapshot of the current config. Cheap; safe to hold across awaits.
    pub fn current(&self) -> Arc<GateConfig> {
        self.inner.load_full()
    }

    /// Install a new config for subsequent requests.
    pub fn replace(&self, config: GateConfig) {
        self.inner.store(Arc::new(config));
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of Debug output.
        f.debug_struct("ConfigHandle")
            .field("upstream_host", &self.current().upstream_host)
            .finish_non_exhaustive()
    }
}
