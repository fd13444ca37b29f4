//! The forwarding engine.
//!
//! # Request flow
//!
//! ```text
//! Request<Incoming>
//!   │  /login ──────────────────────────► login handler
//!   ▼
//! authenticate (cookie pair) ── none ───► 404 decoy
//!   ▼
//! authorize (ownership) ─── denied ─────► 403
//!   │            └── count endpoints ───► fixed "0"
//!   ▼
//! rewrite + dispatch upstream
//!   ▼
//! classify response
//!   ├── asset path + 200 ──► cache hit? serve : buffer, cache, serve
//!   ├── interceptor match ─► buffer, transform, strip length, serve
//!   └── otherwise ─────────► stream through unbuffered
//! ```
//!
//! The upstream request clones the inbound headers, overrides `Host`,
//! forces identity content encoding so transforms see plain bytes,
//! presents a browser User-Agent, merges the configured session cookies
//! after the caller's own, and drops the inbound `Content-Length` (the
//! transport recomputes it once the body is known). A path containing the
//! session-key placeholder is rewritten before dispatch.
//!
//! Client disconnects drop the request future, which cancels the paired
//! upstream call; nothing keeps streaming into the void.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderValue, StatusCode, Uri, header};
use http_body_util::{BodyExt, BodyStream, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tower::Service;
use tracing::{debug, error, info};

use crate::auth;
use crate::authz::{self, AuthzDecision};
use crate::cache::{self, AssetCache, CacheEntry};
use crate::config::{ConfigHandle, GateConfig};
use crate::error::{GateError, GateResult};
use crate::intercept::{InterceptorChain, RequestMeta};
use crate::login::{self, SESSION_KEY_PLACEHOLDER};
use crate::metrics;
use crate::store::ConversationStore;

/// Type alias for the client's streaming body type.
type ClientBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Unified response body type: buffered (cache, intercept, local pages)
/// and streamed (pass-through) responses are both boxed into this.
pub type GateBody = http_body_util::combinators::BoxBody<Bytes, GateError>;

/// Box a buffered body into the unified response type.
fn full_body(bytes: Bytes) -> GateBody {
    Full::new(bytes)
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

/// The gate service: authentication, authorization, and forwarding for
/// every inbound request.
pub struct GateService {
    /// HTTPS-capable pooled client for upstream connections.
    client: Client<HttpsConnector<HttpConnector>, ClientBody>,
    config: ConfigHandle,
    store: ConversationStore,
    cache: Arc<AssetCache>,
    interceptors: Arc<InterceptorChain>,
}

impl Clone for GateService {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            cache: Arc::clone(&self.cache),
            interceptors: Arc::clone(&self.interceptors),
        }
    }
}

impl GateService {
    /// Create the gate service and its upstream client.
    ///
    /// # Errors
    ///
    /// Returns `GateError::Upstream` if the TLS crypto provider cannot be
    /// installed or the native root certificates cannot be loaded.
    pub fn new(config: ConfigHandle, store: ConversationStore) -> GateResult<Self> {
        // Install the ring crypto provider exactly once; capture the result
        // instead of panicking on a second call.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(GateError::Upstream(
                "failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.current().tcp_nodelay);
        http_connector.enforce_http(false);

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| GateError::Upstream(format!("failed to load native TLS roots: {e}")))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .http1_allow_obsolete_multiline_headers_in_responses(true)
            .http2_keep_alive_while_idle(true)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build(https_connector);

        let interceptors = Arc::new(InterceptorChain::new(store.clone(), config.clone()));

        Ok(Self {
            client,
            config,
            store,
            cache: Arc::new(AssetCache::new()),
            interceptors,
        })
    }

    /// Shared asset cache, exposed for tests.
    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Handle one inbound request end to end.
    pub async fn handle_request(&self, req: Request<Incoming>) -> GateResult<Response<GateBody>> {
        let config = self.config.current();

        // The login path is the one door that does not require a token.
        if req.uri().path() == "/login" {
            let resp = login::handle_login(&req, &config)?;
            return Ok(resp.map(full_body_from_full));
        }

        let Some(user_key) = auth::identity_of(&req, &config.signing_secret) else {
            return Err(GateError::AuthenticationMissing);
        };

        match authz::authorize(req.uri().path(), &user_key, &self.store).await? {
            AuthzDecision::AggregateShortCircuit => return aggregate_count_response(),
            AuthzDecision::Allowed => {}
        }

        self.forward(req, user_key, &config).await
    }

    /// Forward an authenticated, authorized request upstream and classify
    /// the response.
    async fn forward(
        &self,
        req: Request<Incoming>,
        user_key: String,
        config: &GateConfig,
    ) -> GateResult<Response<GateBody>> {
        let started = Instant::now();
        let (parts, inbound_body) = req.into_parts();

        let original = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let path = rewrite_path(original, &config.session_key);

        // Cache check precedes dispatch entirely: a hit never touches the
        // network.
        if cache::is_asset_path(&path, &config.asset_suffixes) {
            if let Some(entry) = self.cache.get(&path) {
                metrics::record_cache_hit();
                info!(
                    method = %parts.method,
                    path = %path,
                    status = 200,
                    latency_ms = started.elapsed().as_millis(),
                    cached = true,
                    "served from asset cache"
                );
                let mut resp = Response::new(full_body(entry.body));
                *resp.headers_mut() = entry.headers;
                return Ok(resp);
            }
        }

        let target = upstream_uri(&config.upstream_scheme, &config.upstream_host, &path)?;

        let inbound_cookie = parts
            .headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let mut builder = Request::builder().method(parts.method.clone()).uri(&target);
        let headers = builder
            .headers_mut()
            .ok_or_else(|| GateError::Upstream("request builder in invalid state".into()))?;

        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name.as_str()) && !is_overridden_header(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        headers.insert(header::HOST, header_value(&config.upstream_host)?);
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(header::USER_AGENT, header_value(&config.user_agent)?);
        let combined = merged_cookie_header(&inbound_cookie, &config.cookies);
        if !combined.is_empty() {
            headers.insert(header::COOKIE, header_value(&combined)?);
        }

        let meta = RequestMeta {
            method: parts.method,
            path: path.clone(),
            user_key,
        };

        // Multipart uploads pipe straight through; everything else is
        // buffered so the transport can send an exact length.
        let upstream_body: ClientBody = if content_type.contains("multipart/form-data") {
            let stream = BodyStream::new(inbound_body).map(|result| {
                result.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                    Box::new(std::io::Error::other(format!("client body error: {e}")))
                })
            });
            BodyExt::boxed(StreamBody::new(stream))
        } else {
            let collected = Limited::new(inbound_body, config.req_buffer_max)
                .collect()
                .await
                .map_err(|e| {
                    if e.downcast_ref::<LengthLimitError>().is_some() {
                        GateError::PayloadTooLarge(config.req_buffer_max)
                    } else {
                        GateError::ClientStream(e.to_string())
                    }
                })?;
            BodyExt::boxed(
                Full::new(collected.to_bytes())
                    .map_err(|never: std::convert::Infallible| match never {}),
            )
        };

        let upstream_req = builder
            .body(upstream_body)
            .map_err(|e| GateError::Upstream(format!("failed to build upstream request: {e}")))?;

        let upstream_res = self.client.request(upstream_req).await.map_err(|e| {
            error!(method = %meta.method, path = %meta.path, error = %e, "upstream request failed");
            GateError::Upstream(e.to_string())
        })?;

        let status = upstream_res.status();
        debug!(
            method = %meta.method,
            path = %meta.path,
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis(),
            "upstream responded"
        );

        // Classification 1: cacheable static asset.
        if cache::is_asset_path(&path, &config.asset_suffixes) && status == StatusCode::OK {
            let (resp_parts, body) = upstream_res.into_parts();
            let bytes = collect_upstream(body, config.resp_buffer_max).await?;

            // The buffered body is re-framed by the transport; upstream's
            // chunking no longer applies.
            let mut headers = resp_parts.headers;
            headers.remove(header::TRANSFER_ENCODING);

            self.cache.put(
                path.clone(),
                CacheEntry {
                    body: bytes.clone(),
                    headers: headers.clone(),
                },
            );
            info!(path = %path, size = bytes.len(), "cached static asset");
            let mut resp = Response::new(full_body(bytes));
            *resp.headers_mut() = headers;
            return Ok(resp);
        }

        // Classification 2: interceptable.
        if let Some(rule) = self.interceptors.select(&meta, status, upstream_res.headers()) {
            let (mut resp_parts, body) = upstream_res.into_parts();
            let bytes = collect_upstream(body, config.resp_buffer_max).await?;
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|e| GateError::BodyParse(format!("response body is not UTF-8: {e}")))?;

            let transformed = self.interceptors.apply(rule, &meta, text).await?;
            metrics::record_intercept(rule.as_str());

            // The transformed body no longer matches upstream's declared
            // length or framing; the transport recomputes both.
            resp_parts.headers.remove(header::CONTENT_LENGTH);
            resp_parts.headers.remove(header::TRANSFER_ENCODING);

            return Ok(Response::from_parts(
                resp_parts,
                full_body(Bytes::from(transformed)),
            ));
        }

        // Classification 3: pass-through, streamed without buffering.
        let (resp_parts, body) = upstream_res.into_parts();
        let stream = BodyStream::new(body).map(|result| {
            result.map_err(|e| GateError::Upstream(format!("upstream body stream error: {e}")))
        });
        let boxed: GateBody = BodyExt::boxed(StreamBody::new(stream));
        Ok(Response::from_parts(resp_parts, boxed))
    }
}

impl Service<Request<Incoming>> for GateService {
    type Response = Response<GateBody>;
    type Error = GateError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle_request(req).await })
    }
}

/// Buffer an upstream body under the configured cap.
async fn collect_upstream(body: Incoming, limit: usize) -> GateResult<Bytes> {
    let collected = Limited::new(body, limit).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            GateError::PayloadTooLarge(limit)
        } else {
            GateError::Upstream(format!("failed to read upstream body: {e}"))
        }
    })?;
    Ok(collected.to_bytes())
}

/// Convert a `Full<Bytes>` response body into the unified type.
fn full_body_from_full(body: Full<Bytes>) -> GateBody {
    body.map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

/// Fixed success response for the aggregate count endpoints.
fn aggregate_count_response() -> GateResult<Response<GateBody>> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from_static(b"0")))?)
}

/// Substitute the session-key placeholder everywhere it occurs in the
/// request path.
fn rewrite_path(path_and_query: &str, session_key: &str) -> String {
    path_and_query.replace(SESSION_KEY_PLACEHOLDER, session_key)
}

/// Build the absolute upstream URI for a rewritten path.
fn upstream_uri(scheme: &str, host: &str, path: &str) -> GateResult<Uri> {
    format!("{scheme}://{host}{path}")
        .parse()
        .map_err(|e| GateError::InvalidUri(format!("failed to build upstream URI: {e}")))
}

/// Merge the caller's cookie header with the configured extra cookies.
fn merged_cookie_header(inbound: &str, extra: &BTreeMap<String, String>) -> String {
    let injected = extra
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");

    let mut segments = Vec::new();
    if !inbound.is_empty() {
        segments.push(inbound);
    }
    if !injected.is_empty() {
        segments.push(injected.as_str());
    }
    segments.join("; ")
}

fn header_value(value: &str) -> GateResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| GateError::Upstream(format!("invalid upstream header value: {e}")))
}

/// Check if a header is a hop-by-hop header that shouldn't be forwarded.
///
/// The gate reframes bodies (buffered responses get a fresh length), so
/// `transfer-encoding` is filtered along with the classic set.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers replaced outright when building the upstream request.
fn is_overridden_header(name: &http::HeaderName) -> bool {
    *name == header::HOST
        || *name == header::COOKIE
        || *name == header::ACCEPT_ENCODING
        || *name == header::USER_AGENT
        || *name == header::CONTENT_LENGTH
}
