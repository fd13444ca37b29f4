//! Error types for the convgate proxy.
//!
//! Every failure is local to the request that hit it: the variants below
//! map one-to-one onto the HTTP responses the gate is allowed to reveal,
//! and nothing here is ever retried automatically.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Decoy page returned for unauthenticated requests.
///
/// Deliberately identical for every non-login path so that a probe cannot
/// distinguish a protected route from a nonexistent one.
pub const DECOY_PAGE: &str = r#"<html>
    <body style="text-align: center; padding-top: 50px; font-family: Arial, sans-serif;">
        <h2>There's Nothing Here</h2>
        <p>If you were given a link, enter from the link</p>
    </body>
</html>"#;

/// Errors that can occur while gating or forwarding a request.
#[derive(Error, Debug)]
pub enum GateError {
    /// No cookie pair, or the pair failed signature verification.
    #[error("missing or invalid credentials")]
    AuthenticationMissing,

    /// Ownership check failed; the reason stays in the logs.
    #[error("access denied: {0}")]
    AuthorizationDenied(String),

    /// Ownership store unreachable or a query failed. Never fails open.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A blocking store task was cancelled or panicked.
    #[error("store task error: {0}")]
    StoreTask(String),

    /// Network/transport error talking to the upstream host.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// An interceptor expected structured data it did not get.
    #[error("upstream body parse failed: {0}")]
    BodyParse(String),

    /// Error reading the inbound request body.
    #[error("client stream failed: {0}")]
    ClientStream(String),

    /// A buffered body exceeded the configured cap.
    #[error("payload exceeded buffer limit of {0} bytes")]
    PayloadTooLarge(usize),

    /// Invalid upstream URI (bad host configuration or request path).
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// Response/request construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

/// Result type alias for gate operations.
pub type GateResult<T> = Result<T, GateError>;

impl GateError {
    /// Short name for the variant, used as a metrics/log label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationMissing => "unauthenticated",
            Self::AuthorizationDenied(_) => "denied",
            Self::Store(_) | Self::StoreTask(_) => "store_error",
            Self::Upstream(_) => "upstream_error",
            Self::BodyParse(_) => "body_parse_error",
            Self::ClientStream(_) => "client_error",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::InvalidUri(_) | Self::Http(_) => "internal_error",
        }
    }

    /// Convert the error to the HTTP response the client is allowed to see.
    ///
    /// Unauthenticated requests get the 404 decoy page rather than a 401,
    /// and internal failures collapse to a generic 500 with no detail.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let (status, content_type, message) = match self {
            Self::AuthenticationMissing => {
                (StatusCode::NOT_FOUND, "text/html; charset=utf-8", DECOY_PAGE)
            }
            Self::AuthorizationDenied(_) => (StatusCode::FORBIDDEN, "text/plain", "Access denied"),
            Self::Store(_) | Self::StoreTask(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "Internal server error",
            ),
            Self::Upstream(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "Proxy request failed",
            ),
            Self::BodyParse(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "Error processing response",
            ),
            Self::ClientStream(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "Client request failed",
            ),
            Self::PayloadTooLarge(_) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "text/plain",
                "Payload too large",
            ),
            Self::InvalidUri(_) | Self::Http(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "Internal server error",
            ),
        };

        Response::builder()
            .status(status)
            .header("Content-Type", content_type)
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("Internal server error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}
