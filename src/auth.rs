//! Opaque-token authentication for the gate.
//!
//! A credential is two cookie values: a 256-bit random identity
//! (`user-key`) and an HMAC-SHA256 signature over it keyed by the
//! process-wide signing secret. A token is valid iff the recomputed
//! signature matches under a constant-time comparison; there is no token
//! database, and rotation of the secret revokes everything at once.

use hmac::{Hmac, Mac};
use http::header;
use hyper::Request;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Cookie carrying the random token identity.
pub const USER_KEY_COOKIE: &str = "user-key";

/// Cookie carrying the keyed signature over the identity.
pub const SIGNATURE_COOKIE: &str = "signature";

/// Cookie lifetime on issuance: one year.
pub const COOKIE_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

/// A freshly issued credential pair. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    /// Hex-encoded 256-bit random identity.
    pub user_key: String,
    /// Hex-encoded HMAC-SHA256 of `user_key` under the signing secret.
    pub signature: String,
}

/// Issue a new token pair under the given secret.
pub fn issue(secret: &str) -> TokenPair {
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    let user_key = hex::encode(raw);
    let signature = sign(secret, &user_key);
    TokenPair {
        user_key,
        signature,
    }
}

/// Compute the hex HMAC-SHA256 signature for an identity.
pub fn sign(secret: &str, user_key: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(user_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an identity/signature pair against the current secret.
///
/// The comparison is constant-time in the signature content so a probe
/// cannot binary-search a forgery byte by byte. Empty inputs are invalid.
pub fn verify(secret: &str, user_key: &str, signature: &str) -> bool {
    if user_key.is_empty() || signature.is_empty() {
        return false;
    }
    let expected = sign(secret, user_key);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Parse a `Cookie` request header into (name, value) pairs.
///
/// Tolerates surrounding whitespace and values containing `=`; entries
/// without a `=` are skipped.
pub fn parse_cookie_header(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split(';').filter_map(|entry| {
        let (name, value) = entry.split_once('=')?;
        Some((name.trim(), value.trim()))
    })
}

/// Extract the verified caller identity from a request, if any.
///
/// This is the only way other components learn who is calling. Missing or
/// invalid credentials are a `None`, never an error; the caller decides
/// the HTTP consequence.
pub fn identity_of<B>(req: &Request<B>, secret: &str) -> Option<String> {
    let raw = req.headers().get(header::COOKIE)?.to_str().ok()?;

    let mut user_key = None;
    let mut signature = None;
    for (name, value) in parse_cookie_header(raw) {
        match name {
            USER_KEY_COOKIE => user_key = Some(value),
            SIGNATURE_COOKIE => signature = Some(value),
            _ => {}
        }
    }

    let (user_key, signature) = (user_key?, signature?);
    verify(secret, user_key, signature).then(|| user_key.to_string())
}

/// Build a hardened `Set-Cookie` header value for a credential cookie.
pub fn set_cookie_value(name: &str, value: &str) -> String {
    format!(
        "{name}={value}; Max-Age={COOKIE_MAX_AGE_SECS}; Path=/; HttpOnly; Secure; SameSite=Strict"
    )
}
