//! Convgate - single-user gate and rewriting proxy for a hosted chat service.
//!
//! Convgate sits in front of a remote chat host and makes one account
//! shareable without handing out the account: callers authenticate with a
//! signed cookie token issued at `/login`, each conversation is bound to
//! the token that created it, and selected upstream responses are
//! rewritten on the way back (foreign conversation names redacted, HTML
//! pages scrubbed and instrumented).
//!
//! # Request paths
//!
//! - **Local:** login, the aggregate count endpoints, and asset-cache
//!   hits are answered without an upstream round trip.
//! - **Buffered:** cacheable asset misses and interceptor-matched
//!   responses are collected fully, then cached or transformed.
//! - **Streamed:** everything else is relayed to the client without
//!   buffering.

pub mod auth;
pub mod authz;
pub mod cache;
pub mod config;
pub mod error;
pub mod intercept;
pub mod login;
pub mod logging_layer;
pub mod metrics;
pub mod proxy_service;
pub mod store;
