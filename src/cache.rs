//! In-memory cache for immutable upstream build assets.
//!
//! Keys are request paths; values are the exact status-200 body and
//! headers the upstream returned the first time. Entries never expire and
//! are never evicted: the eligible paths are content-hashed build assets,
//! immutable for the life of the process. Concurrent puts for the same
//! key are idempotent (the fetched content is identical, so last write
//! wins is fine).

use bytes::Bytes;
use dashmap::DashMap;
use http::HeaderMap;

/// A cached upstream response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Response body bytes.
    pub body: Bytes,
    /// Response headers as received from upstream.
    pub headers: HeaderMap,
}

/// Keyed, write-once-per-key asset cache.
#[derive(Debug, Default)]
pub struct AssetCache {
    entries: DashMap<String, CacheEntry>,
}

impl AssetCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached entry by request path.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Store an entry. Only status-200 responses for eligible paths should
    /// reach this point; the forwarding engine enforces that.
    pub fn put(&self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether a request path denotes a cacheable build asset.
pub fn is_asset_path(path: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|s| path.ends_with(s.as_str()))
}
