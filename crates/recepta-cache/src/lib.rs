//! recepta-cache
//!
//! Keyed TTL blob cache. Holds OAuth tokens (TTL = token expiry minus a
//! safety margin), idempotency receipts (24 h, claimed through
//! [`MemoryCache::put_if_absent`]) and hot consent documents (1 h, evicted
//! on status change). Entries expire lazily on read; a periodic purge pass
//! drops what nobody re-reads.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use recepta_core::clock::Clock;
use recepta_core::types::Timestamp;

struct Entry {
    bytes: Vec<u8>,
    expires_at: Timestamp,
}

/// In-process TTL cache. Cheap to clone behind an `Arc`; all methods take
/// `&self`.
pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn put(&self, key: impl Into<String>, bytes: Vec<u8>, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.into(), Entry { bytes, expires_at });
    }

    /// Read a live entry. An expired entry reads as absent and is dropped.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.expires_at > now => return Some(e.bytes.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: take the write lock and drop it.
        let mut entries = self.entries.write().await;
        if matches!(entries.get(key), Some(e) if e.expires_at <= now) {
            entries.remove(key);
            debug!(key, "expired cache entry dropped on read");
        }
        None
    }

    /// Store only when no live entry exists: the idempotency-receipt check.
    /// Returns `true` when this call claimed the key (first receipt) and
    /// `false` when a live receipt was already there (duplicate request).
    pub async fn put_if_absent(&self, key: impl Into<String>, bytes: Vec<u8>, ttl: Duration) -> bool {
        let key = key.into();
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if matches!(entries.get(&key), Some(e) if e.expires_at > now) {
            return false;
        }
        let expires_at = now + ttl;
        entries.insert(key, Entry { bytes, expires_at });
        true
    }

    pub async fn evict(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Drop every entry whose key starts with `prefix`.
    pub async fn evict_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .await
            .retain(|k, _| !k.starts_with(prefix));
    }

    /// Drop all expired entries; returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "expired cache entries purged");
        }
        purged
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
