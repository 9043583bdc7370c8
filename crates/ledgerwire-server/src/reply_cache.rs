//! At-Most-Once reply cache.
//!
//! Maps `(clientId, requestId)` to the encoded reply produced by the first
//! completed execution. A duplicate AMO request is answered by retransmitting
//! those bytes verbatim: the operation is never re-executed, and every reply
//! the client sees is byte-identical.
//!
//! Entries expire after a TTL measured on the monotonic clock; expired
//! entries are removed on lookup, with an optional full sweep for callers
//! that want to bound memory. The TTL only has to outlive the client's
//! bounded retry window (about 16 s at default settings), so the 5-minute
//! default is comfortable.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;

/// Default entry lifetime.
pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    reply: Bytes,
    inserted_at: Instant,
}

/// Shared reply cache keyed by `(clientId, requestId)`.
///
/// Cloning is cheap and shares the underlying map. Safe for concurrent
/// `lookup` and `store`.
#[derive(Clone)]
pub struct ReplyCache {
    entries: Arc<Mutex<HashMap<(u32, u64), CacheEntry>>>,
    ttl: Duration,
}

impl ReplyCache {
    /// Create a cache with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_REPLY_TTL)
    }

    /// Create a cache with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(u32, u64), CacheEntry>> {
        self.entries.lock().expect("reply cache mutex poisoned")
    }

    /// Cached reply for the request, if present and unexpired.
    ///
    /// An expired entry is removed on access.
    #[must_use]
    pub fn lookup(&self, client_id: u32, request_id: u64, now: Instant) -> Option<Bytes> {
        let mut entries = self.lock();
        let key = (client_id, request_id);
        match entries.get(&key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                Some(entry.reply.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Store the encoded reply, overwriting any prior entry for the key.
    pub fn store(&self, client_id: u32, request_id: u64, reply: Bytes, now: Instant) {
        self.lock().insert(
            (client_id, request_id),
            CacheEntry {
                reply,
                inserted_at: now,
            },
        );
    }

    /// Remove every expired entry, returning how many were evicted.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.inserted_at) < self.ttl);
        before - entries.len()
    }

    /// Number of live entries (including any not yet lazily evicted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for ReplyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_stored_bytes() {
        let cache = ReplyCache::new();
        let now = Instant::now();
        cache.store(1, 42, Bytes::from_static(b"reply"), now);

        assert_eq!(
            cache.lookup(1, 42, now),
            Some(Bytes::from_static(b"reply"))
        );
        assert_eq!(cache.lookup(1, 43, now), None);
        assert_eq!(cache.lookup(2, 42, now), None);
    }

    #[test]
    fn store_overwrites_existing_entry() {
        let cache = ReplyCache::new();
        let now = Instant::now();
        cache.store(1, 42, Bytes::from_static(b"first"), now);
        cache.store(1, 42, Bytes::from_static(b"second"), now);

        assert_eq!(
            cache.lookup(1, 42, now),
            Some(Bytes::from_static(b"second"))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entry_is_evicted_on_lookup() {
        let cache = ReplyCache::with_ttl(Duration::from_secs(10));
        let t0 = Instant::now();
        cache.store(1, 42, Bytes::from_static(b"reply"), t0);

        let before_expiry = t0 + Duration::from_secs(9);
        assert!(cache.lookup(1, 42, before_expiry).is_some());

        let after_expiry = t0 + Duration::from_secs(10);
        assert_eq!(cache.lookup(1, 42, after_expiry), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = ReplyCache::with_ttl(Duration::from_secs(10));
        let t0 = Instant::now();
        cache.store(1, 1, Bytes::from_static(b"old"), t0);
        cache.store(1, 2, Bytes::from_static(b"new"), t0 + Duration::from_secs(5));

        let evicted = cache.sweep(t0 + Duration::from_secs(12));
        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(1, 2, t0 + Duration::from_secs(12)).is_some());
    }

    #[test]
    fn clones_share_state() {
        let cache = ReplyCache::new();
        let other = cache.clone();
        let now = Instant::now();
        cache.store(1, 1, Bytes::from_static(b"shared"), now);

        assert_eq!(other.lookup(1, 1, now), Some(Bytes::from_static(b"shared")));
    }
}
