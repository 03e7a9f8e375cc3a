//! In-process bucket store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::{AtomicOutcome, BucketStore, StoreResult};
use crate::ratelimit::{decide, BucketParams, BucketState};

/// Expired entries are swept once every this many writes.
const PURGE_EVERY_WRITES: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    raw: String,
    expires_at: Instant,
}

impl StoredValue {
    fn new(raw: String, ttl: Duration) -> Self {
        Self {
            raw,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self, now: Instant) -> Option<&str> {
        (now < self.expires_at).then_some(self.raw.as_str())
    }
}

/// A bucket store living in this process's memory.
///
/// Every operation on a key runs under that key's shard lock, so
/// `compare_and_set` and `atomic_update` are atomic with respect to every
/// other caller sharing this store. Only callers sharing the same instance see
/// the same state; use [`RedisStore`](super::RedisStore) across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a raw value directly, bypassing any encoding.
    pub fn insert_raw(&self, key: &str, raw: &str, ttl: Duration) {
        self.entries
            .insert(key.to_string(), StoredValue::new(raw.to_string(), ttl));
    }

    /// Number of entries held, including ones that expired but were not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, value| value.live(now).is_some());
        let purged = before.saturating_sub(self.entries.len());
        trace!(purged = purged, "Purged expired bucket entries");
        purged
    }

    /// Count a write, sweeping expired entries every [`PURGE_EVERY_WRITES`].
    ///
    /// Must not be called while holding an entry guard.
    fn record_write(&self) {
        let written = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if written % PURGE_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .and_then(|entry| entry.live(now).map(str::to_string));

        if value.is_none() {
            self.entries.remove_if(key, |_, v| v.live(now).is_none());
        }

        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.insert_raw(key, value, ttl);
        self.record_write();
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let replacement = StoredValue::new(value.to_string(), ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live(now) != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
            }
        }

        self.record_write();
        Ok(true)
    }

    fn supports_atomic_update(&self) -> bool {
        true
    }

    async fn atomic_update(
        &self,
        key: &str,
        now: DateTime<Utc>,
        params: &BucketParams,
        ttl: Duration,
    ) -> StoreResult<AtomicOutcome> {
        let instant = Instant::now();
        // Stored refill clocks only hold whole milliseconds.
        let now = now.trunc_subsecs(3);
        let apply = |current: Option<&str>| {
            let state = match current {
                None => BucketState::full(params, now),
                Some(raw) => BucketState::decode(raw).unwrap_or_else(|e| {
                    warn!(key = %key, error = %e, "Discarding malformed bucket state");
                    BucketState::full(params, now)
                }),
            };
            decide(&state, now, params)
        };

        let decision = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let decision = apply(occupied.get().live(instant));
                occupied.insert(StoredValue::new(decision.next.encode(), ttl));
                decision
            }
            Entry::Vacant(vacant) => {
                let decision = apply(None);
                vacant.insert(StoredValue::new(decision.next.encode(), ttl));
                decision
            }
        };
        self.record_write();

        Ok(AtomicOutcome {
            admitted: decision.admitted,
            tokens: decision.next.tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TTL: Duration = Duration::from_secs(5);

    fn params() -> BucketParams {
        BucketParams {
            max_tokens: 2.0,
            refill_rate_per_second: 1.0,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_get_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "v1", TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));

        store.set_with_ttl("k", "v2", TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "v", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set_with_ttl("short", "v", Duration::from_secs(1)).await.unwrap();
        store.set_with_ttl("long", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_keys() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            let key = format!("ip:10.0.{}.{}", i / 256, i % 256);
            store.set_with_ttl(&key, "v", Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(store.len(), 1000);

        tokio::time::advance(Duration::from_secs(2)).await;

        // Keys seen once are never read again; later traffic must still reclaim them
        for i in 0..100 {
            let key = format!("user:{}", i);
            store.atomic_update(&key, t0(), &params(), TTL).await.unwrap();
        }
        assert_eq!(store.len(), 100);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryStore::new();

        // Absent: only an "expect absent" write succeeds
        assert!(!store.compare_and_set("k", Some("x"), "a", TTL).await.unwrap());
        assert!(store.compare_and_set("k", None, "a", TTL).await.unwrap());

        // Present: the expected value must match
        assert!(!store.compare_and_set("k", None, "b", TTL).await.unwrap());
        assert!(!store.compare_and_set("k", Some("stale"), "b", TTL).await.unwrap());
        assert!(store.compare_and_set("k", Some("a"), "b", TTL).await.unwrap());

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_set_treats_expired_as_absent() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "old", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!store.compare_and_set("k", Some("old"), "new", TTL).await.unwrap());
        assert!(store.compare_and_set("k", None, "new", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_atomic_update_drains_bucket() {
        let store = MemoryStore::new();

        let first = store.atomic_update("k", t0(), &params(), TTL).await.unwrap();
        let second = store.atomic_update("k", t0(), &params(), TTL).await.unwrap();
        let third = store.atomic_update("k", t0(), &params(), TTL).await.unwrap();

        assert!(first.admitted);
        assert!(second.admitted);
        assert!(!third.admitted);
        assert_eq!(third.tokens, 0.0);

        let raw = store.get("k").await.unwrap().unwrap();
        let state = BucketState::decode(&raw).unwrap();
        assert_eq!(state.tokens, 0.0);
        assert_eq!(state.last_refill_at, t0());
    }

    #[tokio::test]
    async fn test_atomic_update_sub_millisecond_now_does_not_refill() {
        let store = MemoryStore::new();
        let now = t0() + chrono::Duration::microseconds(999);
        let params = BucketParams {
            max_tokens: 2.0,
            refill_rate_per_second: 1000.0,
        };

        let mut admitted = 0;
        for _ in 0..100 {
            if store.atomic_update("k", now, &params, TTL).await.unwrap().admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[tokio::test]
    async fn test_atomic_update_replaces_malformed_state() {
        let store = MemoryStore::new();
        store.insert_raw("k", "{garbage", TTL);

        let outcome = store.atomic_update("k", t0(), &params(), TTL).await.unwrap();

        assert!(outcome.admitted);
        assert_eq!(outcome.tokens, 1.0);
    }
}
