//! Shared state stores for bucket state.
//!
//! The rate limiter keeps no bucket state in process; every decision reads
//! and writes through a [`BucketStore`]. A store shared by all instances (Redis)
//! gives horizontally scaled enforcement, the in-memory store covers single-node
//! deployments and tests.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::config::{StoreBackend, StoreConfig};
use crate::ratelimit::BucketParams;

/// Errors that can occur talking to a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store does not support {0}")]
    Unsupported(&'static str),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of a server-side refill-and-take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtomicOutcome {
    /// Whether the request consumed a token
    pub admitted: bool,
    /// Tokens left in the bucket after the decision
    pub tokens: f64,
}

/// Key-value store holding encoded bucket state.
///
/// Values are opaque strings to the store; the limiter owns the encoding.
/// The raw value returned by [`get`](BucketStore::get) doubles as the version
/// token for [`compare_and_set`](BucketStore::compare_and_set): refill clocks
/// never move backwards, so a key cannot return to an earlier value.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the raw value for a key, `None` if absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally write a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Write `value` only if the key still holds `expected` (`None` = absent).
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Whether [`atomic_update`](BucketStore::atomic_update) is available.
    fn supports_atomic_update(&self) -> bool {
        false
    }

    /// Refill, decide and write back in one store-side operation.
    ///
    /// Absent or malformed state is treated as a full bucket.
    async fn atomic_update(
        &self,
        _key: &str,
        _now: DateTime<Utc>,
        _params: &BucketParams,
        _ttl: Duration,
    ) -> StoreResult<AtomicOutcome> {
        Err(StoreError::Unsupported("atomic_update"))
    }
}

/// Open the store selected by the configuration.
pub async fn open(config: &StoreConfig) -> StoreResult<Arc<dyn BucketStore>> {
    match config.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory bucket store; limits are not shared between instances");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(&config.redis_url).await?)),
    }
}
