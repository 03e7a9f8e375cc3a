//! The rate limiter service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::bucket::{decide, retry_after, BucketParams, BucketState};
use super::clock::{Clock, SystemClock};
use super::partition::{identity_from_claims, PartitionKey};
use crate::error::{Result, TollgateError};
use crate::store::{AtomicOutcome, BucketStore, StoreError, StoreResult};

/// Upper bound of the random pause between optimistic write attempts.
const MAX_RETRY_JITTER_MICROS: u64 = 2_000;

/// What to answer when the store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Deny the request
    #[default]
    Closed,
    /// Admit the request
    Open,
}

/// How a read-decide-write cycle is made safe against concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// The store runs refill, decide and write as one operation.
    Atomic,
    /// Conditional writes keyed on the value read, retried on conflict.
    Optimistic {
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
    /// A per-key lock inside this process.
    ///
    /// Only correct when a single instance serves every request for a key.
    LocalLock,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        UpdateStrategy::Atomic
    }
}

fn default_max_retries() -> u32 {
    16
}

/// Immutable limiter configuration, shared by every request.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    max_tokens: f64,
    refill_rate_per_second: f64,
    state_ttl: Duration,
    store_timeout: Duration,
    identity_claims: Vec<String>,
    key_prefix: String,
    failure_policy: FailurePolicy,
    update_strategy: UpdateStrategy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 20.0,
            refill_rate_per_second: 20.0,
            state_ttl: Duration::from_secs(5),
            store_timeout: Duration::from_millis(250),
            identity_claims: vec!["sub".to_string(), "UserId".to_string()],
            key_prefix: "ratelimit:".to_string(),
            failure_policy: FailurePolicy::Closed,
            update_strategy: UpdateStrategy::Atomic,
        }
    }
}

impl RateLimiterConfig {
    /// Create a configuration with the given capacity and refill rate.
    pub fn new(max_tokens: f64, refill_rate_per_second: f64) -> Self {
        Self {
            max_tokens,
            refill_rate_per_second,
            ..Self::default()
        }
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_identity_claims(mut self, claims: Vec<String>) -> Self {
        self.identity_claims = claims;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    pub fn bucket_params(&self) -> BucketParams {
        BucketParams {
            max_tokens: self.max_tokens,
            refill_rate_per_second: self.refill_rate_per_second,
        }
    }

    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn identity_claims(&self) -> &[String] {
        &self.identity_claims
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn update_strategy(&self) -> UpdateStrategy {
        self.update_strategy
    }

    /// Check the configuration for values the limiter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.max_tokens.is_finite() || self.max_tokens < 1.0 {
            return Err(TollgateError::Config(format!(
                "max_tokens must be a finite number >= 1, got {}",
                self.max_tokens
            )));
        }

        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(TollgateError::Config(format!(
                "refill_rate_per_second must be a finite number > 0, got {}",
                self.refill_rate_per_second
            )));
        }

        // An idle key must not expire before it has fully refilled.
        let full_refill = self.bucket_params().full_refill_secs();
        if self.state_ttl.as_secs_f64() < full_refill {
            return Err(TollgateError::Config(format!(
                "state_ttl ({:?}) must outlive a full refill ({:.3}s)",
                self.state_ttl, full_refill
            )));
        }

        if self.store_timeout.is_zero() {
            return Err(TollgateError::Config("store_timeout must be > 0".to_string()));
        }

        if let UpdateStrategy::Optimistic { max_retries: 0 } = self.update_strategy {
            return Err(TollgateError::Config("max_retries must be >= 1".to_string()));
        }

        if self.identity_claims.iter().any(|claim| claim.is_empty()) {
            return Err(TollgateError::Config("identity claim names must not be empty".to_string()));
        }

        Ok(())
    }
}

/// Why a decision could not be taken from the store.
#[derive(Debug, Error)]
pub enum LimiterFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gave up after {attempts} conflicting writes")]
    ConflictsExhausted { attempts: u32 },
}

/// The outcome of a rate limit check.
#[derive(Debug)]
pub enum RateLimitDecision {
    /// The request consumed a token.
    Allowed { remaining: f64 },
    /// The bucket is empty; a token is available again after `retry_after`.
    Throttled { retry_after: Duration },
    /// The store could not be consulted; `admitted` follows the failure policy.
    StoreFailure { admitted: bool, reason: LimiterFailure },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        match self {
            RateLimitDecision::Allowed { .. } => true,
            RateLimitDecision::Throttled { .. } => false,
            RateLimitDecision::StoreFailure { admitted, .. } => *admitted,
        }
    }
}

/// Token-bucket rate limiter over a shared [`BucketStore`].
///
/// Holds no bucket state itself: any number of instances, in any number of
/// processes, can serve the same keys as long as they share the store and use
/// the atomic or optimistic strategy.
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    /// Per-key locks, only populated by [`UpdateStrategy::LocalLock`]
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(store: Arc<dyn BucketStore>, config: RateLimiterConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(
        store: Arc<dyn BucketStore>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        match config.update_strategy {
            UpdateStrategy::Atomic if !store.supports_atomic_update() => {
                return Err(TollgateError::Config(
                    "the atomic update strategy needs a store with atomic updates".to_string(),
                ));
            }
            UpdateStrategy::LocalLock => {
                warn!("Using per-process key locks; limits are not enforced across instances");
            }
            _ => {}
        }

        info!(
            max_tokens = config.max_tokens,
            refill_rate_per_second = config.refill_rate_per_second,
            state_ttl = ?config.state_ttl,
            strategy = ?config.update_strategy,
            failure_policy = ?config.failure_policy,
            "Rate limiter initialized"
        );

        Ok(Self {
            store,
            config,
            clock,
            locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Pick the identity hint from a caller's claims using the configured precedence.
    pub fn identity_from_claims<'a, T, V>(&self, claims: &'a [(T, V)]) -> Option<&'a str>
    where
        T: AsRef<str>,
        V: AsRef<str>,
    {
        identity_from_claims(&self.config.identity_claims, claims)
    }

    /// Whether a request from this caller may proceed.
    pub async fn allow_request(&self, identity: Option<&str>, remote_address: Option<&str>) -> bool {
        self.check(identity, remote_address).await.is_allowed()
    }

    /// Check the rate limit for a caller, consuming a token if one is available.
    pub async fn check(&self, identity: Option<&str>, remote_address: Option<&str>) -> RateLimitDecision {
        let partition = PartitionKey::resolve(identity, remote_address);
        let key = format!("{}{}", self.config.key_prefix, partition);

        trace!(key = %key, strategy = ?self.config.update_strategy, "Checking rate limit");

        let result = match self.config.update_strategy {
            UpdateStrategy::Atomic => self.take_atomic(&key).await,
            UpdateStrategy::Optimistic { max_retries } => self.take_optimistic(&key, max_retries).await,
            UpdateStrategy::LocalLock => self.take_locked(&key).await,
        };

        match result {
            Ok(outcome) if outcome.admitted => {
                debug!(key = %key, remaining = outcome.tokens, "Request admitted");
                RateLimitDecision::Allowed {
                    remaining: outcome.tokens,
                }
            }
            Ok(outcome) => {
                let retry_after = retry_after(outcome.tokens, &self.config.bucket_params());
                warn!(key = %key, retry_after = ?retry_after, "Rate limit exceeded");
                RateLimitDecision::Throttled { retry_after }
            }
            Err(reason) => {
                let admitted = self.config.failure_policy == FailurePolicy::Open;
                warn!(
                    key = %key,
                    error = %reason,
                    policy = ?self.config.failure_policy,
                    admitted = admitted,
                    "Rate limit store failure"
                );
                RateLimitDecision::StoreFailure { admitted, reason }
            }
        }
    }

    /// The current time at the resolution bucket state is stored with.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    /// Bound a store round trip by the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let timeout = self.config.store_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }

    async fn take_atomic(&self, key: &str) -> std::result::Result<AtomicOutcome, LimiterFailure> {
        let now = self.now();
        let params = self.config.bucket_params();
        let outcome = self
            .bounded(self.store.atomic_update(key, now, &params, self.config.state_ttl))
            .await?;
        Ok(outcome)
    }

    async fn take_optimistic(
        &self,
        key: &str,
        max_retries: u32,
    ) -> std::result::Result<AtomicOutcome, LimiterFailure> {
        let params = self.config.bucket_params();

        for attempt in 1..=max_retries {
            let current = self.bounded(self.store.get(key)).await?;
            let now = self.now();
            let state = state_or_full(key, current.as_deref(), now, &params);
            let decision = decide(&state, now, &params);

            let written = self
                .bounded(self.store.compare_and_set(
                    key,
                    current.as_deref(),
                    &decision.next.encode(),
                    self.config.state_ttl,
                ))
                .await?;

            if written {
                return Ok(AtomicOutcome {
                    admitted: decision.admitted,
                    tokens: decision.next.tokens,
                });
            }

            debug!(key = %key, attempt = attempt, "Bucket write conflict, retrying");

            let jitter = rand::thread_rng().gen_range(0..=MAX_RETRY_JITTER_MICROS);
            tokio::time::sleep(Duration::from_micros(jitter)).await;
        }

        Err(LimiterFailure::ConflictsExhausted {
            attempts: max_retries,
        })
    }

    async fn take_locked(&self, key: &str) -> std::result::Result<AtomicOutcome, LimiterFailure> {
        let lease = KeyLease::acquire(&self.locks, key);
        let _guard = lease.lock.lock().await;

        let params = self.config.bucket_params();
        let current = self.bounded(self.store.get(key)).await?;
        let now = self.now();
        let state = state_or_full(key, current.as_deref(), now, &params);
        let decision = decide(&state, now, &params);

        self.bounded(self.store.set_with_ttl(key, &decision.next.encode(), self.config.state_ttl))
            .await?;

        Ok(AtomicOutcome {
            admitted: decision.admitted,
            tokens: decision.next.tokens,
        })
    }
}

/// Decode a stored value; absent or malformed state is a full bucket.
fn state_or_full(key: &str, raw: Option<&str>, now: DateTime<Utc>, params: &BucketParams) -> BucketState {
    match raw {
        None => BucketState::full(params, now),
        Some(raw) => BucketState::decode(raw).unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Discarding malformed bucket state");
            BucketState::full(params, now)
        }),
    }
}

/// A handle on one key's lock that drops the map entry once nobody needs it.
struct KeyLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> KeyLease<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let lock = locks.entry(key.to_string()).or_default().clone();
        Self { locks, key, lock }
    }
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        // Held by the map and by us only: nobody else is waiting on it.
        self.locks.remove_if(self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

#[async_trait::async_trait]
impl super::backend::AdmissionControl for RateLimiter {
    async fn allow_request(&self, identity: Option<&str>, remote_address: Option<&str>) -> bool {
        RateLimiter::allow_request(self, identity, remote_address).await
    }
}
