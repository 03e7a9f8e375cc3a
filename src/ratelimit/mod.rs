//! Token-bucket rate limiting over a shared state store.

mod backend;
mod bucket;
mod clock;
mod limiter;
mod partition;

pub use backend::AdmissionControl;
pub use bucket::{decide, retry_after, BucketParams, BucketState, Decision, MalformedState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{
    FailurePolicy, LimiterFailure, RateLimitDecision, RateLimiter, RateLimiterConfig, UpdateStrategy,
};
pub use partition::{identity_from_claims, PartitionKey, UNKNOWN_ADDRESS};
