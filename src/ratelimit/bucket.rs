//! Token bucket state and the admission decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capacity and refill rate of a bucket.
///
/// This is the slice of the limiter configuration the decision needs, and the
/// part that is shipped to stores that run the decision server-side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Maximum number of tokens the bucket holds
    pub max_tokens: f64,
    /// Tokens added per second of elapsed time
    pub refill_rate_per_second: f64,
}

impl BucketParams {
    /// Time needed to refill an empty bucket.
    pub fn full_refill_secs(&self) -> f64 {
        self.max_tokens / self.refill_rate_per_second
    }
}

/// The persisted throttling state for one partition key.
///
/// Stored as `{"tokens":19.0,"lastRefillAt":1704067200000}`; the partition key
/// itself is the store key and is not part of the value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    /// Current token count, `0 <= tokens <= max_tokens`
    pub tokens: f64,
    /// Last time tokens were topped up (millisecond resolution when stored)
    #[serde(with = "epoch_millis")]
    pub last_refill_at: DateTime<Utc>,
}

/// Error returned when a stored value cannot be turned back into a bucket.
#[derive(Debug, thiserror::Error)]
#[error("malformed bucket state: {0}")]
pub struct MalformedState(String);

impl BucketState {
    /// A full bucket, used the first time a key is seen.
    pub fn full(params: &BucketParams, now: DateTime<Utc>) -> Self {
        Self {
            tokens: params.max_tokens,
            last_refill_at: now,
        }
    }

    /// Encode the state for the store.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("a float and an integer always serialize to JSON")
    }

    /// Decode a stored value, rejecting anything that breaks the token invariant.
    pub fn decode(raw: &str) -> Result<Self, MalformedState> {
        let state: BucketState =
            serde_json::from_str(raw).map_err(|e| MalformedState(e.to_string()))?;

        if !state.tokens.is_finite() || state.tokens < 0.0 {
            return Err(MalformedState(format!("invalid token count {}", state.tokens)));
        }

        Ok(state)
    }
}

/// Outcome of applying one request to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request consumed a token
    pub admitted: bool,
    /// State to write back for the key
    pub next: BucketState,
}

/// Refill the bucket up to `now` and try to take one token.
///
/// Elapsed time is clamped at zero so a clock that jumps backwards never
/// refunds or removes tokens, and the refill clock never moves backwards.
/// Both the admit and deny paths advance the refill clock.
pub fn decide(state: &BucketState, now: DateTime<Utc>, params: &BucketParams) -> Decision {
    let elapsed_secs = (now - state.last_refill_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let refilled = (state.tokens + elapsed_secs * params.refill_rate_per_second)
        .min(params.max_tokens);

    let (admitted, tokens) = if refilled >= 1.0 {
        (true, refilled - 1.0)
    } else {
        (false, refilled)
    };

    Decision {
        admitted,
        next: BucketState {
            tokens,
            last_refill_at: now.max(state.last_refill_at),
        },
    }
}

/// Time until a bucket holding `tokens` has one whole token again.
pub fn retry_after(tokens: f64, params: &BucketParams) -> std::time::Duration {
    let missing = (1.0 - tokens).max(0.0);
    std::time::Duration::from_secs_f64(missing / params.refill_rate_per_second)
}

mod epoch_millis {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(at.timestamp_millis())
    }

    // Lua's cjson may hand back integral millis as floats.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        if !millis.is_finite() {
            return Err(D::Error::custom("timestamp is not finite"));
        }
        DateTime::from_timestamp_millis(millis as i64)
            .ok_or_else(|| D::Error::custom("timestamp out of range"))
    }
}
