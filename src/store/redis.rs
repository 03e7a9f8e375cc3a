//! Redis-backed bucket store.
//!
//! All read-modify-write paths run as Lua scripts, which Redis executes
//! without interleaving any other command. A caller that goes away mid-call
//! either had its script run in full or not at all.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{AtomicOutcome, BucketStore, StoreResult};
use crate::ratelimit::BucketParams;

/// Refill-and-take, mirroring `ratelimit::decide`.
///
/// KEYS[1] bucket key; ARGV: now (epoch ms), max tokens, refill rate per
/// second, ttl (ms). Returns `{admitted, tokens, reset}`; tokens come back as a
/// string because Redis truncates Lua numbers to integers.
const TAKE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local max_tokens = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local tokens = max_tokens
local last = now
local reset = 0

local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, state = pcall(cjson.decode, raw)
  if ok and type(state) == 'table'
      and type(state.tokens) == 'number'
      and type(state.lastRefillAt) == 'number'
      and state.tokens == state.tokens
      and state.tokens >= 0 then
    tokens = state.tokens
    last = state.lastRefillAt
  else
    reset = 1
  end
end

local elapsed = math.max(0, now - last) / 1000
local refilled = math.min(max_tokens, tokens + elapsed * rate)
local admitted = 0
if refilled >= 1 then
  admitted = 1
  refilled = refilled - 1
end

local encoded = cjson.encode({tokens = refilled, lastRefillAt = math.max(now, last)})
redis.call('SET', KEYS[1], encoded, 'PX', ttl)
return {admitted, tostring(refilled), reset}
"#;

/// Conditional write.
///
/// KEYS[1] bucket key; ARGV: "1" if a value is expected else "0", expected
/// value, new value, ttl (ms). Returns 1 when written.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// A bucket store shared by every instance pointing at the same Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    take_script: Script,
    cas_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// The connection manager reconnects on its own after failures.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        info!(url = %url, "Connecting to Redis bucket store");

        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Redis bucket store connected");

        Ok(Self {
            conn,
            take_script: Script::new(TAKE_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        })
    }
}

/// Redis rejects a zero expiry, so round up to at least one millisecond.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .cas_script
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, written = written == 1, "Conditional bucket write");
        Ok(written == 1)
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
        let mut conn = self.conn.clone();
        let (admitted, tokens, reset): (i64, String, i64) = self
            .take_script
            .key(key)
            .arg(now.timestamp_millis())
            .arg(params.max_tokens)
            .arg(params.refill_rate_per_second)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        if reset == 1 {
            warn!(key = %key, "Discarded malformed bucket state in Redis");
        }

        let tokens = tokens.parse::<f64>().unwrap_or_else(|e| {
            warn!(key = %key, value = %tokens, error = %e, "Unparseable token count from Redis");
            0.0
        });

        Ok(AtomicOutcome {
            admitted: admitted == 1,
            tokens,
        })
    }
}
