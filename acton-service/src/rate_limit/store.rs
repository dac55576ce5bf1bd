//! Rate-Limit Store: atomic token-bucket and counter updates keyed by a
//! string. Implementations must not perform a separate read-then-write
//! without serializability; for Redis this means a scripted read-modify-
//! write, for the in-process store a per-key mutex suffices.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// `(allowed, remaining, reset_seconds)`.
pub type TokenBucketOutcome = (bool, u64, u64);
/// `(count, reset_seconds)`.
pub type WindowOutcome = (u64, u64);

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Refill then consume one token if available. `capacity` and
    /// `refill_rate` are tokens and tokens/sec respectively.
    async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<TokenBucketOutcome>;

    /// Atomic increment of the counter for the window containing `now`.
    async fn window_increment(
        &self,
        key: &str,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<WindowOutcome>;

    /// Read (without incrementing) the counter for the window immediately
    /// preceding the one containing `now`, for the sliding window estimate.
    async fn previous_window_count(
        &self,
        key: &str,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Used by the readiness probe: succeeds iff the backend answered.
    async fn ping(&self) -> Result<()>;
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

struct WindowCounter {
    window_index: i64,
    count: u64,
    previous_index: i64,
    previous_count: u64,
}

/// In-process store guarded by a per-key-space mutex. A single mutex over
/// the whole map is sufficient per the concurrency model (the critical
/// section is O(1) arithmetic, never I/O).
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    windows: Mutex<HashMap<String, WindowCounter>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<TokenBucketOutcome> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(capacity);
        bucket.last_refill = now;

        let (allowed, remaining) = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            (true, bucket.tokens.floor() as u64)
        } else {
            (false, 0)
        };

        let reset_seconds = if refill_rate > 0.0 {
            (((1.0 - bucket.tokens.fract()) / refill_rate).ceil() as u64).max(1)
        } else {
            u64::MAX
        };

        Ok((allowed, remaining, reset_seconds))
    }

    async fn window_increment(
        &self,
        key: &str,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<WindowOutcome> {
        let window_secs = window_secs.max(1);
        let window_index = now.timestamp() / window_secs as i64;
        let mut windows = self.windows.lock().unwrap();

        let counter = windows.entry(key.to_string()).or_insert(WindowCounter {
            window_index,
            count: 0,
            previous_index: window_index - 1,
            previous_count: 0,
        });

        if counter.window_index != window_index {
            if counter.window_index == window_index - 1 {
                counter.previous_index = counter.window_index;
                counter.previous_count = counter.count;
            } else {
                counter.previous_index = window_index - 1;
                counter.previous_count = 0;
            }
            counter.window_index = window_index;
            counter.count = 0;
        }

        counter.count += 1;
        let window_end = (window_index + 1) * window_secs as i64;
        let reset_seconds = (window_end - now.timestamp()).max(0) as u64;

        Ok((counter.count, reset_seconds))
    }

    async fn previous_window_count(
        &self,
        key: &str,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let window_secs = window_secs.max(1);
        let window_index = now.timestamp() / window_secs as i64;
        let windows = self.windows.lock().unwrap();
        match windows.get(key) {
            Some(counter) if counter.previous_index == window_index - 1 => {
                Ok(counter.previous_count)
            }
            _ => Ok(0),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed store. Both operations are single `EVAL` scripts so the
/// read-modify-write is atomic server-side regardless of how many gateway
/// processes share the store.
#[cfg(feature = "cache")]
pub struct RedisRateLimitStore {
    pool: deadpool_redis::Pool,
    token_bucket_script: redis::Script,
    fixed_window_script: redis::Script,
}

#[cfg(feature = "cache")]
impl RedisRateLimitStore {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self {
            pool,
            token_bucket_script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            fixed_window_script: redis::Script::new(FIXED_WINDOW_SCRIPT),
        }
    }
}

#[cfg(feature = "cache")]
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

local data = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(data[1])
local last_refill_ms = tonumber(data[2])
if tokens == nil then
    tokens = capacity
    last_refill_ms = now_ms
end

local elapsed = math.max(0, now_ms - last_refill_ms) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= 1.0 then
    tokens = tokens - 1.0
    allowed = 1
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
redis.call('EXPIRE', key, 3600)

local reset_seconds = 1
if refill_rate > 0 then
    reset_seconds = math.max(1, math.ceil((1.0 - (tokens - math.floor(tokens))) / refill_rate))
end

return {allowed, math.floor(tokens), reset_seconds}
"#;

#[cfg(feature = "cache")]
const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window_secs = tonumber(ARGV[1])
local window_index = tonumber(ARGV[2])

local current = redis.call('GET', key)
local count
if current == false then
    count = 1
else
    count = tonumber(current) + 1
end

redis.call('SET', key, count, 'EX', window_secs * 2)
return count
"#;

#[cfg(feature = "cache")]
#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<TokenBucketOutcome> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| crate::error::Error::Store(format!("redis pool: {}", e)))?;

        let result: Vec<i64> = self
            .token_bucket_script
            .key(format!("ratelimit:bucket:{}", key))
            .arg(capacity)
            .arg(refill_rate)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;

        Ok((result[0] == 1, result[1] as u64, result[2] as u64))
    }

    async fn window_increment(
        &self,
        key: &str,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<WindowOutcome> {
        let window_secs = window_secs.max(1);
        let window_index = now.timestamp() / window_secs as i64;
        let redis_key = format!("ratelimit:window:{}:{}", key, window_index);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| crate::error::Error::Store(format!("redis pool: {}", e)))?;

        let count: i64 = self
            .fixed_window_script
            .key(redis_key)
            .arg(window_secs)
            .arg(window_index)
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;

        let window_end = (window_index + 1) * window_secs as i64;
        let reset_seconds = (window_end - now.timestamp()).max(0) as u64;
        Ok((count as u64, reset_seconds))
    }

    async fn previous_window_count(
        &self,
        key: &str,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        use deadpool_redis::redis::AsyncCommands;

        let window_secs = window_secs.max(1);
        let window_index = now.timestamp() / window_secs as i64;
        let redis_key = format!("ratelimit:window:{}:{}", key, window_index - 1);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| crate::error::Error::Store(format!("redis pool: {}", e)))?;
        let count: Option<i64> = conn.get(redis_key).await?;
        Ok(count.unwrap_or(0) as u64)
    }

    async fn ping(&self) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| crate::error::Error::Store(format!("redis pool: {}", e)))?;
        let _: Option<String> = conn.get("ratelimit:__ping__").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_allows_up_to_capacity_then_denies() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let mut allowed_count = 0;
        for _ in 0..4 {
            let (allowed, _, _) = store
                .token_bucket_consume("k", 3.0, 0.0, now)
                .await
                .unwrap();
            if allowed {
                allowed_count += 1;
            }
        }
        assert_eq!(allowed_count, 3);
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let store = InMemoryRateLimitStore::new();
        let t0 = Utc::now();
        store.token_bucket_consume("k", 1.0, 1.0, t0).await.unwrap();
        let (allowed_immediately, _, _) =
            store.token_bucket_consume("k", 1.0, 1.0, t0).await.unwrap();
        assert!(!allowed_immediately);

        let t1 = t0 + chrono::Duration::seconds(2);
        let (allowed_later, _, _) = store.token_bucket_consume("k", 1.0, 1.0, t1).await.unwrap();
        assert!(allowed_later);
    }

    #[tokio::test]
    async fn fixed_window_counts_within_window_and_resets_across() {
        let store = InMemoryRateLimitStore::new();
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let (c1, _) = store.window_increment("k", 60, t0).await.unwrap();
        let (c2, _) = store
            .window_increment("k", 60, t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);

        let next_window = t0 + chrono::Duration::seconds(61);
        let (c3, _) = store.window_increment("k", 60, next_window).await.unwrap();
        assert_eq!(c3, 1);
    }

    #[tokio::test]
    async fn previous_window_count_reads_prior_bucket() {
        let store = InMemoryRateLimitStore::new();
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        store.window_increment("k", 60, t0).await.unwrap();
        store.window_increment("k", 60, t0).await.unwrap();

        let next_window = t0 + chrono::Duration::seconds(61);
        let prev = store
            .previous_window_count("k", 60, next_window)
            .await
            .unwrap();
        assert_eq!(prev, 2);
    }
}
