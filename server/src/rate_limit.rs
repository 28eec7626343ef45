//! Keyed rate limiting using the token bucket algorithm.
//!
//! Each key (for the gateway, the client's IP address) owns a bucket holding
//! up to `burst` tokens. Tokens are replenished continuously at
//! `rate_per_minute / 60000` per millisecond, and a call is allowed only if
//! the bucket holds at least `cost` tokens, which are then deducted.
//!
//! # Stores
//!
//! Buckets live in a [`TokenBucketStore`]:
//! - [`LocalTokenBuckets`] - an in-process map behind a single write lock,
//!   swept periodically for idle keys
//! - [`RedisTokenBuckets`] - a shared Redis hash per key, updated atomically by
//!   one Lua script and expired with `PEXPIRE`
//!
//! # Failure behaviour
//!
//! [`RateLimiter::consume`] fails **open**: if the store returns an error the
//! call is allowed and a warning is logged. A broken shared store degrades
//! protection rather than availability.
//!
//! # Example
//!
//! ```rust
//! use darecast_server::rate_limit::RateLimiter;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::local();
//!
//!     // 120 messages per minute, bursts of up to 30
//!     assert!(limiter.consume("ws:203.0.113.7", 120, 30, 1).await);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Prefix for bucket keys in the shared store.
pub const REDIS_KEY_PREFIX: &str = "darecast:rl:";

/// Atomic refill-and-take against a Redis hash `{tokens, ts}`.
///
/// KEYS[1] bucket key; ARGV: refill per ms, burst, cost, idle TTL in ms.
/// Returns 1 when allowed, 0 otherwise.
const TAKE_SCRIPT: &str = r"
local rate_per_ms = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

local clock = redis.call('TIME')
local now_ms = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = burst
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts)
tokens = math.min(burst, tokens + elapsed * rate_per_ms)

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now_ms))
redis.call('PEXPIRE', KEYS[1], ttl_ms)
return allowed
";

/// Errors raised by a token bucket store.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The shared store URL could not be parsed.
    #[error("invalid rate limit store URL: {0}")]
    InvalidUrl(#[source] redis::RedisError),

    /// The shared store rejected or failed the operation.
    #[error("rate limit store error: {0}")]
    Store(#[from] redis::RedisError),
}

/// Refill rate and capacity for one `consume` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimit {
    /// Tokens added per minute.
    pub rate_per_minute: u32,

    /// Maximum number of tokens the bucket can hold.
    pub burst: u32,
}

impl BucketLimit {
    /// Returns `None` unless both rate and burst are positive.
    pub fn new(rate_per_minute: u32, burst: u32) -> Option<Self> {
        (rate_per_minute > 0 && burst > 0).then_some(Self {
            rate_per_minute,
            burst,
        })
    }

    /// Tokens added per millisecond.
    #[inline]
    pub fn refill_per_ms(&self) -> f64 {
        f64::from(self.rate_per_minute) / 60_000.0
    }

    /// Inactivity after which a bucket is indistinguishable from a full one.
    pub fn idle_ttl(&self) -> Duration {
        let minutes = f64::from(self.burst) / f64::from(self.rate_per_minute);
        Duration::from_secs_f64(minutes * 60.0).max(Duration::from_millis(1))
    }
}

/// A token bucket for a single key.
///
/// The bucket starts full. Rate and capacity are supplied per call so that
/// one store can serve several limits.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current number of tokens in the bucket.
    tokens: f64,

    /// Time of the last token refill.
    last_refill: Instant,

    /// Idle lifetime derived from the most recent limit.
    idle_ttl: Duration,
}

impl TokenBucket {
    /// Creates a full bucket for `limit`.
    pub fn new(limit: BucketLimit) -> Self {
        Self {
            tokens: f64::from(limit.burst),
            last_refill: Instant::now(),
            idle_ttl: limit.idle_ttl(),
        }
    }

    /// Refills, then takes `cost` tokens if available.
    pub fn try_consume(&mut self, limit: BucketLimit, cost: u32) -> bool {
        self.refill(limit);
        self.idle_ttl = limit.idle_ttl();

        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, limit: BucketLimit) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;

        self.tokens =
            (self.tokens + elapsed_ms * limit.refill_per_ms()).min(f64::from(limit.burst));
        self.last_refill = now;
    }

    /// Returns `true` once the bucket has been idle past its TTL.
    pub fn is_stale(&self) -> bool {
        self.last_refill.elapsed() >= self.idle_ttl
    }

    #[cfg(test)]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Storage backend for token buckets.
///
/// Implementations must make refill-and-take atomic per key.
#[async_trait]
pub trait TokenBucketStore: Send + Sync {
    /// Refills the bucket for `key` and takes `cost` tokens if available.
    async fn take(&self, key: &str, limit: BucketLimit, cost: u32) -> Result<bool, RateLimitError>;

    /// Removes idle buckets, returning how many were removed.
    ///
    /// Stores with native expiry return 0.
    async fn sweep(&self) -> usize {
        0
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// In-process bucket store serialized by a single write lock.
#[derive(Debug, Clone, Default)]
pub struct LocalTokenBuckets {
    buckets: Arc<RwLock<HashMap<String, TokenBucket>>>,
}

impl LocalTokenBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tracked keys.
    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }
}

#[async_trait]
impl TokenBucketStore for LocalTokenBuckets {
    async fn take(&self, key: &str, limit: BucketLimit, cost: u32) -> Result<bool, RateLimitError> {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(limit));
        Ok(bucket.try_consume(limit, cost))
    }

    async fn sweep(&self) -> usize {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_stale());
        before - buckets.len()
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Shared bucket store in Redis.
#[derive(Clone)]
pub struct RedisTokenBuckets {
    connection: ConnectionManager,
    script: Arc<Script>,
}

impl RedisTokenBuckets {
    /// Connects to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url).map_err(RateLimitError::InvalidUrl)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self {
            connection,
            script: Arc::new(Script::new(TAKE_SCRIPT)),
        })
    }
}

#[async_trait]
impl TokenBucketStore for RedisTokenBuckets {
    async fn take(&self, key: &str, limit: BucketLimit, cost: u32) -> Result<bool, RateLimitError> {
        let mut connection = self.connection.clone();
        let ttl_ms = u64::try_from(limit.idle_ttl().as_millis()).unwrap_or(u64::MAX);

        let allowed: i64 = self
            .script
            .key(format!("{REDIS_KEY_PREFIX}{key}"))
            .arg(limit.refill_per_ms())
            .arg(limit.burst)
            .arg(cost)
            .arg(ttl_ms)
            .invoke_async(&mut connection)
            .await?;

        Ok(allowed == 1)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Rate limiter front end. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn TokenBucketStore>,
}

impl RateLimiter {
    /// Creates a limiter over the given store.
    pub fn new(store: Arc<dyn TokenBucketStore>) -> Self {
        Self { store }
    }

    /// Creates a limiter with an in-process store.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalTokenBuckets::new()))
    }

    /// Creates a limiter backed by Redis when `url` is set and reachable,
    /// otherwise by an in-process store.
    pub async fn connect(url: Option<&str>) -> Self {
        let Some(url) = url else {
            return Self::local();
        };

        match RedisTokenBuckets::connect(url).await {
            Ok(store) => {
                info!("Rate limiter using shared Redis store");
                Self::new(Arc::new(store))
            }
            Err(err) => {
                warn!(error = %err, "Rate limit store unavailable, using in-process buckets");
                Self::local()
            }
        }
    }

    /// Takes `cost` tokens from the bucket for `key`.
    ///
    /// Returns `false` when the bucket is short of tokens, when `rate` or
    /// `burst` is zero, or when `cost` exceeds `burst`. Store errors are
    /// logged and the call is allowed.
    pub async fn consume(&self, key: &str, rate_per_minute: u32, burst: u32, cost: u32) -> bool {
        let Some(limit) = BucketLimit::new(rate_per_minute, burst) else {
            return false;
        };
        if cost > burst {
            return false;
        }

        match self.store.take(key, limit, cost).await {
            Ok(allowed) => allowed,
            Err(err) => {
                warn!(
                    store = self.store.name(),
                    error = %err,
                    "Rate limit store failed, allowing request"
                );
                true
            }
        }
    }

    /// Removes idle buckets from the store.
    pub async fn sweep(&self) -> usize {
        self.store.sweep().await
    }

    /// Name of the active store.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Spawns a background task that sweeps idle buckets every `interval`.
    pub fn spawn_cleanup_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;
                let removed = limiter.sweep().await;
                if removed > 0 {
                    debug!(removed_count = removed, "Cleaned up idle rate limit buckets");
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::local()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .finish()
    }
}
