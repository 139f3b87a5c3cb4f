//! Redis-backed store shared by every gateway instance.
//!
//! Each trait operation is one Lua script (or one single-key command), so
//! counters stay exact when many gateways hit the same key. Keys that one
//! script touches share a `{hash tag}` and therefore a cluster slot.
//!
//! Key layout, with the default `gw` prefix:
//!
//! | key                                   | type   | contents                      |
//! |---------------------------------------|--------|-------------------------------|
//! | `gw:rl:{<key>}:<window index>`        | string | fixed-window request count    |
//! | `gw:flag:<key>`                       | string | `1`, expires with the flag    |
//! | `gw:behavior:{<ip>}:meta`             | hash   | count, first_seen, last_seen  |
//! | `gw:behavior:{<ip>}:endpoints`        | set    | distinct paths                |
//! | `gw:behavior:{<ip>}:agents`           | set    | distinct user agents          |
//! | `gw:behavior:{<ip>}:countries`        | set    | distinct country codes        |
//! | `gw:behavior:{<ip>}:patterns`         | list   | pattern tags, newest last     |

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use tracing::warn;

use super::{
    BehaviorUpdate, MAX_TRACKED_MEMBERS, MAX_TRACKED_PATTERNS, SecurityStore, StoreError,
    StoreResult, WindowOutcome, reset_after, window_index, window_millis,
};
use crate::models::{IpBehavior, SuspiciousPattern};
use crate::utils::{now_millis, timestamp_from_millis};

const SLIDING_WINDOW_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local previous = tonumber(redis.call('GET', KEYS[2]) or '0')
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local elapsed = (now % window) / window
local weighted = math.ceil(previous * (1 - elapsed)) + current
if weighted + 1 > limit then
    return {0, weighted}
end
if redis.call('INCR', KEYS[1]) == 1 then
    redis.call('PEXPIRE', KEYS[1], window * 2 + 1000)
end
return {1, weighted + 1}
"#;

const RECORD_BEHAVIOR_SCRIPT: &str = r#"
local now = ARGV[1]
local ttl = ARGV[2]
local cap = tonumber(ARGV[3])
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
redis.call('HSETNX', KEYS[1], 'first_seen', now)
redis.call('HSET', KEYS[1], 'last_seen', now)
local function add(key, member)
    if member ~= '' and redis.call('SCARD', key) < cap then
        redis.call('SADD', key, member)
    end
end
add(KEYS[2], ARGV[4])
add(KEYS[3], ARGV[5])
add(KEYS[4], ARGV[6])
for i = 1, 5 do
    redis.call('PEXPIRE', KEYS[i], ttl)
end
return {
    count,
    redis.call('HGET', KEYS[1], 'first_seen'),
    now,
    redis.call('SMEMBERS', KEYS[2]),
    redis.call('SMEMBERS', KEYS[3]),
    redis.call('SMEMBERS', KEYS[4]),
    redis.call('LRANGE', KEYS[5], 0, -1)
}
"#;

const READ_BEHAVIOR_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
return {
    tonumber(redis.call('HGET', KEYS[1], 'count') or '0'),
    redis.call('HGET', KEYS[1], 'first_seen'),
    redis.call('HGET', KEYS[1], 'last_seen'),
    redis.call('SMEMBERS', KEYS[2]),
    redis.call('SMEMBERS', KEYS[3]),
    redis.call('SMEMBERS', KEYS[4]),
    redis.call('LRANGE', KEYS[5], 0, -1)
}
"#;

const PUSH_PATTERN_SCRIPT: &str = r#"
redis.call('HSETNX', KEYS[1], 'count', 0)
redis.call('HSETNX', KEYS[1], 'first_seen', ARGV[2])
redis.call('HSETNX', KEYS[1], 'last_seen', ARGV[2])
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('LTRIM', KEYS[2], -tonumber(ARGV[4]), -1)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('PEXPIRE', KEYS[2], ARGV[3])
return 1
"#;

/// Raw profile as returned by the behavior scripts.
type BehaviorRow = (
    u64,
    String,
    String,
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
);

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Pool size.
    pub max_connections: usize,
    /// Prefix for every key written by the gateway.
    pub key_prefix: String,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 16,
            key_prefix: "gw".to_string(),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// [`SecurityStore`] on a pooled Redis connection.
pub struct RedisStore {
    pool: Pool,
    prefix: String,
    sliding_window: redis::Script,
    record_behavior: redis::Script,
    read_behavior: redis::Script,
    push_pattern: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisStore {
    /// Build the connection pool.
    ///
    /// No connection is opened here; call [`SecurityStore::ping`] to check
    /// reachability.
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| StoreError::Unavailable(format!("invalid redis config: {e}")))?
            .max_size(config.max_connections.max(1))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build redis pool: {e}")))?;

        Ok(Self {
            pool,
            prefix: config.key_prefix,
            sliding_window: redis::Script::new(SLIDING_WINDOW_SCRIPT),
            record_behavior: redis::Script::new(RECORD_BEHAVIOR_SCRIPT),
            read_behavior: redis::Script::new(READ_BEHAVIOR_SCRIPT),
            push_pattern: redis::Script::new(PUSH_PATTERN_SCRIPT),
        })
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to get connection: {e}")))
    }

    fn window_key(&self, key: &str, index: u64) -> String {
        format!("{}:rl:{{{}}}:{}", self.prefix, key, index)
    }

    fn flag_key(&self, key: &str) -> String {
        format!("{}:flag:{}", self.prefix, key)
    }

    fn behavior_keys(&self, ip: &str) -> [String; 5] {
        let base = format!("{}:behavior:{{{}}}", self.prefix, ip);
        [
            format!("{base}:meta"),
            format!("{base}:endpoints"),
            format!("{base}:agents"),
            format!("{base}:countries"),
            format!("{base}:patterns"),
        ]
    }
}

fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Protocol(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    crate::utils::duration_millis(ttl).max(1)
}

fn parse_millis(raw: &str, context: &str) -> u64 {
    raw.parse().unwrap_or_else(|_| {
        warn!(context, raw, "Non-numeric timestamp in behavior profile");
        now_millis()
    })
}

fn behavior_from_row(row: BehaviorRow) -> IpBehavior {
    let (count, first_seen, last_seen, endpoints, agents, countries, patterns) = row;
    IpBehavior {
        request_count: count,
        unique_endpoints: endpoints.into_iter().collect::<HashSet<_>>(),
        unique_user_agents: agents.into_iter().collect(),
        countries: countries.into_iter().collect(),
        first_seen: timestamp_from_millis(parse_millis(&first_seen, "first_seen"), "first_seen"),
        last_seen: timestamp_from_millis(parse_millis(&last_seen, "last_seen"), "last_seen"),
        suspicious_patterns: patterns
            .iter()
            .filter_map(|tag| match tag.parse::<SuspiciousPattern>() {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(error = %e, "Skipping unknown pattern tag");
                    None
                }
            })
            .collect(),
    }
}

#[async_trait]
impl SecurityStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_ms: u64,
    ) -> StoreResult<WindowOutcome> {
        let index = window_index(now_ms, window);
        let mut conn = self.conn().await?;

        let reply: Vec<i64> = self
            .sliding_window
            .key(self.window_key(key, index))
            .key(self.window_key(key, index.saturating_sub(1)))
            .arg(limit)
            .arg(now_ms)
            .arg(window_millis(window))
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        match reply.as_slice() {
            [allowed, count] => Ok(WindowOutcome {
                allowed: *allowed == 1,
                count: u32::try_from(*count).unwrap_or(u32::MAX),
                reset_after: reset_after(now_ms, window),
            }),
            other => Err(StoreError::Protocol(format!(
                "sliding window script returned {} values",
                other.len()
            ))),
        }
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(self.flag_key(key))
            .arg(1)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut *conn)
            .await
            .map_err(map_redis_error)
    }

    async fn flag_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn().await?;
        let pttl: i64 = redis::cmd("PTTL")
            .arg(self.flag_key(key))
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        // -2: missing, -1: no expiry (never written by the gateway)
        Ok(match pttl {
            -1 => Some(Duration::MAX),
            ms if ms > 0 => Some(Duration::from_millis(ms.unsigned_abs())),
            _ => None,
        })
    }

    async fn clear_flag(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.flag_key(key))
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn record_behavior(&self, update: &BehaviorUpdate<'_>) -> StoreResult<IpBehavior> {
        let keys = self.behavior_keys(update.ip);
        let mut conn = self.conn().await?;

        let mut invocation = self.record_behavior.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        let row: BehaviorRow = invocation
            .arg(update.now_ms)
            .arg(ttl_millis(update.ttl))
            .arg(MAX_TRACKED_MEMBERS)
            .arg(update.endpoint)
            .arg(update.user_agent)
            .arg(update.country.unwrap_or(""))
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        Ok(behavior_from_row(row))
    }

    async fn push_pattern(
        &self,
        ip: &str,
        pattern: SuspiciousPattern,
        ttl: Duration,
    ) -> StoreResult<()> {
        let [meta, _, _, _, patterns] = self.behavior_keys(ip);
        let mut conn = self.conn().await?;

        self.push_pattern
            .key(meta)
            .key(patterns)
            .arg(pattern.as_str())
            .arg(now_millis())
            .arg(ttl_millis(ttl))
            .arg(MAX_TRACKED_PATTERNS)
            .invoke_async::<i64>(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn behavior(&self, ip: &str) -> StoreResult<Option<IpBehavior>> {
        let keys = self.behavior_keys(ip);
        let mut conn = self.conn().await?;

        let mut invocation = self.read_behavior.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        let row: Option<BehaviorRow> = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        Ok(row.map(behavior_from_row))
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}
