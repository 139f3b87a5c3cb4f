//! Shared security state: sliding-window counters, blacklist flags and
//! per-IP behavior profiles.
//!
//! Every component that needs shared mutable state receives an
//! `Arc<dyn SecurityStore>` instead of reaching for process-global maps.
//!
//! ```text
//!             ┌───────────────────────────────┐
//!             │         FallbackStore         │
//!             │  timeout + circuit breaker    │
//!             └───────┬───────────────┬───────┘
//!                     │ primary       │ on failure / open circuit
//!                     ▼               ▼
//!             ┌──────────────┐  ┌──────────────┐
//!             │  RedisStore  │  │ MemoryStore  │
//!             │ (all nodes)  │  │ (this process│
//!             └──────────────┘  └──────────────┘
//! ```
//!
//! Each operation is a single atomic step on the backend (a Lua script on
//! Redis, a shard-locked entry update in memory), so concurrent requests for
//! the same key never lose increments.

mod circuit_breaker;
mod fallback;
mod memory;
mod redis;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fallback::FallbackStore;
pub use memory::MemoryStore;
pub use redis::{RedisStore, RedisStoreConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{IpBehavior, SuspiciousPattern};

/// Maximum members kept per behavior set.
///
/// Scoring thresholds top out around 100 distinct endpoints, so anything
/// beyond this only costs memory.
pub const MAX_TRACKED_MEMBERS: usize = 1024;

/// Maximum number of pattern tags retained per IP (most recent kept).
pub const MAX_TRACKED_PATTERNS: usize = 32;

/// Errors raised by a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("unexpected store response: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of one sliding-window hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the hit fit in the quota (and was counted).
    pub allowed: bool,
    /// Weighted request count in the trailing window, including this hit if
    /// it was allowed.
    pub count: u32,
    /// Time until the current fixed window rolls over.
    pub reset_after: Duration,
}

/// One observation to fold into an IP's behavior profile.
#[derive(Debug, Clone)]
pub struct BehaviorUpdate<'a> {
    pub ip: &'a str,
    pub endpoint: &'a str,
    pub user_agent: &'a str,
    pub country: Option<&'a str>,
    /// Observation time in milliseconds since the Unix epoch.
    pub now_ms: u64,
    /// Inactivity after which the profile may be evicted.
    pub ttl: Duration,
}

/// Backend for all shared gateway state.
#[async_trait]
pub trait SecurityStore: Send + Sync + 'static {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Count a request against `key` using a sliding window of `window`.
    ///
    /// The previous fixed window's count is weighted by how much of it still
    /// overlaps the trailing window. If the weighted count plus this request
    /// would exceed `limit`, the hit is rejected and nothing is counted.
    async fn sliding_window_hit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_ms: u64,
    ) -> StoreResult<WindowOutcome>;

    /// Set a flag that expires after `ttl`.
    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Remaining lifetime of a flag, `None` if it is not set.
    async fn flag_ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Remove a flag. Returns `true` if it existed.
    async fn clear_flag(&self, key: &str) -> StoreResult<bool>;

    /// Create or update the behavior profile for `update.ip`.
    async fn record_behavior(&self, update: &BehaviorUpdate<'_>) -> StoreResult<IpBehavior>;

    /// Append a detected pattern tag to an IP's profile.
    async fn push_pattern(
        &self,
        ip: &str,
        pattern: SuspiciousPattern,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Read a behavior profile without modifying it.
    async fn behavior(&self, ip: &str) -> StoreResult<Option<IpBehavior>>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;
}

/// Index of the fixed window containing `now_ms`.
pub(crate) fn window_index(now_ms: u64, window: Duration) -> u64 {
    let window_ms = window_millis(window);
    now_ms / window_ms
}

/// Window length in milliseconds, never zero.
pub(crate) fn window_millis(window: Duration) -> u64 {
    crate::utils::duration_millis(window).max(1)
}

/// Weighted sliding-window count from two fixed-window counters.
///
/// Rounds the previous window's share up so that a rollover never lets
/// an extra request through.
pub(crate) fn weighted_count(previous: u32, current: u32, now_ms: u64, window: Duration) -> u32 {
    let window_ms = window_millis(window);
    let elapsed = (now_ms % window_ms) as f64 / window_ms as f64;
    let carried = (f64::from(previous) * (1.0 - elapsed)).ceil() as u32;
    carried.saturating_add(current)
}

/// Time left in the fixed window containing `now_ms`.
pub(crate) fn reset_after(now_ms: u64, window: Duration) -> Duration {
    let window_ms = window_millis(window);
    Duration::from_millis(window_ms - (now_ms % window_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_weighted_count_at_window_start_carries_everything() {
        assert_eq!(weighted_count(10, 0, 60_000, MINUTE), 10);
    }

    #[test]
    fn test_weighted_count_halfway() {
        assert_eq!(weighted_count(10, 2, 90_000, MINUTE), 7);
    }

    #[test]
    fn test_weighted_count_rounds_up() {
        // 3 * (1 - 0.5) = 1.5 -> 2
        assert_eq!(weighted_count(3, 0, 30_000, MINUTE), 2);
    }

    #[test]
    fn test_reset_after() {
        assert_eq!(reset_after(61_000, MINUTE), Duration::from_secs(59));
        assert_eq!(window_index(61_000, MINUTE), 1);
    }
}
