//! Circuit breaker guarding the shared store.
//!
//! While the breaker is open the fallback store skips the primary backend
//! entirely and serves from process memory, so a dead Redis costs one
//! timeout per `failure_threshold` requests instead of one per request.
//!
//! ```text
//!   Closed ──(failure_threshold consecutive errors)──► Open
//!     ▲                                                  │
//!     │ success_threshold probes ok        open_duration │
//!     │                                                  ▼
//!     └──────────────────────────────────────────── HalfOpen
//!                    any probe error ──► Open
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Primary store in use.
    Closed,
    /// Primary store bypassed.
    Open,
    /// Probing the primary store again.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive primary failures before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes again.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_duration,
        }
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Thread-safe breaker shared by every store call.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    times_opened: AtomicU32,
    calls_bypassed: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
            times_opened: AtomicU32::new(0),
            calls_bypassed: AtomicU64::new(0),
        }
    }

    /// Whether the next call may go to the primary store.
    ///
    /// An open breaker whose `open_duration` has elapsed moves to half-open
    /// and lets the call through as a probe.
    pub async fn allow_request(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    if inner
                        .opened_at
                        .is_some_and(|at| at.elapsed() < self.config.open_duration)
                    {
                        self.calls_bypassed.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;
        if inner.state != CircuitState::Open {
            return true;
        }
        if inner
            .opened_at
            .is_some_and(|at| at.elapsed() < self.config.open_duration)
        {
            self.calls_bypassed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inner.state = CircuitState::HalfOpen;
        inner.consecutive_successes = 0;
        info!("Store circuit half-open, probing primary backend");
        true
    }

    /// Record a primary success.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                debug!(
                    successes = inner.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "Store probe succeeded"
                );
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.consecutive_failures = 0;
                    info!("Store circuit closed, primary backend recovered");
                }
            }
            // A call admitted just before the breaker opened finished late.
            CircuitState::Open => {}
        }
    }

    /// Record a primary failure.
    ///
    /// Returns `true` when this failure opened the breaker.
    pub async fn record_failure(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures < self.config.failure_threshold {
                    debug!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Store call failed"
                    );
                    return false;
                }
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!(
                    failures = inner.consecutive_failures,
                    open_duration = ?self.config.open_duration,
                    "Store circuit opened, serving from local memory"
                );
                true
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!("Store probe failed, circuit reopened");
                true
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                false
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Calls routed straight to the fallback because the breaker was open.
    pub fn calls_bypassed(&self) -> u64 {
        self.calls_bypassed.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
