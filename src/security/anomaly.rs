//! Auto-blocking with hysteresis.
//!
//! Each IP moves through three states:
//!
//! ```text
//!            elevated score or strike             block_after strikes
//!   Normal ─────────────────────────────► Watch ─────────────────────► Blocked
//!     ▲                                     │                            │
//!     │       calm_to_release calm,         │                            │
//!     └──────── good reputation ────────────┘                            │
//!     └───────────────────── blacklist TTL expired ──────────────────────┘
//! ```
//!
//! A *strike* is a request-rate spike against the IP's own baseline (EWMA
//! mean and variance over fixed buckets), a `bad` reputation, or enough
//! recent security events. Strikes count at most once per bucket, so a
//! block always needs anomalous signal in several distinct buckets. Block
//! durations double with every offense up to a ceiling.
//!
//! Detector state lives in this process only. The blacklist it writes goes
//! through the shared store and so applies on every instance.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use super::events::SecurityEventLogger;
use super::ip_intel::{Reputation, RiskScore};
use super::rate_limiter::RateLimiter;
use crate::metrics;
use crate::models::{SecurityEvent, SecurityEventType, Severity};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyState {
    #[default]
    Normal,
    Watch,
    Blocked,
}

impl AnomalyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyState::Normal => "normal",
            AnomalyState::Watch => "watch",
            AnomalyState::Blocked => "blocked",
        }
    }
}

/// Detector tunables.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Rate-baseline bucket width.
    pub bucket: Duration,
    /// EWMA smoothing factor in `(0, 1]`.
    pub ewma_alpha: f64,
    /// Standard deviations above the mean that count as a spike.
    pub z_threshold: f64,
    /// Completed buckets before the baseline is trusted.
    pub warmup_samples: u32,
    /// Smallest bucket count that can be a spike.
    pub min_spike: u32,
    /// Bucket count that is a spike even during warmup.
    pub hard_ceiling: u32,
    /// Recent event weight that counts as a strike.
    pub history_threshold: u32,
    /// Strikes in distinct buckets before blocking.
    pub block_after: u32,
    /// Consecutive calm observations that release a watched IP.
    pub calm_to_release: u32,
    pub base_block: Duration,
    pub max_block: Duration,
    /// Idle time after which per-IP state, including offense count, is
    /// forgotten.
    pub idle_ttl: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            bucket: Duration::from_secs(10),
            ewma_alpha: 0.3,
            z_threshold: 3.0,
            warmup_samples: 3,
            min_spike: 30,
            hard_ceiling: 100,
            history_threshold: 8,
            block_after: 3,
            calm_to_release: 5,
            base_block: Duration::from_secs(900),
            max_block: Duration::from_secs(86_400),
            idle_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Signals for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorInput {
    pub score: RiskScore,
    pub reputation: Reputation,
    /// Severity-weighted recent event count for the IP.
    pub event_weight: u32,
}

/// State change caused by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    EnteredWatch,
    Blocked { duration: Duration, offense: u32 },
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyVerdict {
    pub state: AnomalyState,
    pub transition: Option<Transition>,
    /// Whether this observation carried a strike signal.
    pub strike: bool,
}

#[derive(Debug)]
struct Tracker {
    state: AnomalyState,
    origin: Instant,
    bucket: u64,
    bucket_count: u32,
    mean: f64,
    variance: f64,
    samples: u32,
    strikes: u32,
    last_strike_bucket: Option<u64>,
    calm: u32,
    offenses: u32,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl Tracker {
    fn new(now: Instant) -> Self {
        Self {
            state: AnomalyState::Normal,
            origin: now,
            bucket: 0,
            bucket_count: 0,
            mean: 0.0,
            variance: 0.0,
            samples: 0,
            strikes: 0,
            last_strike_bucket: None,
            calm: 0,
            offenses: 0,
            blocked_until: None,
            last_seen: now,
        }
    }

    fn feed(&mut self, value: f64, alpha: f64) {
        if self.samples == 0 {
            self.mean = value;
            self.variance = 0.0;
        } else {
            let diff = value - self.mean;
            let increment = alpha * diff;
            self.mean += increment;
            self.variance = (1.0 - alpha) * (self.variance + diff * increment);
        }
        self.samples = self.samples.saturating_add(1);
    }

    /// Count one request, rolling the bucket forward if needed.
    fn count_request(&mut self, now: Instant, config: &AnomalyConfig) {
        let bucket_ms = config.bucket.as_millis().max(1);
        let elapsed = now.saturating_duration_since(self.origin).as_millis();
        let bucket = u64::try_from(elapsed / bucket_ms).unwrap_or(u64::MAX);

        if bucket != self.bucket {
            if self.bucket_count > 0 || self.samples > 0 {
                self.feed(f64::from(self.bucket_count), config.ewma_alpha);
            }
            // Idle buckets pull the baseline down, bounded so a long pause
            // does not erase it entirely.
            let idle = bucket.saturating_sub(self.bucket).saturating_sub(1).min(6);
            for _ in 0..idle {
                self.feed(0.0, config.ewma_alpha);
            }
            self.bucket = bucket;
            self.bucket_count = 0;
        }
        self.bucket_count = self.bucket_count.saturating_add(1);
    }

    /// Strikes count at most once per bucket.
    fn register_strike(&mut self) {
        if self.last_strike_bucket != Some(self.bucket) {
            self.strikes = self.strikes.saturating_add(1);
            self.last_strike_bucket = Some(self.bucket);
        }
    }

    fn is_spike(&self, config: &AnomalyConfig) -> bool {
        let count = self.bucket_count;
        if self.samples < config.warmup_samples {
            return count >= config.hard_ceiling;
        }
        let std_dev = self.variance.sqrt().max(1.0);
        let z = (f64::from(count) - self.mean) / std_dev;
        count >= config.min_spike && z > config.z_threshold
    }

    fn block_duration(&self, config: &AnomalyConfig) -> Duration {
        let factor = 1u32.checked_shl(self.offenses).unwrap_or(u32::MAX);
        config.base_block.saturating_mul(factor).min(config.max_block)
    }
}

/// Per-IP state machine driving automatic blacklisting.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    trackers: DashMap<String, Tracker>,
    rate_limiter: Arc<RateLimiter>,
    events: SecurityEventLogger,
}

impl AnomalyDetector {
    pub fn new(
        config: AnomalyConfig,
        rate_limiter: Arc<RateLimiter>,
        events: SecurityEventLogger,
    ) -> Self {
        Self {
            config,
            trackers: DashMap::new(),
            rate_limiter,
            events,
        }
    }

    /// Observe one request and apply any resulting block.
    ///
    /// If writing the blacklist fails the block is abandoned and the IP
    /// stays on watch.
    pub async fn evaluate(&self, ip: &str, input: DetectorInput) -> AnomalyVerdict {
        // Only real addresses are blocked; "unknown" is shared by every
        // request without forwarding headers.
        if ip.parse::<IpAddr>().is_err() {
            return AnomalyVerdict {
                state: AnomalyState::Normal,
                transition: None,
                strike: false,
            };
        }

        let verdict = self.observe_at(ip, input, Instant::now());
        match verdict.transition {
            Some(Transition::EnteredWatch) => {
                self.events.log(
                    SecurityEvent::new(
                        SecurityEventType::AnomalyDetected,
                        Severity::Medium,
                        ip,
                        format!("IP placed on watch (risk score {})", input.score),
                    )
                    .with_details(serde_json::json!({
                        "risk_score": input.score.value(),
                        "reputation": input.reputation.as_str(),
                        "event_weight": input.event_weight,
                    })),
                );
            }
            Some(Transition::Blocked { duration, offense }) => {
                if let Err(e) = self.rate_limiter.blacklist_ip(ip, duration).await {
                    warn!(ip, error = %e, "Auto-block could not be stored, leaving IP on watch");
                    self.demote_to_watch(ip);
                    return AnomalyVerdict {
                        state: AnomalyState::Watch,
                        transition: None,
                        strike: verdict.strike,
                    };
                }
                metrics::record_auto_block();
                self.events.log(
                    SecurityEvent::new(
                        SecurityEventType::IpAutoBlocked,
                        Severity::Critical,
                        ip,
                        format!(
                            "IP auto-blocked for {}s after sustained anomalous activity",
                            duration.as_secs()
                        ),
                    )
                    .with_details(serde_json::json!({
                        "duration_secs": duration.as_secs(),
                        "offense": offense,
                        "risk_score": input.score.value(),
                        "reputation": input.reputation.as_str(),
                    })),
                );
            }
            Some(Transition::Released) => {
                info!(ip, "IP released from watch");
            }
            None => {}
        }
        verdict
    }

    /// Pure state transition at `now`, without side effects.
    pub fn observe_at(&self, ip: &str, input: DetectorInput, now: Instant) -> AnomalyVerdict {
        let config = &self.config;
        let mut tracker = self
            .trackers
            .entry(ip.to_string())
            .or_insert_with(|| Tracker::new(now));
        tracker.last_seen = now;

        if tracker.state == AnomalyState::Blocked {
            if tracker.blocked_until.is_some_and(|until| now < until) {
                return AnomalyVerdict {
                    state: AnomalyState::Blocked,
                    transition: None,
                    strike: false,
                };
            }
            tracker.state = AnomalyState::Normal;
            tracker.blocked_until = None;
            tracker.strikes = 0;
            tracker.last_strike_bucket = None;
            tracker.calm = 0;
        }

        tracker.count_request(now, config);

        let elevated = input.reputation != Reputation::Good;
        let strike = tracker.is_spike(config)
            || input.reputation == Reputation::Bad
            || input.event_weight >= config.history_threshold;

        let transition = match tracker.state {
            AnomalyState::Normal if strike || elevated => {
                tracker.state = AnomalyState::Watch;
                tracker.calm = 0;
                tracker.strikes = 0;
                tracker.last_strike_bucket = None;
                if strike {
                    tracker.register_strike();
                }
                Some(Transition::EnteredWatch)
            }
            AnomalyState::Normal => None,
            AnomalyState::Watch if strike => {
                tracker.calm = 0;
                tracker.register_strike();
                if tracker.strikes >= config.block_after {
                    let duration = tracker.block_duration(config);
                    tracker.offenses = tracker.offenses.saturating_add(1);
                    tracker.state = AnomalyState::Blocked;
                    tracker.blocked_until = Some(now + duration);
                    tracker.strikes = 0;
                    tracker.last_strike_bucket = None;
                    Some(Transition::Blocked {
                        duration,
                        offense: tracker.offenses,
                    })
                } else {
                    None
                }
            }
            AnomalyState::Watch if elevated => {
                tracker.calm = 0;
                None
            }
            AnomalyState::Watch => {
                tracker.calm = tracker.calm.saturating_add(1);
                if tracker.calm >= config.calm_to_release {
                    tracker.state = AnomalyState::Normal;
                    tracker.strikes = 0;
                    tracker.last_strike_bucket = None;
                    tracker.calm = 0;
                    Some(Transition::Released)
                } else {
                    None
                }
            }
            // Handled above
            AnomalyState::Blocked => None,
        };

        AnomalyVerdict {
            state: tracker.state,
            transition,
            strike,
        }
    }

    /// Current state for an IP, `Normal` if untracked.
    pub fn state(&self, ip: &str) -> AnomalyState {
        let now = Instant::now();
        self.trackers
            .get(ip)
            .map(|t| match (t.state, t.blocked_until) {
                (AnomalyState::Blocked, Some(until)) if until <= now => AnomalyState::Normal,
                (state, _) => state,
            })
            .unwrap_or_default()
    }

    /// Operator override: forget the IP's state and strikes. Past offenses
    /// are kept so a repeat offender still gets a longer block.
    pub fn reset(&self, ip: &str) {
        if let Some(mut tracker) = self.trackers.get_mut(ip) {
            tracker.state = AnomalyState::Normal;
            tracker.blocked_until = None;
            tracker.strikes = 0;
            tracker.last_strike_bucket = None;
            tracker.calm = 0;
        }
    }

    /// Forget IPs idle for longer than `idle_ttl` and not currently blocked.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.config.idle_ttl;
        let before = self.trackers.len();
        self.trackers.retain(|_, t| {
            let blocked = t.blocked_until.is_some_and(|until| until > now);
            blocked || now.saturating_duration_since(t.last_seen) < idle_ttl
        });
        before.saturating_sub(self.trackers.len())
    }

    pub fn tracked(&self) -> usize {
        self.trackers.len()
    }

    fn demote_to_watch(&self, ip: &str) {
        if let Some(mut tracker) = self.trackers.get_mut(ip) {
            tracker.state = AnomalyState::Watch;
            tracker.blocked_until = None;
            tracker.offenses = tracker.offenses.saturating_sub(1);
        }
    }
}
