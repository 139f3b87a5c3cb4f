//! Per-request inspection pipeline.
//!
//! ```text
//!   rate limiter ──► pattern scan ──► IP intelligence ──► anomaly detector
//!   (may throttle     (tags the IP)    (record + score)    (may auto-block)
//!    or block)
//! ```
//!
//! The pipeline runs on its own task so telemetry and behavior recording
//! complete even if the client goes away. A panic or a timeout inside it
//! lets the request through.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, Uri, header};
use tracing::{debug, error, warn};

use super::anomaly::{AnomalyDetector, DetectorInput, Transition};
use super::events::{RateLimitDetails, SecurityEventLogger};
use super::identity::client_ip;
use super::ip_intel::{IpIntelligence, Reputation, RiskScore};
use super::patterns::PatternDetector;
use super::rate_limiter::{RateLimitDecision, RateLimiter};
use super::tiers::RateLimitTier;
use crate::metrics;
use crate::models::{RequestInfo, SecurityEvent, SecurityEventType, Severity};
use crate::utils::duration_millis;

/// What the pipeline needs to know about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: String,
    pub path: String,
    pub query: Option<String>,
    pub method: String,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn new(headers: &HeaderMap, method: &Method, uri: &Uri, user_id: Option<&str>) -> Self {
        Self {
            ip: client_ip(headers).into_owned(),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            method: method.as_str().to_string(),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            user_id: user_id.map(str::to_string),
        }
    }

    pub fn request_info(&self) -> RequestInfo {
        RequestInfo {
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            endpoint: self.path.clone(),
            method: self.method.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Throttle,
    Block,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Throttle => "throttle",
            Verdict::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Whitelisted,
    WithinQuota,
    RateLimited,
    Blacklisted,
    AutoBlocked,
    FailedOpen,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Whitelisted => "whitelisted",
            DecisionReason::WithinQuota => "within_quota",
            DecisionReason::RateLimited => "rate_limited",
            DecisionReason::Blacklisted => "blacklisted",
            DecisionReason::AutoBlocked => "auto_blocked",
            DecisionReason::FailedOpen => "failed_open",
        }
    }
}

/// Allow/deny outcome with the quota and risk context behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayDecision {
    pub verdict: Verdict,
    pub reason: DecisionReason,
    pub tier: Option<RateLimitTier>,
    pub remaining: Option<u32>,
    pub retry_after: Option<Duration>,
    pub risk: Option<RiskScore>,
}

impl GatewayDecision {
    fn allow(reason: DecisionReason) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason,
            tier: None,
            remaining: None,
            retry_after: None,
            risk: None,
        }
    }

    fn block(reason: DecisionReason, retry_after: Duration) -> Self {
        Self {
            verdict: Verdict::Block,
            reason,
            tier: None,
            remaining: None,
            retry_after: Some(retry_after),
            risk: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

/// Decision counters since startup.
#[derive(Debug, Default)]
pub struct GatewayCounters {
    allowed: AtomicU64,
    throttled: AtomicU64,
    blocked: AtomicU64,
    failed_open: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub allowed: u64,
    pub throttled: u64,
    pub blocked: u64,
    pub failed_open: u64,
}

impl GatewayCounters {
    fn record(&self, decision: &GatewayDecision) {
        let counter = match decision.verdict {
            Verdict::Allow => &self.allowed,
            Verdict::Throttle => &self.throttled,
            Verdict::Block => &self.blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if decision.reason == DecisionReason::FailedOpen {
            self.failed_open.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> GatewayStats {
        GatewayStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            failed_open: self.failed_open.load(Ordering::Relaxed),
        }
    }
}

struct Pipeline {
    rate_limiter: Arc<RateLimiter>,
    intel: Arc<IpIntelligence>,
    detector: Arc<AnomalyDetector>,
    patterns: Arc<PatternDetector>,
    events: SecurityEventLogger,
}

impl Pipeline {
    async fn inspect(&self, ctx: RequestContext) -> GatewayDecision {
        let ip = ctx.ip.as_str();

        let (tier, remaining) = match self
            .rate_limiter
            .check(ip, &ctx.path, ctx.user_id.as_deref())
            .await
        {
            RateLimitDecision::Whitelisted => {
                return GatewayDecision::allow(DecisionReason::Whitelisted);
            }
            RateLimitDecision::Blacklisted { retry_after } => {
                self.events.log(
                    SecurityEvent::new(
                        SecurityEventType::BlacklistedRequest,
                        Severity::Low,
                        ip,
                        "Request from blacklisted IP rejected",
                    )
                    .with_request(&ctx.request_info()),
                );
                return GatewayDecision::block(DecisionReason::Blacklisted, retry_after);
            }
            RateLimitDecision::Throttled {
                tier,
                count,
                retry_after,
            } => {
                self.events.log_rate_limit_exceeded(
                    &ctx.request_info(),
                    RateLimitDetails {
                        count,
                        limit: tier.max_requests,
                        tier: tier.name.to_string(),
                    },
                );
                return GatewayDecision {
                    verdict: Verdict::Throttle,
                    reason: DecisionReason::RateLimited,
                    tier: Some(tier),
                    remaining: Some(0),
                    retry_after: Some(retry_after),
                    risk: None,
                };
            }
            RateLimitDecision::Allowed {
                tier, remaining, ..
            } => (tier, remaining),
        };

        let allowed = |risk: Option<RiskScore>| GatewayDecision {
            verdict: Verdict::Allow,
            reason: DecisionReason::WithinQuota,
            tier: Some(tier),
            remaining: Some(remaining),
            retry_after: None,
            risk,
        };

        let found = self
            .patterns
            .detect(&ctx.path, ctx.query.as_deref(), ctx.user_agent.as_deref());
        if !found.is_empty() {
            for pattern in &found {
                if let Err(e) = self.intel.record_suspicious_pattern(ip, *pattern).await {
                    warn!(ip, pattern = %pattern, error = %e, "Failed to record suspicious pattern");
                }
            }
            let tags: Vec<&str> = found.iter().map(|p| p.as_str()).collect();
            self.events.log(
                SecurityEvent::new(
                    SecurityEventType::SuspiciousRequest,
                    Severity::High,
                    ip,
                    format!("Suspicious request pattern: {}", tags.join(", ")),
                )
                .with_request(&ctx.request_info())
                .with_details(serde_json::json!({ "patterns": tags })),
            );
        }

        let assessment = match self
            .intel
            .assess(ip, &ctx.path, ctx.user_agent.as_deref().unwrap_or_default())
            .await
        {
            Ok(assessment) => assessment,
            Err(e) => {
                warn!(ip, error = %e, "IP assessment failed, skipping anomaly check");
                return allowed(None);
            }
        };
        metrics::record_risk_score(assessment.score.value());

        let verdict = self
            .detector
            .evaluate(
                ip,
                DetectorInput {
                    score: assessment.score,
                    reputation: assessment.reputation,
                    event_weight: self.events.recent_weight(ip),
                },
            )
            .await;

        if let Some(Transition::Blocked { duration, .. }) = verdict.transition {
            let mut decision = GatewayDecision::block(DecisionReason::AutoBlocked, duration);
            decision.risk = Some(assessment.score);
            return decision;
        }

        if assessment.reputation != Reputation::Good {
            debug!(
                ip,
                score = %assessment.score,
                reputation = %assessment.reputation,
                state = verdict.state.as_str(),
                "Elevated risk"
            );
        }
        allowed(Some(assessment.score))
    }
}

/// Entry point used by the middleware and the verify endpoint.
#[derive(Clone)]
pub struct SecurityGateway {
    pipeline: Arc<Pipeline>,
    timeout: Duration,
    counters: Arc<GatewayCounters>,
}

impl SecurityGateway {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        intel: Arc<IpIntelligence>,
        detector: Arc<AnomalyDetector>,
        patterns: Arc<PatternDetector>,
        events: SecurityEventLogger,
        timeout: Duration,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                rate_limiter,
                intel,
                detector,
                patterns,
                events,
            }),
            timeout,
            counters: Arc::new(GatewayCounters::default()),
        }
    }

    /// Inspect one request. Never fails: internal faults allow the request.
    pub async fn decide(&self, ctx: RequestContext) -> GatewayDecision {
        let start = Instant::now();
        let ip = ctx.ip.clone();
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move { pipeline.inspect(ctx).await });

        let decision = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!(ip, error = %e, "Request inspection aborted, allowing request");
                GatewayDecision::allow(DecisionReason::FailedOpen)
            }
            Err(_) => {
                warn!(
                    ip,
                    timeout_ms = duration_millis(self.timeout),
                    "Request inspection timed out, allowing request"
                );
                GatewayDecision::allow(DecisionReason::FailedOpen)
            }
        };

        self.counters.record(&decision);
        metrics::record_decision(
            decision.verdict.as_str(),
            decision.tier.map_or("none", |t| t.name.as_str()),
            decision.reason.as_str(),
        );
        metrics::record_inspection_duration(start.elapsed().as_secs_f64());
        decision
    }

    pub fn stats(&self) -> GatewayStats {
        self.counters.snapshot()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.pipeline.rate_limiter
    }

    pub fn intel(&self) -> &Arc<IpIntelligence> {
        &self.pipeline.intel
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.pipeline.detector
    }

    pub fn events(&self) -> &SecurityEventLogger {
        &self.pipeline.events
    }
}
