//! Request inspection: identity, quotas, reputation, auto-blocking, CSP and
//! security event logging.

pub mod anomaly;
pub mod csp;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod ip_intel;
pub mod patterns;
pub mod rate_limiter;
pub mod tiers;
pub mod whitelist;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyState, AnomalyVerdict, DetectorInput};
pub use csp::{
    CspAnalysis, CspPolicyBuilder, CspValidation, CspViolationReport, DeploymentMode, Nonce,
    NonceProps, analyze_csp_violation, get_nonce_from_headers, parse_csp_violation_report,
    script_nonce_props, style_nonce_props, validate_csp,
};
pub use events::{
    EventSinkConfig, RateLimitDetails, SecurityEventLogger, WebhookWorker, extract_request_info,
};
pub use gateway::{
    DecisionReason, GatewayDecision, GatewayStats, RequestContext, SecurityGateway, Verdict,
};
pub use identity::{AuthenticatedUser, KeyScope, client_ip, rate_limit_key};
pub use ip_intel::{
    GeoProvider, HttpGeoProvider, IpAnalysis, IpAssessment, IpIntelConfig, IpIntelligence,
    Reputation, RiskScore, calculate_risk_score,
};
pub use patterns::PatternDetector;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use tiers::{PathMatcher, RateLimitTier, TierName, TierRule, TierRules};
pub use whitelist::{Whitelist, parse_network};
