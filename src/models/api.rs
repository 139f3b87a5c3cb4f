use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::IpBehavior;
use crate::security::{AnomalyState, IpAnalysis, Reputation};

/// Request to blacklist an IP.
#[derive(Debug, Deserialize)]
pub struct BlacklistRequest {
    /// IP address to block
    pub ip: String,
    /// Block duration in seconds
    #[serde(default = "default_blacklist_secs")]
    pub duration_secs: u64,
    /// Operator note, copied into the security event
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_blacklist_secs() -> u64 {
    3600
}

/// Request to add an IP or CIDR range to the whitelist.
#[derive(Debug, Deserialize)]
pub struct WhitelistRequest {
    /// IP address or CIDR range (e.g. `10.0.0.0/8`)
    pub entry: String,
}

/// Result of an admin mutation.
#[derive(Debug, Serialize)]
pub struct AdminActionResponse {
    pub success: bool,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
}

/// Everything the gateway knows about one IP.
#[derive(Debug, Serialize)]
pub struct IpReport {
    pub ip: String,
    pub whitelisted: bool,
    /// Remaining blacklist time, absent when not blacklisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklisted_for_secs: Option<u64>,
    pub analysis: Option<IpAnalysis>,
    pub behavior: Option<IpBehavior>,
    pub risk_score: u8,
    pub reputation: Reputation,
    pub anomaly_state: AnomalyState,
}

/// Body returned by the forward-auth decision endpoint.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub decision: String,
    pub reason: String,
    pub tier: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" while running on the local fallback store
    pub status: String,
    /// Backend currently serving shared state
    pub store_backend: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Statistics response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub requests_allowed: u64,
    pub requests_throttled: u64,
    pub requests_blocked: u64,
    pub inspections_failed_open: u64,
    pub events_logged: u64,
    pub events_dropped: u64,
    pub tracked_ips: usize,
    pub store_circuit: String,
}
