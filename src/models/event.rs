use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Console marker for this severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "🔵",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }

    /// Weight used when summing recent event history for an IP.
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 4,
            Severity::Critical => 8,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Kind of security-relevant decision or observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    RateLimitExceeded,
    BlacklistedRequest,
    IpBlacklisted,
    IpUnblocked,
    AnomalyDetected,
    IpAutoBlocked,
    SuspiciousRequest,
    CspViolation,
    AuthFailure,
    StoreUnavailable,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::BlacklistedRequest => "blacklisted_request",
            SecurityEventType::IpBlacklisted => "ip_blacklisted",
            SecurityEventType::IpUnblocked => "ip_unblocked",
            SecurityEventType::AnomalyDetected => "anomaly_detected",
            SecurityEventType::IpAutoBlocked => "ip_auto_blocked",
            SecurityEventType::SuspiciousRequest => "suspicious_request",
            SecurityEventType::CspViolation => "csp_violation",
            SecurityEventType::AuthFailure => "auth_failure",
            SecurityEventType::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded security decision. Built once, never mutated after logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub message: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// RFC 3339 / ISO-8601 when serialized.
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        ip: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity,
            message: message.into(),
            ip: ip.into(),
            user_agent: None,
            user_id: None,
            endpoint: None,
            method: None,
            details: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach request metadata.
    pub fn with_request(mut self, info: &RequestInfo) -> Self {
        self.user_agent = info.user_agent.clone();
        self.endpoint = Some(info.endpoint.clone());
        self.method = Some(info.method.clone());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Request metadata attached to events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub ip: String,
    pub user_agent: Option<String>,
    pub endpoint: String,
    pub method: String,
}
