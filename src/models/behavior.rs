use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{BehaviorUpdate, MAX_TRACKED_MEMBERS, MAX_TRACKED_PATTERNS};
use crate::utils::timestamp_from_millis;

/// Attack signature detected in a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspiciousPattern {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    ScannerProbe,
}

impl SuspiciousPattern {
    pub const ALL: [SuspiciousPattern; 5] = [
        SuspiciousPattern::SqlInjection,
        SuspiciousPattern::Xss,
        SuspiciousPattern::PathTraversal,
        SuspiciousPattern::CommandInjection,
        SuspiciousPattern::ScannerProbe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuspiciousPattern::SqlInjection => "sql_injection",
            SuspiciousPattern::Xss => "xss",
            SuspiciousPattern::PathTraversal => "path_traversal",
            SuspiciousPattern::CommandInjection => "command_injection",
            SuspiciousPattern::ScannerProbe => "scanner_probe",
        }
    }
}

impl fmt::Display for SuspiciousPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuspiciousPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown pattern tag '{s}'"))
    }
}

/// Rolling behavioral profile of one client IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpBehavior {
    /// Requests observed since the profile was created.
    pub request_count: u64,
    pub unique_endpoints: HashSet<String>,
    pub unique_user_agents: HashSet<String>,
    pub countries: HashSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Detected pattern tags in detection order.
    pub suspicious_patterns: Vec<SuspiciousPattern>,
}

impl IpBehavior {
    /// Empty profile first seen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            request_count: 0,
            unique_endpoints: HashSet::new(),
            unique_user_agents: HashSet::new(),
            countries: HashSet::new(),
            first_seen: now,
            last_seen: now,
            suspicious_patterns: Vec::new(),
        }
    }

    /// Fold one request into the profile.
    pub fn observe(&mut self, update: &BehaviorUpdate<'_>) {
        let now = timestamp_from_millis(update.now_ms, "behavior");
        self.request_count = self.request_count.saturating_add(1);
        insert_capped(&mut self.unique_endpoints, update.endpoint);
        insert_capped(&mut self.unique_user_agents, update.user_agent);
        if let Some(country) = update.country {
            insert_capped(&mut self.countries, country);
        }
        self.last_seen = now;
    }

    /// Append a pattern tag, keeping only the most recent ones.
    pub fn push_pattern(&mut self, pattern: SuspiciousPattern) {
        self.suspicious_patterns.push(pattern);
        if self.suspicious_patterns.len() > MAX_TRACKED_PATTERNS {
            let excess = self.suspicious_patterns.len() - MAX_TRACKED_PATTERNS;
            self.suspicious_patterns.drain(..excess);
        }
    }

    /// Time between the first and the latest observation.
    pub fn observed_for(&self) -> Duration {
        (self.last_seen - self.first_seen)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Average request rate over the observation period.
    ///
    /// Periods shorter than a minute count as a full minute so that the
    /// first few requests of a new client do not look like a flood.
    pub fn requests_per_minute(&self) -> f64 {
        let minutes = (self.observed_for().as_secs_f64() / 60.0).max(1.0);
        self.request_count as f64 / minutes
    }

    /// Number of distinct pattern kinds seen.
    pub fn distinct_patterns(&self) -> usize {
        self.suspicious_patterns
            .iter()
            .collect::<HashSet<_>>()
            .len()
    }
}

fn insert_capped(set: &mut HashSet<String>, value: &str) {
    if value.is_empty() || set.contains(value) || set.len() >= MAX_TRACKED_MEMBERS {
        return;
    }
    set.insert(value.to_string());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn update<'a>(endpoint: &'a str, ua: &'a str, now_ms: u64) -> BehaviorUpdate<'a> {
        BehaviorUpdate {
            ip: "203.0.113.9",
            endpoint,
            user_agent: ua,
            country: Some("DE"),
            now_ms,
            ttl: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_observe_accumulates() {
        let mut behavior = IpBehavior::new(timestamp_from_millis(1_000, "test"));
        behavior.observe(&update("/a", "curl", 1_000));
        behavior.observe(&update("/b", "curl", 2_000));
        behavior.observe(&update("/b", "firefox", 3_000));

        assert_eq!(behavior.request_count, 3);
        assert_eq!(behavior.unique_endpoints.len(), 2);
        assert_eq!(behavior.unique_user_agents.len(), 2);
        assert_eq!(behavior.countries.len(), 1);
        assert_eq!(behavior.observed_for(), Duration::from_secs(2));
    }

    #[test]
    fn test_empty_values_are_not_tracked() {
        let mut behavior = IpBehavior::new(Utc::now());
        behavior.observe(&update("", "", 0));
        assert!(behavior.unique_endpoints.is_empty());
        assert!(behavior.unique_user_agents.is_empty());
    }

    #[test]
    fn test_pattern_history_is_bounded() {
        let mut behavior = IpBehavior::new(Utc::now());
        for _ in 0..(MAX_TRACKED_PATTERNS + 5) {
            behavior.push_pattern(SuspiciousPattern::Xss);
        }
        behavior.push_pattern(SuspiciousPattern::SqlInjection);

        assert_eq!(behavior.suspicious_patterns.len(), MAX_TRACKED_PATTERNS);
        assert_eq!(
            behavior.suspicious_patterns.last(),
            Some(&SuspiciousPattern::SqlInjection)
        );
        assert_eq!(behavior.distinct_patterns(), 2);
    }

    #[test]
    fn test_pattern_tag_round_trip_through_str() {
        for pattern in SuspiciousPattern::ALL {
            assert_eq!(pattern.as_str().parse::<SuspiciousPattern>(), Ok(pattern));
        }
        assert!("nope".parse::<SuspiciousPattern>().is_err());
    }

    #[test]
    fn test_requests_per_minute_floor() {
        let mut behavior = IpBehavior::new(timestamp_from_millis(0, "test"));
        for i in 0..30 {
            behavior.observe(&update("/", "ua", i * 100));
        }
        // 3 seconds of traffic still counts as one minute
        assert!((behavior.requests_per_minute() - 30.0).abs() < f64::EPSILON);
    }
}
