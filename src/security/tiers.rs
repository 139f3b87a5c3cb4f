//! Endpoint-to-quota classification.
//!
//! Rules are plain data evaluated in order; the first match wins and
//! unmatched paths fall through to [`TierName::Permissive`]. The built-in
//! list puts the specific categories ahead of the generic `/api` prefix.
//! Operators can prepend their own rules through `RATE_LIMIT_RULES`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Window shared by every tier.
pub const TIER_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    /// Authentication and account recovery.
    Strict,
    /// Mutating endpoints.
    Moderate,
    /// Read APIs.
    Standard,
    /// Public pages.
    Permissive,
}

impl TierName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Strict => "strict",
            TierName::Moderate => "moderate",
            TierName::Standard => "standard",
            TierName::Permissive => "permissive",
        }
    }

    /// Quota for this tier.
    pub fn tier(self) -> RateLimitTier {
        let max_requests = match self {
            TierName::Strict => 5,
            TierName::Moderate => 60,
            TierName::Standard => 300,
            TierName::Permissive => 1000,
        };
        RateLimitTier {
            name: self,
            window: TIER_WINDOW,
            max_requests,
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(TierName::Strict),
            "moderate" => Ok(TierName::Moderate),
            "standard" => Ok(TierName::Standard),
            "permissive" => Ok(TierName::Permissive),
            other => Err(format!("unknown rate limit tier '{other}'")),
        }
    }
}

/// A named quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitTier {
    pub name: TierName,
    pub window: Duration,
    pub max_requests: u32,
}

/// How a rule's pattern is compared against the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMatcher {
    /// Pattern appears anywhere in the path.
    Contains,
    /// Pattern equals one `/`-separated segment.
    Segment,
    /// Path starts with the pattern at a segment boundary.
    Prefix,
    /// Path ends with the pattern.
    Suffix,
}

/// One classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    #[serde(rename = "match")]
    pub matcher: PathMatcher,
    pub pattern: String,
    pub tier: TierName,
}

impl TierRule {
    pub fn new(matcher: PathMatcher, pattern: impl Into<String>, tier: TierName) -> Self {
        Self {
            matcher,
            pattern: pattern.into().to_ascii_lowercase(),
            tier,
        }
    }

    /// Whether this rule applies to an already-lowercased path.
    fn matches(&self, path: &str) -> bool {
        let pattern = self.pattern.as_str();
        match self.matcher {
            PathMatcher::Contains => path.contains(pattern),
            PathMatcher::Segment => path.split('/').any(|segment| segment == pattern),
            PathMatcher::Prefix => match path.strip_prefix(pattern) {
                Some(rest) => rest.is_empty() || pattern.ends_with('/') || rest.starts_with('/'),
                None => false,
            },
            PathMatcher::Suffix => path.ends_with(pattern),
        }
    }
}

/// Ordered rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRules {
    rules: Vec<TierRule>,
}

impl Default for TierRules {
    fn default() -> Self {
        use PathMatcher::{Contains, Prefix, Segment};
        use TierName::{Moderate, Standard, Strict};

        Self {
            rules: vec![
                TierRule::new(Contains, "login", Strict),
                TierRule::new(Contains, "register", Strict),
                TierRule::new(Contains, "reset-password", Strict),
                TierRule::new(Segment, "create", Moderate),
                TierRule::new(Segment, "update", Moderate),
                TierRule::new(Segment, "delete", Moderate),
                TierRule::new(Prefix, "/api", Standard),
            ],
        }
    }
}

impl TierRules {
    /// Built-in rules preceded by `extra`.
    pub fn with_overrides(extra: Vec<TierRule>) -> Self {
        let mut rules: Vec<TierRule> = extra
            .into_iter()
            .map(|rule| TierRule::new(rule.matcher, rule.pattern, rule.tier))
            .collect();
        rules.extend(Self::default().rules);
        Self { rules }
    }

    pub fn rules(&self) -> &[TierRule] {
        &self.rules
    }

    /// Quota for a request path. Query strings are ignored.
    pub fn tier_for(&self, path: &str) -> RateLimitTier {
        let path = path.split('?').next().unwrap_or(path).to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&path))
            .map_or(TierName::Permissive, |rule| rule.tier)
            .tier()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_share_window_and_are_ordered() {
        let tiers = [
            TierName::Strict.tier(),
            TierName::Moderate.tier(),
            TierName::Standard.tier(),
            TierName::Permissive.tier(),
        ];
        assert!(tiers.iter().all(|t| t.window == Duration::from_millis(60_000)));
        assert!(tiers.windows(2).all(|w| w[0].max_requests < w[1].max_requests));
        assert_eq!(tiers.map(|t| t.max_requests), [5, 60, 300, 1000]);
    }

    #[test]
    fn test_builtin_classification() {
        let rules = TierRules::default();
        assert_eq!(rules.tier_for("/api/login").name, TierName::Strict);
        assert_eq!(rules.tier_for("/api/products/create").name, TierName::Moderate);
        assert_eq!(rules.tier_for("/api/products").name, TierName::Standard);
        assert_eq!(rules.tier_for("/").name, TierName::Permissive);
    }

    #[test]
    fn test_specific_rules_win_over_api_prefix() {
        let rules = TierRules::default();
        assert_eq!(rules.tier_for("/api/auth/reset-password").name, TierName::Strict);
        assert_eq!(rules.tier_for("/api/orders/42/delete").name, TierName::Moderate);
        assert_eq!(rules.tier_for("/register").name, TierName::Strict);
    }

    #[test]
    fn test_matching_is_case_insensitive_and_ignores_query() {
        let rules = TierRules::default();
        assert_eq!(rules.tier_for("/API/Login").name, TierName::Strict);
        assert_eq!(rules.tier_for("/api/products?sort=create").name, TierName::Standard);
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let rules = TierRules::default();
        assert_eq!(rules.tier_for("/api").name, TierName::Standard);
        assert_eq!(rules.tier_for("/apiary").name, TierName::Permissive);
        // "create" must be a whole segment
        assert_eq!(rules.tier_for("/recreate").name, TierName::Permissive);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let extra: Vec<TierRule> = serde_json::from_str(
            r#"[{"match": "prefix", "pattern": "/api/search", "tier": "strict"},
                {"match": "suffix", "pattern": ".php", "tier": "strict"}]"#,
        )
        .unwrap();
        let rules = TierRules::with_overrides(extra);

        assert_eq!(rules.tier_for("/api/search/items").name, TierName::Strict);
        assert_eq!(rules.tier_for("/wp-admin/index.php").name, TierName::Strict);
        assert_eq!(rules.tier_for("/api/products").name, TierName::Standard);
        assert_eq!(rules.rules().len(), 9);
    }
}
