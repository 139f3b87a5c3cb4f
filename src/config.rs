//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults
//! suitable for a single local instance. In production, configure via
//! environment variables or a `.env` file.
//!
//! # Shared State
//!
//! - `REDIS_URL`: distributed store for counters, blacklist and behavior
//!   profiles. Unset means every instance keeps its own in-memory state.
//! - `STORE_TIMEOUT_MS`: upper bound on any single store call (default: 100)
//!
//! # Security Configuration
//!
//! - `ADMIN_API_KEY`: enables the `/admin` routes; unset disables them
//! - `RATE_LIMIT_RULES`: JSON array of extra path rules, e.g.
//!   `[{"match":"prefix","pattern":"/api/export","tier":"strict"}]`
//! - `RATE_LIMIT_WHITELIST`: comma-separated IPs or CIDR ranges
//! - `ENVIRONMENT`: `production` or `development` (controls the CSP variant)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::Severity;
use crate::security::{DeploymentMode, KeyScope, TierRule, TierRules};

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment mode (default: production)
    pub environment: DeploymentMode,

    // =========================================================================
    // Store Configuration
    // =========================================================================
    /// Redis connection URL. `None` runs on the in-memory store only.
    pub redis_url: Option<String>,

    /// Maximum pooled Redis connections (default: 16)
    pub redis_pool_size: usize,

    /// Timeout for a single store operation (default: 100ms)
    pub store_timeout: Duration,

    /// Consecutive store failures before bypassing Redis (default: 5)
    pub store_failure_threshold: u32,

    /// How long Redis is bypassed before it is probed again (default: 10s)
    pub store_recovery: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Identity requests are counted under (default: ip)
    pub rate_limit_key_scope: KeyScope,

    /// Operator rules evaluated before the built-in ones
    pub rate_limit_rules: Vec<TierRule>,

    /// IPs and CIDR ranges that bypass every check
    pub rate_limit_whitelist: Vec<String>,

    // =========================================================================
    // IP Intelligence Configuration
    // =========================================================================
    /// Geolocation lookup URL containing `{ip}`. `None` disables lookups.
    pub geo_provider_url: Option<String>,

    /// Timeout for a geolocation lookup (default: 2s)
    pub geo_timeout: Duration,

    /// How long a lookup result is cached (default: 1 hour)
    pub geo_cache_ttl: Duration,

    /// Maximum cached lookups (default: 100000)
    pub geo_cache_max_entries: usize,

    /// Idle time after which a behavior profile expires (default: 1 hour)
    pub behavior_ttl: Duration,

    // =========================================================================
    // Anomaly Detection Configuration
    // =========================================================================
    /// Strikes in distinct buckets before an IP is blocked (default: 3)
    pub anomaly_block_after: u32,

    /// First auto-block duration, doubled per repeat offense (default: 15 min)
    pub anomaly_base_block: Duration,

    /// Longest auto-block (default: 24 hours)
    pub anomaly_max_block: Duration,

    /// Standard deviations above baseline that count as a spike (default: 3.0)
    pub anomaly_z_threshold: f64,

    // =========================================================================
    // CSP Configuration
    // =========================================================================
    /// `report-uri` added to the policy
    pub csp_report_uri: Option<String>,

    /// Send `Content-Security-Policy-Report-Only` instead of enforcing
    pub csp_report_only: bool,

    /// Maximum violation report body size in bytes (default: 16KB)
    pub max_report_body_size: usize,

    // =========================================================================
    // Event Sink Configuration
    // =========================================================================
    /// Webhook receiving security events as JSON
    pub security_webhook_url: Option<String>,

    /// Lowest severity forwarded to the webhook (default: critical)
    pub security_webhook_min_severity: Severity,

    /// Timeout per webhook POST (default: 5s)
    pub webhook_timeout: Duration,

    /// Webhook POSTs allowed per minute before events are dropped (default: 60)
    pub webhook_max_per_minute: u32,

    /// Events buffered for the webhook before new ones are dropped (default: 1024)
    pub event_queue_capacity: usize,

    // =========================================================================
    // Gateway Configuration
    // =========================================================================
    /// API key for the `/admin` routes. `None` disables them.
    pub admin_api_key: Option<String>,

    /// Longest a request may wait for its inspection (default: 250ms)
    pub inspection_timeout: Duration,

    /// Interval of the background cleanup task (default: 60s)
    pub sweep_interval: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// combination is invalid.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            environment: Self::parse_env("ENVIRONMENT", DeploymentMode::Production)?,

            // Store
            redis_url: Self::optional_env("REDIS_URL"),
            redis_pool_size: Self::parse_env("REDIS_POOL_SIZE", 16)?,
            store_timeout: Duration::from_millis(Self::parse_env("STORE_TIMEOUT_MS", 100)?),
            store_failure_threshold: Self::parse_env("STORE_FAILURE_THRESHOLD", 5)?,
            store_recovery: Duration::from_secs(Self::parse_env("STORE_RECOVERY_SECS", 10)?),

            // Rate limiting
            rate_limit_key_scope: Self::parse_env("RATE_LIMIT_KEY_SCOPE", KeyScope::Ip)?,
            rate_limit_rules: Self::parse_rules()?,
            rate_limit_whitelist: Self::parse_list("RATE_LIMIT_WHITELIST"),

            // IP intelligence
            geo_provider_url: Self::optional_env("GEO_PROVIDER_URL"),
            geo_timeout: Duration::from_millis(Self::parse_env("GEO_TIMEOUT_MS", 2000)?),
            geo_cache_ttl: Duration::from_secs(Self::parse_env("GEO_CACHE_TTL_SECS", 3600)?),
            geo_cache_max_entries: Self::parse_env("GEO_CACHE_MAX_ENTRIES", 100_000)?,
            behavior_ttl: Duration::from_secs(Self::parse_env("BEHAVIOR_TTL_SECS", 3600)?),

            // Anomaly detection
            anomaly_block_after: Self::parse_env("ANOMALY_BLOCK_AFTER", 3)?,
            anomaly_base_block: Duration::from_secs(Self::parse_env(
                "ANOMALY_BASE_BLOCK_SECS",
                900,
            )?),
            anomaly_max_block: Duration::from_secs(Self::parse_env(
                "ANOMALY_MAX_BLOCK_SECS",
                86_400,
            )?),
            anomaly_z_threshold: Self::parse_env("ANOMALY_Z_THRESHOLD", 3.0)?,

            // CSP
            csp_report_uri: Self::optional_env("CSP_REPORT_URI"),
            csp_report_only: Self::parse_env("CSP_REPORT_ONLY", false)?,
            max_report_body_size: Self::parse_env("MAX_REPORT_BODY_SIZE", 16 * 1024)?, // 16KB

            // Event sink
            security_webhook_url: Self::optional_env("SECURITY_WEBHOOK_URL"),
            security_webhook_min_severity: Self::parse_env(
                "SECURITY_WEBHOOK_MIN_SEVERITY",
                Severity::Critical,
            )?,
            webhook_timeout: Duration::from_millis(Self::parse_env("WEBHOOK_TIMEOUT_MS", 5000)?),
            webhook_max_per_minute: Self::parse_env("WEBHOOK_MAX_PER_MINUTE", 60)?,
            event_queue_capacity: Self::parse_env("EVENT_QUEUE_CAPACITY", 1024)?,

            // Gateway
            admin_api_key: Self::optional_env("ADMIN_API_KEY"),
            inspection_timeout: Duration::from_millis(Self::parse_env(
                "INSPECTION_TIMEOUT_MS",
                250,
            )?),
            sweep_interval: Duration::from_secs(Self::parse_env("SWEEP_INTERVAL_SECS", 60)?),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.anomaly_base_block > self.anomaly_max_block {
            return Err(AppError::ConfigError(format!(
                "ANOMALY_BASE_BLOCK_SECS ({:?}) must be <= ANOMALY_MAX_BLOCK_SECS ({:?})",
                self.anomaly_base_block, self.anomaly_max_block
            )));
        }

        if self.anomaly_block_after < 2 {
            return Err(AppError::ConfigError(
                "ANOMALY_BLOCK_AFTER must be at least 2".to_string(),
            ));
        }

        if !(self.anomaly_z_threshold.is_finite() && self.anomaly_z_threshold > 0.0) {
            return Err(AppError::ConfigError(
                "ANOMALY_Z_THRESHOLD must be a positive number".to_string(),
            ));
        }

        for (name, value) in [
            ("STORE_TIMEOUT_MS", self.store_timeout),
            ("INSPECTION_TIMEOUT_MS", self.inspection_timeout),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("WEBHOOK_TIMEOUT_MS", self.webhook_timeout),
        ] {
            if value.is_zero() {
                return Err(AppError::ConfigError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.event_queue_capacity == 0 {
            return Err(AppError::ConfigError(
                "EVENT_QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }

        if self.max_report_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REPORT_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.geo_provider_url
            && !url.contains("{ip}")
        {
            return Err(AppError::ConfigError(
                "GEO_PROVIDER_URL must contain an {ip} placeholder".to_string(),
            ));
        }

        for entry in &self.rate_limit_whitelist {
            crate::validation::validate_ip_or_cidr(entry).map_err(|e| {
                AppError::ConfigError(format!("Invalid RATE_LIMIT_WHITELIST entry: {e}"))
            })?;
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the admin API is enabled.
    pub fn admin_enabled(&self) -> bool {
        self.admin_api_key.is_some()
    }

    /// Path rules with operator overrides first.
    pub fn tier_rules(&self) -> TierRules {
        TierRules::with_overrides(self.rate_limit_rules.clone())
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Read a variable, treating empty as unset.
    fn optional_env(name: &str) -> Option<String> {
        env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_list(name: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse_rules() -> AppResult<Vec<TierRule>> {
        Self::optional_env("RATE_LIMIT_RULES")
            .map(|raw| Self::rules_from_json(&raw))
            .transpose()
            .map(Option::unwrap_or_default)
    }

    fn rules_from_json(raw: &str) -> AppResult<Vec<TierRule>> {
        let rules: Vec<TierRule> = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid RATE_LIMIT_RULES: {e}")))?;
        Ok(rules
            .into_iter()
            .map(|r| TierRule::new(r.matcher, r.pattern, r.tier))
            .collect())
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: DeploymentMode::Production,
            // Store
            redis_url: None,
            redis_pool_size: 16,
            store_timeout: Duration::from_millis(100),
            store_failure_threshold: 5,
            store_recovery: Duration::from_secs(10),
            // Rate limiting
            rate_limit_key_scope: KeyScope::Ip,
            rate_limit_rules: Vec::new(),
            rate_limit_whitelist: Vec::new(),
            // IP intelligence
            geo_provider_url: None,
            geo_timeout: Duration::from_secs(2),
            geo_cache_ttl: Duration::from_secs(3600),
            geo_cache_max_entries: 100_000,
            behavior_ttl: Duration::from_secs(3600),
            // Anomaly detection
            anomaly_block_after: 3,
            anomaly_base_block: Duration::from_secs(900),
            anomaly_max_block: Duration::from_secs(86_400),
            anomaly_z_threshold: 3.0,
            // CSP
            csp_report_uri: None,
            csp_report_only: false,
            max_report_body_size: 16 * 1024,
            // Event sink
            security_webhook_url: None,
            security_webhook_min_severity: Severity::Critical,
            webhook_timeout: Duration::from_secs(5),
            webhook_max_per_minute: 60,
            event_queue_capacity: 1024,
            // Gateway
            admin_api_key: None,
            inspection_timeout: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(60),
            // Observability
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::security::{PathMatcher, TierName};

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.port, 3000);
        assert_eq!(config.environment, DeploymentMode::Production);
        assert!(config.redis_url.is_none());
        assert_eq!(config.store_timeout, Duration::from_millis(100));
        assert_eq!(config.security_webhook_min_severity, Severity::Critical);
        assert!(!config.admin_enabled());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_block_ordering() {
        let config = Config {
            anomaly_base_block: Duration::from_secs(7200),
            anomaly_max_block: Duration::from_secs(3600),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("ANOMALY_BASE_BLOCK_SECS"));
    }

    #[test]
    fn test_validate_single_strike_block_rejected() {
        let config = Config {
            anomaly_block_after: 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = Config {
            inspection_timeout: Duration::ZERO,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("INSPECTION_TIMEOUT_MS"));
    }

    #[test]
    fn test_validate_geo_template() {
        let config = Config {
            geo_provider_url: Some("https://geo.example.com/json".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_whitelist_entries() {
        let config = Config {
            rate_limit_whitelist: vec!["10.0.0.0/8".to_string(), "not-an-ip".to_string()],
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("RATE_LIMIT_WHITELIST"));
    }

    #[test]
    fn test_rules_from_json() {
        let rules = Config::rules_from_json(
            r#"[{"match": "prefix", "pattern": "/API/Export", "tier": "strict"}]"#,
        )
        .unwrap();

        assert_eq!(
            rules,
            vec![TierRule::new(PathMatcher::Prefix, "/api/export", TierName::Strict)]
        );

        let config = Config {
            rate_limit_rules: rules,
            ..Config::default()
        };
        assert_eq!(config.tier_rules().tier_for("/api/export/csv").name, TierName::Strict);
    }

    #[test]
    fn test_rules_from_invalid_json() {
        let result = Config::rules_from_json(r#"[{"match": "regex"}]"#);
        assert!(result.unwrap_err().to_string().contains("RATE_LIMIT_RULES"));
    }

    #[test]
    fn test_metrics_addr() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
        assert_eq!(Config::default().metrics_addr().unwrap().port(), 9090);
    }
}
