//! IP reputation: geolocation/anonymizer flags, behavior profiles and the
//! 0-100 risk score.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{IpBehavior, SuspiciousPattern};
use crate::store::{BehaviorUpdate, SecurityStore, StoreResult};
use crate::utils::now_millis;

/// Static reputation flags and location for one IP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpAnalysis {
    pub is_vpn: bool,
    pub is_proxy: bool,
    pub is_tor: bool,
    pub is_hosting: bool,
    /// ISO 3166-1 alpha-2 code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// Risk score in `0..=100`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RiskScore(u8);

impl RiskScore {
    pub const MAX: RiskScore = RiskScore(100);

    /// Clamp any value into range.
    pub fn new(value: u32) -> Self {
        Self(u8::try_from(value.min(100)).unwrap_or(100))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for RiskScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse reputation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reputation {
    Good,
    Suspicious,
    Bad,
}

impl Reputation {
    /// `< 40` good, `40..70` suspicious, `>= 70` bad.
    pub fn from_score(score: RiskScore) -> Self {
        match score.value() {
            0..40 => Reputation::Good,
            40..70 => Reputation::Suspicious,
            _ => Reputation::Bad,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reputation::Good => "good",
            Reputation::Suspicious => "suspicious",
            Reputation::Bad => "bad",
        }
    }
}

impl fmt::Display for Reputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Score contributions.
const VPN_WEIGHT: u32 = 25;
const PROXY_WEIGHT: u32 = 25;
const TOR_WEIGHT: u32 = 40;
const HOSTING_WEIGHT: u32 = 15;
const FLOOD_RATE: f64 = 300.0;
const FLOOD_WEIGHT: u32 = 20;
const HIGH_RATE: f64 = 100.0;
const HIGH_RATE_WEIGHT: u32 = 10;
const SCAN_ENDPOINTS: usize = 100;
const SCAN_WEIGHT: u32 = 20;
const UA_ROTATION: usize = 10;
const UA_ROTATION_WEIGHT: u32 = 15;
const MULTI_COUNTRY_WEIGHT: u32 = 25;
const PATTERN_BASE_WEIGHT: u32 = 20;
const PATTERN_EXTRA_WEIGHT: u32 = 5;
const PATTERN_MAX_WEIGHT: u32 = 35;

/// Additive risk score, saturating at 100. No signals gives exactly 0.
pub fn calculate_risk_score(analysis: &IpAnalysis, behavior: Option<&IpBehavior>) -> RiskScore {
    let mut score = 0u32;

    if analysis.is_vpn {
        score += VPN_WEIGHT;
    }
    if analysis.is_proxy {
        score += PROXY_WEIGHT;
    }
    if analysis.is_tor {
        score += TOR_WEIGHT;
    }
    if analysis.is_hosting {
        score += HOSTING_WEIGHT;
    }

    if let Some(behavior) = behavior {
        let rate = behavior.requests_per_minute();
        if rate > FLOOD_RATE {
            score += FLOOD_WEIGHT;
        } else if rate > HIGH_RATE {
            score += HIGH_RATE_WEIGHT;
        }
        if behavior.unique_endpoints.len() >= SCAN_ENDPOINTS {
            score += SCAN_WEIGHT;
        }
        if behavior.unique_user_agents.len() >= UA_ROTATION {
            score += UA_ROTATION_WEIGHT;
        }
        if behavior.countries.len() > 1 {
            score += MULTI_COUNTRY_WEIGHT;
        }
        let kinds = u32::try_from(behavior.distinct_patterns()).unwrap_or(u32::MAX);
        if kinds > 0 {
            score += (PATTERN_BASE_WEIGHT + PATTERN_EXTRA_WEIGHT.saturating_mul(kinds - 1))
                .min(PATTERN_MAX_WEIGHT);
        }
    }

    RiskScore::new(score)
}

/// Whether an address is worth an external lookup.
///
/// Loopback, private, link-local, unique-local and unspecified addresses,
/// and anything that does not parse (including `"unknown"`), are not.
pub fn public_ip(ip: &str) -> Option<IpAddr> {
    let addr: IpAddr = ip.trim().parse().ok()?;
    let routable = match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => return public_ip(&v4.to_string()),
            None => {
                !(v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local())
            }
        },
    };
    routable.then_some(addr)
}

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("geolocation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("geolocation provider returned HTTP {0}")]
    Status(u16),

    #[error("geolocation lookup failed: {0}")]
    Lookup(String),
}

/// Source of [`IpAnalysis`] for public addresses.
#[async_trait]
pub trait GeoProvider: Send + Sync + 'static {
    async fn lookup(&self, ip: IpAddr) -> Result<IpAnalysis, GeoError>;
}

/// JSON geolocation API reached through a URL template containing `{ip}`.
///
/// Understands the common field names (`countryCode`, `lat`, `lon`,
/// `proxy`, `hosting`, `vpn`, `tor`); missing flags read as `false`.
pub struct HttpGeoProvider {
    client: reqwest::Client,
    url_template: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, alias = "country_code")]
    country_code: Option<String>,
    #[serde(default, alias = "latitude")]
    lat: Option<f64>,
    #[serde(default, alias = "longitude")]
    lon: Option<f64>,
    #[serde(default, alias = "is_proxy")]
    proxy: bool,
    #[serde(default, alias = "is_hosting", alias = "datacenter")]
    hosting: bool,
    #[serde(default, alias = "is_vpn")]
    vpn: bool,
    #[serde(default, alias = "is_tor")]
    tor: bool,
}

impl HttpGeoProvider {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, GeoError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    fn url_for(&self, ip: IpAddr) -> String {
        self.url_template.replace("{ip}", &ip.to_string())
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn lookup(&self, ip: IpAddr) -> Result<IpAnalysis, GeoError> {
        let response = self.client.get(self.url_for(ip)).send().await?;
        if !response.status().is_success() {
            return Err(GeoError::Status(response.status().as_u16()));
        }

        let body: GeoResponse = response.json().await?;
        if body.status.as_deref().is_some_and(|s| s != "success") {
            return Err(GeoError::Lookup(
                body.message.unwrap_or_else(|| "provider reported failure".to_string()),
            ));
        }

        Ok(IpAnalysis {
            is_vpn: body.vpn,
            is_proxy: body.proxy,
            is_tor: body.tor,
            is_hosting: body.hosting,
            country: body.country_code.map(|c| c.to_ascii_uppercase()),
            latitude: body.lat,
            longitude: body.lon,
        })
    }
}

struct CachedAnalysis {
    analysis: Option<IpAnalysis>,
    expires_at: Instant,
}

/// Tunables for [`IpIntelligence`].
#[derive(Debug, Clone)]
pub struct IpIntelConfig {
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// Inactivity after which a behavior profile may be evicted.
    pub behavior_ttl: Duration,
}

impl Default for IpIntelConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            cache_max_entries: 100_000,
            behavior_ttl: Duration::from_secs(3600),
        }
    }
}

/// Full picture of one IP at request time.
#[derive(Debug, Clone, PartialEq)]
pub struct IpAssessment {
    pub analysis: Option<IpAnalysis>,
    pub behavior: IpBehavior,
    pub score: RiskScore,
    pub reputation: Reputation,
}

/// Behavior tracking and scoring over a shared store, with a local cache
/// in front of the geolocation provider.
pub struct IpIntelligence {
    store: Arc<dyn SecurityStore>,
    provider: Option<Arc<dyn GeoProvider>>,
    cache: DashMap<IpAddr, CachedAnalysis>,
    config: IpIntelConfig,
}

impl IpIntelligence {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        provider: Option<Arc<dyn GeoProvider>>,
        config: IpIntelConfig,
    ) -> Self {
        Self {
            store,
            provider,
            cache: DashMap::new(),
            config,
        }
    }

    /// Location and anonymizer flags, `None` for non-public addresses and
    /// when no provider is configured or the lookup failed.
    ///
    /// Results, including failures, are cached so an IP costs at most one
    /// provider call per TTL.
    pub async fn get_ip_location(&self, ip: &str) -> Option<IpAnalysis> {
        let addr = public_ip(ip)?;
        let provider = self.provider.as_ref()?;

        if let Some(cached) = self.cache.get(&addr)
            && cached.expires_at > Instant::now()
        {
            return cached.analysis.clone();
        }

        let (analysis, ttl) = match provider.lookup(addr).await {
            Ok(analysis) => (Some(analysis), self.config.cache_ttl),
            Err(e) => {
                warn!(ip = %addr, error = %e, "IP geolocation lookup failed");
                (None, (self.config.cache_ttl / 10).max(Duration::from_secs(30)))
            }
        };

        if self.cache.len() < self.config.cache_max_entries || self.cache.contains_key(&addr) {
            self.cache.insert(
                addr,
                CachedAnalysis {
                    analysis: analysis.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        } else {
            debug!(ip = %addr, "Geolocation cache full, result not cached");
        }
        analysis
    }

    /// Fold one request into the IP's behavior profile.
    pub async fn record_ip_behavior(
        &self,
        ip: &str,
        endpoint: &str,
        user_agent: &str,
        country: Option<&str>,
    ) -> StoreResult<IpBehavior> {
        self.store
            .record_behavior(&BehaviorUpdate {
                ip,
                endpoint,
                user_agent,
                country,
                now_ms: now_millis(),
                ttl: self.config.behavior_ttl,
            })
            .await
    }

    pub async fn record_suspicious_pattern(
        &self,
        ip: &str,
        pattern: SuspiciousPattern,
    ) -> StoreResult<()> {
        self.store
            .push_pattern(ip, pattern, self.config.behavior_ttl)
            .await
    }

    pub async fn behavior(&self, ip: &str) -> StoreResult<Option<IpBehavior>> {
        self.store.behavior(ip).await
    }

    /// Look up, record and score one request.
    pub async fn assess(
        &self,
        ip: &str,
        endpoint: &str,
        user_agent: &str,
    ) -> StoreResult<IpAssessment> {
        let analysis = self.get_ip_location(ip).await;
        let country = analysis.as_ref().and_then(|a| a.country.as_deref());
        let behavior = self
            .record_ip_behavior(ip, endpoint, user_agent, country)
            .await?;

        let score = calculate_risk_score(&analysis.clone().unwrap_or_default(), Some(&behavior));
        Ok(IpAssessment {
            analysis,
            behavior,
            score,
            reputation: Reputation::from_score(score),
        })
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn purge_cache(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.expires_at > now);
        before.saturating_sub(self.cache.len())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::MemoryStore;

    struct FixedProvider {
        analysis: IpAnalysis,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GeoProvider for FixedProvider {
        async fn lookup(&self, _ip: IpAddr) -> Result<IpAnalysis, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.analysis.clone())
        }
    }

    fn intel_with(provider: Option<Arc<dyn GeoProvider>>) -> IpIntelligence {
        IpIntelligence::new(
            Arc::new(MemoryStore::new()),
            provider,
            IpIntelConfig::default(),
        )
    }

    fn behavior() -> IpBehavior {
        IpBehavior::new(chrono::Utc::now())
    }

    #[test]
    fn test_no_signals_scores_zero() {
        assert_eq!(calculate_risk_score(&IpAnalysis::default(), None).value(), 0);
        assert_eq!(
            calculate_risk_score(&IpAnalysis::default(), Some(&behavior())).value(),
            0
        );
    }

    #[test]
    fn test_static_flag_ordering() {
        let tor = calculate_risk_score(
            &IpAnalysis {
                is_tor: true,
                ..Default::default()
            },
            None,
        );
        let hosting = calculate_risk_score(
            &IpAnalysis {
                is_hosting: true,
                ..Default::default()
            },
            None,
        );
        let vpn = calculate_risk_score(
            &IpAnalysis {
                is_vpn: true,
                ..Default::default()
            },
            None,
        );
        assert!(tor > hosting);
        assert!(tor.value() > 30);
        assert!(vpn.value() > 20);
        assert!(hosting.value() > 10);
    }

    #[test]
    fn test_score_saturates() {
        let analysis = IpAnalysis {
            is_vpn: true,
            is_proxy: true,
            is_tor: true,
            is_hosting: true,
            ..Default::default()
        };
        let mut b = behavior();
        b.request_count = 100_000;
        for i in 0..150 {
            b.unique_endpoints.insert(format!("/p/{i}"));
        }
        for i in 0..20 {
            b.unique_user_agents.insert(format!("ua-{i}"));
        }
        b.countries.extend(["US".to_string(), "RU".to_string()]);
        for pattern in SuspiciousPattern::ALL {
            b.push_pattern(pattern);
        }

        assert_eq!(calculate_risk_score(&analysis, Some(&b)), RiskScore::MAX);
    }

    #[test]
    fn test_behavior_signals() {
        let mut b = behavior();
        b.countries.extend(["US".to_string(), "DE".to_string()]);
        assert!(calculate_risk_score(&IpAnalysis::default(), Some(&b)).value() > 20);

        let mut b = behavior();
        b.push_pattern(SuspiciousPattern::SqlInjection);
        assert_eq!(calculate_risk_score(&IpAnalysis::default(), Some(&b)).value(), 20);
        b.push_pattern(SuspiciousPattern::Xss);
        assert_eq!(calculate_risk_score(&IpAnalysis::default(), Some(&b)).value(), 25);
    }

    #[test]
    fn test_reputation_boundaries() {
        assert_eq!(Reputation::from_score(RiskScore::new(0)), Reputation::Good);
        assert_eq!(Reputation::from_score(RiskScore::new(39)), Reputation::Good);
        assert_eq!(Reputation::from_score(RiskScore::new(40)), Reputation::Suspicious);
        assert_eq!(Reputation::from_score(RiskScore::new(69)), Reputation::Suspicious);
        assert_eq!(Reputation::from_score(RiskScore::new(70)), Reputation::Bad);
        assert_eq!(Reputation::from_score(RiskScore::new(100)), Reputation::Bad);
        assert_eq!(RiskScore::new(250).value(), 100);
    }

    #[test]
    fn test_public_ip_filter() {
        assert!(public_ip("127.0.0.1").is_none());
        assert!(public_ip("192.168.1.1").is_none());
        assert!(public_ip("10.2.3.4").is_none());
        assert!(public_ip("172.16.0.1").is_none());
        assert!(public_ip("unknown").is_none());
        assert!(public_ip("::1").is_none());
        assert!(public_ip("fd00::1").is_none());
        assert!(public_ip("::ffff:192.168.1.1").is_none());
        assert!(public_ip("8.8.8.8").is_some());
        assert!(public_ip("2001:4860:4860::8888").is_some());
    }

    #[tokio::test]
    async fn test_private_addresses_skip_provider() {
        let provider = Arc::new(FixedProvider {
            analysis: IpAnalysis::default(),
            calls: AtomicU32::new(0),
        });
        let intel = intel_with(Some(provider.clone()));

        assert!(intel.get_ip_location("127.0.0.1").await.is_none());
        assert!(intel.get_ip_location("192.168.1.1").await.is_none());
        assert!(intel.get_ip_location("unknown").await.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lookups_are_cached() {
        let provider = Arc::new(FixedProvider {
            analysis: IpAnalysis {
                is_hosting: true,
                country: Some("NL".into()),
                ..Default::default()
            },
            calls: AtomicU32::new(0),
        });
        let intel = intel_with(Some(provider.clone()));

        for _ in 0..3 {
            let analysis = intel.get_ip_location("8.8.8.8").await.unwrap();
            assert!(analysis.is_hosting);
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(intel.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_record_behavior_is_cumulative() {
        let intel = intel_with(None);
        intel
            .record_ip_behavior("8.8.4.4", "/a", "curl/8", Some("US"))
            .await
            .unwrap();
        let behavior = intel
            .record_ip_behavior("8.8.4.4", "/b", "firefox", Some("US"))
            .await
            .unwrap();

        assert_eq!(behavior.request_count, 2);
        assert_eq!(behavior.unique_endpoints.len(), 2);
        assert_eq!(behavior.unique_user_agents.len(), 2);
        assert_eq!(behavior.countries.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_recording_loses_nothing() {
        let intel = Arc::new(intel_with(None));
        let mut handles = Vec::new();
        for i in 0..40 {
            let intel = Arc::clone(&intel);
            handles.push(tokio::spawn(async move {
                intel
                    .record_ip_behavior("8.8.4.4", &format!("/p/{}", i % 4), "ua", None)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let behavior = intel.behavior("8.8.4.4").await.unwrap().unwrap();
        assert_eq!(behavior.request_count, 40);
        assert_eq!(behavior.unique_endpoints.len(), 4);
    }

    #[tokio::test]
    async fn test_assess_combines_flags_and_behavior() {
        let provider = Arc::new(FixedProvider {
            analysis: IpAnalysis {
                is_tor: true,
                is_proxy: true,
                ..Default::default()
            },
            calls: AtomicU32::new(0),
        });
        let intel = intel_with(Some(provider));

        let assessment = intel.assess("1.1.1.1", "/", "ua").await.unwrap();
        assert_eq!(assessment.score.value(), 65);
        assert_eq!(assessment.reputation, Reputation::Suspicious);
        assert_eq!(assessment.behavior.request_count, 1);
    }
}
