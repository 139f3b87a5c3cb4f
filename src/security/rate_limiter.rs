//! Sliding-window rate limiter with blacklist and whitelist overrides.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::identity::{KeyScope, rate_limit_key};
use super::tiers::{RateLimitTier, TierRules};
use super::whitelist::Whitelist;
use crate::store::{SecurityStore, StoreResult};
use crate::utils::now_millis;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The IP is whitelisted; nothing was counted.
    Whitelisted,
    /// Within quota; the request was counted.
    Allowed {
        tier: RateLimitTier,
        remaining: u32,
        reset_after: Duration,
    },
    /// Over quota; the request was not counted.
    Throttled {
        tier: RateLimitTier,
        count: u32,
        retry_after: Duration,
    },
    /// The IP is blacklisted for `retry_after` more.
    Blacklisted { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            RateLimitDecision::Throttled { .. } | RateLimitDecision::Blacklisted { .. }
        )
    }
}

fn blacklist_key(ip: &str) -> String {
    format!("bl:{ip}")
}

/// Per-identity quotas over a [`SecurityStore`].
///
/// Store failures never reject a request: the check is logged and the
/// request is allowed.
pub struct RateLimiter {
    store: Arc<dyn SecurityStore>,
    rules: TierRules,
    whitelist: Whitelist,
    scope: KeyScope,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        rules: TierRules,
        whitelist: Whitelist,
        scope: KeyScope,
    ) -> Self {
        Self {
            store,
            rules,
            whitelist,
            scope,
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    pub fn tier_for(&self, path: &str) -> RateLimitTier {
        self.rules.tier_for(path)
    }

    pub fn key_for(&self, ip: &str, path: &str, user_id: Option<&str>) -> String {
        rate_limit_key(ip, path, self.scope, user_id)
    }

    /// Check and count one request.
    ///
    /// Order: whitelist, blacklist, then the sliding window of the tier the
    /// path maps to.
    pub async fn check(&self, ip: &str, path: &str, user_id: Option<&str>) -> RateLimitDecision {
        if self.whitelist.contains(ip) {
            return RateLimitDecision::Whitelisted;
        }

        if let Some(retry_after) = self.blacklist_ttl(ip).await {
            return RateLimitDecision::Blacklisted { retry_after };
        }

        let tier = self.tier_for(path);
        let key = self.key_for(ip, path, user_id);
        self.hit(&key, tier).await
    }

    /// Count one request against `key` under `tier`.
    pub async fn hit(&self, key: &str, tier: RateLimitTier) -> RateLimitDecision {
        let window_key = format!("{}:{}", tier.name, key);
        match self
            .store
            .sliding_window_hit(&window_key, tier.window, tier.max_requests, now_millis())
            .await
        {
            Ok(outcome) if outcome.allowed => RateLimitDecision::Allowed {
                tier,
                remaining: tier.max_requests.saturating_sub(outcome.count),
                reset_after: outcome.reset_after,
            },
            Ok(outcome) => {
                debug!(key, tier = %tier.name, count = outcome.count, "Rate limit exceeded");
                RateLimitDecision::Throttled {
                    tier,
                    count: outcome.count,
                    retry_after: outcome.reset_after,
                }
            }
            Err(e) => {
                warn!(key, error = %e, "Rate limit check failed, allowing request");
                RateLimitDecision::Allowed {
                    tier,
                    remaining: tier.max_requests,
                    reset_after: tier.window,
                }
            }
        }
    }

    /// Reject every request from `ip` until `duration` has passed.
    pub async fn blacklist_ip(&self, ip: &str, duration: Duration) -> StoreResult<()> {
        self.store
            .set_flag(&blacklist_key(ip), duration.max(Duration::from_millis(1)))
            .await
    }

    /// Lift a blacklist entry. Returns `true` if one existed.
    pub async fn unblock_ip(&self, ip: &str) -> StoreResult<bool> {
        self.store.clear_flag(&blacklist_key(ip)).await
    }

    /// Remaining blacklist time, `None` when not blacklisted or when the
    /// store cannot tell.
    pub async fn blacklist_ttl(&self, ip: &str) -> Option<Duration> {
        match self.store.flag_ttl(&blacklist_key(ip)).await {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!(ip, error = %e, "Blacklist lookup failed, treating IP as not blacklisted");
                None
            }
        }
    }
}
