//! Process-local store.
//!
//! Used on its own for single-node deployments and as the fallback when the
//! shared backend is unreachable. Entries carry their own expiry; readers
//! ignore expired entries and the background sweeper removes them.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{
    BehaviorUpdate, SecurityStore, StoreResult, WindowOutcome, reset_after, weighted_count,
    window_index,
};
use crate::models::{IpBehavior, SuspiciousPattern};
use crate::utils::{now_millis, timestamp_from_millis};

#[derive(Debug)]
struct WindowCounter {
    index: u64,
    current: u32,
    previous: u32,
    expires_at: Instant,
}

#[derive(Debug)]
struct BehaviorEntry {
    behavior: IpBehavior,
    expires_at: Instant,
}

/// In-memory implementation of [`SecurityStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, WindowCounter>,
    flags: DashMap<String, Instant>,
    behaviors: DashMap<String, BehaviorEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len() + self.flags.len() + self.behaviors.len();

        self.windows.retain(|_, counter| counter.expires_at > now);
        self.flags.retain(|_, expires_at| *expires_at > now);
        self.behaviors.retain(|_, entry| entry.expires_at > now);

        let after = self.windows.len() + self.flags.len() + self.behaviors.len();
        before.saturating_sub(after)
    }

    /// Number of IPs with a live behavior profile.
    pub fn tracked_ips(&self) -> usize {
        self.behaviors.len()
    }
}

#[async_trait]
impl SecurityStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_ms: u64,
    ) -> StoreResult<WindowOutcome> {
        let index = window_index(now_ms, window);
        let expires_at = Instant::now() + window.saturating_mul(2);

        let mut counter = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter {
                index,
                current: 0,
                previous: 0,
                expires_at,
            });

        if index == counter.index.saturating_add(1) {
            counter.previous = counter.current;
            counter.current = 0;
            counter.index = index;
        } else if index > counter.index {
            counter.previous = 0;
            counter.current = 0;
            counter.index = index;
        }

        let weighted = weighted_count(counter.previous, counter.current, now_ms, window);
        let reset_after = reset_after(now_ms, window);

        if weighted.saturating_add(1) > limit {
            return Ok(WindowOutcome {
                allowed: false,
                count: weighted,
                reset_after,
            });
        }

        counter.current = counter.current.saturating_add(1);
        counter.expires_at = expires_at;
        Ok(WindowOutcome {
            allowed: true,
            count: weighted + 1,
            reset_after,
        })
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.flags.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn flag_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .flags
            .get(key)
            .and_then(|expires_at| expires_at.checked_duration_since(now))
            .filter(|remaining| !remaining.is_zero()))
    }

    async fn clear_flag(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .flags
            .remove(key)
            .is_some_and(|(_, expires_at)| expires_at > now))
    }

    async fn record_behavior(&self, update: &BehaviorUpdate<'_>) -> StoreResult<IpBehavior> {
        let now = Instant::now();
        let expires_at = now + update.ttl;
        let first_seen = timestamp_from_millis(update.now_ms, "behavior");

        let mut entry = self
            .behaviors
            .entry(update.ip.to_string())
            .or_insert_with(|| BehaviorEntry {
                behavior: IpBehavior::new(first_seen),
                expires_at,
            });

        if entry.expires_at <= now {
            entry.behavior = IpBehavior::new(first_seen);
        }
        entry.behavior.observe(update);
        entry.expires_at = expires_at;
        Ok(entry.behavior.clone())
    }

    async fn push_pattern(
        &self,
        ip: &str,
        pattern: SuspiciousPattern,
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = Instant::now();
        match self.behaviors.entry(ip.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.expires_at <= now {
                    entry.behavior =
                        IpBehavior::new(timestamp_from_millis(now_millis(), "behavior"));
                }
                entry.behavior.push_pattern(pattern);
                entry.expires_at = now + ttl;
            }
            Entry::Vacant(vacant) => {
                let mut behavior = IpBehavior::new(timestamp_from_millis(now_millis(), "behavior"));
                behavior.push_pattern(pattern);
                vacant.insert(BehaviorEntry {
                    behavior,
                    expires_at: now + ttl,
                });
            }
        }
        Ok(())
    }

    async fn behavior(&self, ip: &str) -> StoreResult<Option<IpBehavior>> {
        let now = Instant::now();
        Ok(self
            .behaviors
            .get(ip)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.behavior.clone()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
