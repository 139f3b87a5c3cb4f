//! Primary store with transparent in-memory fallback.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{info, warn};

use super::{
    BehaviorUpdate, CircuitBreaker, CircuitBreakerConfig, CircuitState, MemoryStore,
    SecurityStore, StoreError, StoreResult, WindowOutcome,
};
use crate::metrics;
use crate::models::{IpBehavior, SecurityEvent, SecurityEventType, Severity, SuspiciousPattern};
use crate::security::SecurityEventLogger;

/// Routes every call to the primary store and falls back to process memory
/// when the primary errors, exceeds its timeout, or sits behind an open
/// circuit.
///
/// Errors never reach callers: a failed primary call is answered by the
/// local store. Flags are written to both backends so a blacklist set
/// before an outage still applies during it. A flag the primary never
/// received is copied over once the primary answers again, so it lasts
/// its full TTL.
pub struct FallbackStore {
    primary: Option<Arc<dyn SecurityStore>>,
    local: Arc<MemoryStore>,
    breaker: CircuitBreaker,
    op_timeout: Duration,
    events: Option<SecurityEventLogger>,
    fallback_calls: AtomicU64,
    /// Flags set locally while the primary was unreachable.
    unsynced_flags: DashSet<String>,
}

impl FallbackStore {
    /// Wrap `primary`, falling back to `local`.
    pub fn new(
        primary: Arc<dyn SecurityStore>,
        local: Arc<MemoryStore>,
        breaker: CircuitBreakerConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            primary: Some(primary),
            local,
            breaker: CircuitBreaker::new(breaker),
            op_timeout,
            events: None,
            fallback_calls: AtomicU64::new(0),
            unsynced_flags: DashSet::new(),
        }
    }

    /// Single-node mode: memory only.
    pub fn local_only(local: Arc<MemoryStore>) -> Self {
        Self {
            primary: None,
            local,
            breaker: CircuitBreaker::default(),
            op_timeout: Duration::from_millis(50),
            events: None,
            fallback_calls: AtomicU64::new(0),
            unsynced_flags: DashSet::new(),
        }
    }

    /// Emit a `store_unavailable` event whenever the circuit opens.
    pub fn with_events(mut self, events: SecurityEventLogger) -> Self {
        self.events = Some(events);
        self
    }

    pub fn local(&self) -> &Arc<MemoryStore> {
        &self.local
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    /// Whether a primary is configured but currently bypassed.
    pub async fn is_degraded(&self) -> bool {
        self.primary.is_some() && self.breaker.state().await == CircuitState::Open
    }

    /// Name of the backend that will serve the next call.
    pub async fn active_backend(&self) -> &'static str {
        match &self.primary {
            Some(primary) if self.breaker.state().await != CircuitState::Open => {
                primary.backend()
            }
            _ => self.local.backend(),
        }
    }

    /// Calls answered by the local store because the primary failed.
    pub fn fallback_calls(&self) -> u64 {
        self.fallback_calls.load(Ordering::Relaxed)
    }

    /// Run `call` against the primary. `None` means the caller must use the
    /// local store.
    async fn try_primary<T, F, Fut>(&self, op: &'static str, call: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn SecurityStore>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let primary = self.primary.as_ref()?;

        if !self.breaker.allow_request().await {
            self.note_fallback(op);
            return None;
        }

        let result = match tokio::time::timeout(self.op_timeout, call(Arc::clone(primary))).await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "{op} exceeded {}ms",
                self.op_timeout.as_millis()
            ))),
        };

        match result {
            Ok(value) => {
                self.breaker.record_success().await;
                Some(value)
            }
            Err(e) => {
                warn!(op, error = %e, "Primary store call failed, answering from local memory");
                if self.breaker.record_failure().await {
                    self.report_outage(&e);
                }
                self.note_fallback(op);
                None
            }
        }
    }

    fn note_fallback(&self, op: &'static str) {
        self.fallback_calls.fetch_add(1, Ordering::Relaxed);
        metrics::record_store_fallback(op);
    }

    fn report_outage(&self, error: &StoreError) {
        if let Some(events) = &self.events {
            events.log(
                SecurityEvent::new(
                    SecurityEventType::StoreUnavailable,
                    Severity::Low,
                    "-",
                    "Shared store unreachable, enforcing with per-instance state",
                )
                .with_details(serde_json::json!({ "error": error.to_string() })),
            );
        }
    }
}

#[async_trait]
impl SecurityStore for FallbackStore {
    fn backend(&self) -> &'static str {
        match &self.primary {
            Some(primary) => primary.backend(),
            None => self.local.backend(),
        }
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_ms: u64,
    ) -> StoreResult<WindowOutcome> {
        if let Some(outcome) = self
            .try_primary("sliding_window_hit", |p| async move {
                p.sliding_window_hit(key, window, limit, now_ms).await
            })
            .await
        {
            return Ok(outcome);
        }
        self.local.sliding_window_hit(key, window, limit, now_ms).await
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.local.set_flag(key, ttl).await?;
        let stored = self
            .try_primary("set_flag", |p| async move { p.set_flag(key, ttl).await })
            .await;
        if stored.is_some() {
            self.unsynced_flags.remove(key);
        } else if self.primary.is_some() {
            self.unsynced_flags.insert(key.to_string());
        }
        Ok(())
    }

    async fn flag_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let Some(primary_ttl) = self
            .try_primary("flag_ttl", |p| async move { p.flag_ttl(key).await })
            .await
        else {
            return self.local.flag_ttl(key).await;
        };

        if primary_ttl.is_some() || !self.unsynced_flags.contains(key) {
            self.unsynced_flags.remove(key);
            return Ok(primary_ttl);
        }

        // Set during an outage: the primary has never seen it
        let Some(ttl) = self.local.flag_ttl(key).await? else {
            self.unsynced_flags.remove(key);
            return Ok(None);
        };
        if self
            .try_primary("set_flag", |p| async move { p.set_flag(key, ttl).await })
            .await
            .is_some()
        {
            self.unsynced_flags.remove(key);
            info!(key, ttl_secs = ttl.as_secs(), "Flag set during outage copied to primary store");
        }
        Ok(Some(ttl))
    }

    async fn clear_flag(&self, key: &str) -> StoreResult<bool> {
        self.unsynced_flags.remove(key);
        let local = self.local.clear_flag(key).await?;
        let primary = self
            .try_primary("clear_flag", |p| async move { p.clear_flag(key).await })
            .await
            .unwrap_or(false);
        Ok(local || primary)
    }

    async fn record_behavior(&self, update: &BehaviorUpdate<'_>) -> StoreResult<IpBehavior> {
        if let Some(behavior) = self
            .try_primary("record_behavior", |p| async move {
                p.record_behavior(update).await
            })
            .await
        {
            return Ok(behavior);
        }
        self.local.record_behavior(update).await
    }

    async fn push_pattern(
        &self,
        ip: &str,
        pattern: SuspiciousPattern,
        ttl: Duration,
    ) -> StoreResult<()> {
        if self
            .try_primary("push_pattern", |p| async move {
                p.push_pattern(ip, pattern, ttl).await
            })
            .await
            .is_some()
        {
            return Ok(());
        }
        self.local.push_pattern(ip, pattern, ttl).await
    }

    async fn behavior(&self, ip: &str) -> StoreResult<Option<IpBehavior>> {
        if let Some(behavior) = self
            .try_primary("behavior", |p| async move { p.behavior(ip).await })
            .await
        {
            return Ok(behavior);
        }
        self.local.behavior(ip).await
    }

    async fn ping(&self) -> StoreResult<()> {
        match &self.primary {
            Some(primary) => {
                match tokio::time::timeout(self.op_timeout, primary.ping()).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout("ping".to_string())),
                }
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    /// Primary that fails every call and counts attempts.
    #[derive(Default)]
    struct BrokenStore {
        calls: AtomicU32,
    }

    impl BrokenStore {
        fn fail<T>(&self) -> StoreResult<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[async_trait]
    impl SecurityStore for BrokenStore {
        fn backend(&self) -> &'static str {
            "broken"
        }
        async fn sliding_window_hit(
            &self,
            _: &str,
            _: Duration,
            _: u32,
            _: u64,
        ) -> StoreResult<WindowOutcome> {
            self.fail()
        }
        async fn set_flag(&self, _: &str, _: Duration) -> StoreResult<()> {
            self.fail()
        }
        async fn flag_ttl(&self, _: &str) -> StoreResult<Option<Duration>> {
            self.fail()
        }
        async fn clear_flag(&self, _: &str) -> StoreResult<bool> {
            self.fail()
        }
        async fn record_behavior(&self, _: &BehaviorUpdate<'_>) -> StoreResult<IpBehavior> {
            self.fail()
        }
        async fn push_pattern(&self, _: &str, _: SuspiciousPattern, _: Duration) -> StoreResult<()> {
            self.fail()
        }
        async fn behavior(&self, _: &str) -> StoreResult<Option<IpBehavior>> {
            self.fail()
        }
        async fn ping(&self) -> StoreResult<()> {
            self.fail()
        }
    }

    /// Memory-backed primary that can be switched off and on.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SecurityStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }
        async fn sliding_window_hit(
            &self,
            key: &str,
            window: Duration,
            limit: u32,
            now_ms: u64,
        ) -> StoreResult<WindowOutcome> {
            self.check()?;
            self.inner.sliding_window_hit(key, window, limit, now_ms).await
        }
        async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()> {
            self.check()?;
            self.inner.set_flag(key, ttl).await
        }
        async fn flag_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
            self.check()?;
            self.inner.flag_ttl(key).await
        }
        async fn clear_flag(&self, key: &str) -> StoreResult<bool> {
            self.check()?;
            self.inner.clear_flag(key).await
        }
        async fn record_behavior(&self, update: &BehaviorUpdate<'_>) -> StoreResult<IpBehavior> {
            self.check()?;
            self.inner.record_behavior(update).await
        }
        async fn push_pattern(
            &self,
            ip: &str,
            pattern: SuspiciousPattern,
            ttl: Duration,
        ) -> StoreResult<()> {
            self.check()?;
            self.inner.push_pattern(ip, pattern, ttl).await
        }
        async fn behavior(&self, ip: &str) -> StoreResult<Option<IpBehavior>> {
            self.check()?;
            self.inner.behavior(ip).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.check()
        }
    }

    /// Primary that never answers in time.
    struct SlowStore;

    #[async_trait]
    impl SecurityStore for SlowStore {
        fn backend(&self) -> &'static str {
            "slow"
        }
        async fn sliding_window_hit(
            &self,
            key: &str,
            window: Duration,
            limit: u32,
            now_ms: u64,
        ) -> StoreResult<WindowOutcome> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            MemoryStore::new()
                .sliding_window_hit(key, window, limit, now_ms)
                .await
        }
        async fn set_flag(&self, _: &str, _: Duration) -> StoreResult<()> {
            Ok(())
        }
        async fn flag_ttl(&self, _: &str) -> StoreResult<Option<Duration>> {
            Ok(None)
        }
        async fn clear_flag(&self, _: &str) -> StoreResult<bool> {
            Ok(false)
        }
        async fn record_behavior(&self, update: &BehaviorUpdate<'_>) -> StoreResult<IpBehavior> {
            MemoryStore::new().record_behavior(update).await
        }
        async fn push_pattern(&self, _: &str, _: SuspiciousPattern, _: Duration) -> StoreResult<()> {
            Ok(())
        }
        async fn behavior(&self, _: &str) -> StoreResult<Option<IpBehavior>> {
            Ok(None)
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    fn breaker(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(threshold, 1, MINUTE)
    }

    #[tokio::test]
    async fn test_failed_primary_is_answered_locally() {
        let primary = Arc::new(BrokenStore::default());
        let store = FallbackStore::new(
            primary.clone(),
            Arc::new(MemoryStore::new()),
            breaker(10),
            Duration::from_millis(50),
        );

        let outcome = store.sliding_window_hit("k", MINUTE, 1, 0).await.unwrap();
        assert!(outcome.allowed);
        let outcome = store.sliding_window_hit("k", MINUTE, 1, 0).await.unwrap();
        assert!(!outcome.allowed, "local counter must keep enforcing");
        assert_eq!(store.fallback_calls(), 2);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_primary() {
        let primary = Arc::new(BrokenStore::default());
        let store = FallbackStore::new(
            primary.clone(),
            Arc::new(MemoryStore::new()),
            breaker(2),
            Duration::from_millis(50),
        );

        for _ in 0..10 {
            store.sliding_window_hit("k", MINUTE, 100, 0).await.unwrap();
        }

        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        assert!(store.is_degraded().await);
        assert_eq!(store.active_backend().await, "memory");
    }

    #[tokio::test]
    async fn test_slow_primary_times_out() {
        let store = FallbackStore::new(
            Arc::new(SlowStore),
            Arc::new(MemoryStore::new()),
            breaker(5),
            Duration::from_millis(20),
        );

        let started = std::time::Instant::now();
        let outcome = store.sliding_window_hit("k", MINUTE, 5, 0).await.unwrap();
        assert!(outcome.allowed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_flags_survive_primary_outage() {
        let store = FallbackStore::new(
            Arc::new(BrokenStore::default()),
            Arc::new(MemoryStore::new()),
            breaker(10),
            Duration::from_millis(50),
        );

        store.set_flag("bl:1.2.3.4", MINUTE).await.unwrap();
        assert!(store.flag_ttl("bl:1.2.3.4").await.unwrap().is_some());
        assert!(store.clear_flag("bl:1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_only_never_degrades() {
        let store = FallbackStore::local_only(Arc::new(MemoryStore::new()));
        assert!(!store.is_degraded().await);
        assert_eq!(store.backend(), "memory");
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_flag_set_during_outage_survives_recovery() {
        let primary = Arc::new(FlakyStore::default());
        let store = FallbackStore::new(
            primary.clone(),
            Arc::new(MemoryStore::new()),
            CircuitBreakerConfig::new(1, 1, Duration::from_millis(10)),
            Duration::from_millis(50),
        );

        primary.set_down(true);
        store.set_flag("bl:203.0.113.9", MINUTE).await.unwrap();
        assert!(store.flag_ttl("bl:203.0.113.9").await.unwrap().is_some());

        primary.set_down(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ttl = store.flag_ttl("bl:203.0.113.9").await.unwrap();
        assert!(ttl.is_some_and(|ttl| ttl > Duration::from_secs(50)));
        // Copied to the primary, so other instances see it too
        assert!(primary.inner.flag_ttl("bl:203.0.113.9").await.unwrap().is_some());

        assert!(store.clear_flag("bl:203.0.113.9").await.unwrap());
        assert_eq!(store.flag_ttl("bl:203.0.113.9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flag_cleared_on_primary_is_not_resurrected() {
        let primary = Arc::new(FlakyStore::default());
        let store = FallbackStore::new(
            primary.clone(),
            Arc::new(MemoryStore::new()),
            breaker(3),
            Duration::from_millis(50),
        );

        store.set_flag("bl:198.51.100.3", MINUTE).await.unwrap();
        // Another instance lifts the block
        assert!(primary.inner.clear_flag("bl:198.51.100.3").await.unwrap());

        assert_eq!(store.flag_ttl("bl:198.51.100.3").await.unwrap(), None);
    }
}
