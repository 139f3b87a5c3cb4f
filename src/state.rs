//! Shared application state for Axum handlers.
//!
//! This module wires the gateway components together once at startup and
//! hands out cheap clones to every handler and middleware:
//!
//! - **Store**: Redis behind a circuit breaker, with an in-memory fallback
//! - **Gateway**: rate limiter, IP intelligence, anomaly detector, pattern scan
//! - **CSP**: per-response policy builder
//! - **Events**: security event sink and its webhook worker
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken` for proper lifecycle management. Call `shutdown()`
//! to stop the sweeper and drain the webhook queue before exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::security::{
    AnomalyConfig, AnomalyDetector, CspPolicyBuilder, EventSinkConfig, GeoProvider,
    HttpGeoProvider, IpIntelConfig, IpIntelligence, PatternDetector, RateLimiter,
    SecurityEventLogger, SecurityGateway, Whitelist,
};
use crate::store::{
    CircuitBreakerConfig, FallbackStore, MemoryStore, RedisStore, RedisStoreConfig, SecurityStore,
};

/// Consecutive successful probes that close the store circuit again.
const STORE_RECOVERY_SUCCESSES: u32 = 2;

/// Shared application state for Axum handlers.
///
/// This struct is cloned for each request handler. All internal data
/// is wrapped in `Arc` for efficient sharing.
///
/// # Lifecycle
///
/// Background tasks are spawned when the state is created, so `new` must
/// run inside a Tokio runtime. Call `shutdown()` before dropping:
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Inspection pipeline
    pub gateway: SecurityGateway,
    /// Shared state backend
    pub store: Arc<FallbackStore>,
    /// Response policy builder
    pub csp: Arc<CspPolicyBuilder>,
    /// Security event sink
    pub events: SecurityEventLogger,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build every component from `config` and start background tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` when a client cannot be constructed
    /// from the configured values (webhook, geolocation provider, Redis URL).
    /// Redis is not contacted here: an unreachable server only puts the
    /// store into fallback mode.
    pub fn new(config: Config) -> AppResult<Self> {
        let (events, webhook_worker) = SecurityEventLogger::new(EventSinkConfig {
            webhook_url: config.security_webhook_url.clone(),
            min_webhook_severity: config.security_webhook_min_severity,
            webhook_timeout: config.webhook_timeout,
            webhook_max_per_minute: config.webhook_max_per_minute,
            queue_capacity: config.event_queue_capacity,
        })
        .map_err(|e| AppError::ConfigError(format!("Failed to build webhook client: {e}")))?;

        let store = Arc::new(build_store(&config, &events)?);
        let shared: Arc<dyn SecurityStore> = store.clone();

        let rate_limiter = Arc::new(RateLimiter::new(
            shared.clone(),
            config.tier_rules(),
            Whitelist::new(&config.rate_limit_whitelist),
            config.rate_limit_key_scope,
        ));

        let provider = config
            .geo_provider_url
            .as_ref()
            .map(|url| {
                HttpGeoProvider::new(url.clone(), config.geo_timeout)
                    .map(|p| Arc::new(p) as Arc<dyn GeoProvider>)
            })
            .transpose()
            .map_err(|e| AppError::ConfigError(format!("Failed to build geo client: {e}")))?;
        let intel = Arc::new(IpIntelligence::new(
            shared,
            provider,
            IpIntelConfig {
                cache_ttl: config.geo_cache_ttl,
                cache_max_entries: config.geo_cache_max_entries,
                behavior_ttl: config.behavior_ttl,
            },
        ));

        let detector = Arc::new(AnomalyDetector::new(
            AnomalyConfig {
                block_after: config.anomaly_block_after,
                base_block: config.anomaly_base_block,
                max_block: config.anomaly_max_block,
                z_threshold: config.anomaly_z_threshold,
                ..AnomalyConfig::default()
            },
            rate_limiter.clone(),
            events.clone(),
        ));

        let patterns = Arc::new(
            PatternDetector::new()
                .map_err(|e| AppError::Internal(format!("Invalid attack signature: {e}")))?,
        );

        let gateway = SecurityGateway::new(
            rate_limiter,
            intel,
            detector,
            patterns,
            events.clone(),
            config.inspection_timeout,
        );

        let csp = Arc::new(CspPolicyBuilder::new(
            config.environment,
            config.csp_report_uri.clone(),
            config.csp_report_only,
        ));

        let state = Self {
            config: Arc::new(config),
            gateway,
            store,
            csp,
            events,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        // Spawn background tasks
        if let Some(worker) = webhook_worker {
            state
                .task_tracker
                .spawn(worker.run(state.cancellation_token.clone()));
        }
        state.spawn_sweeper_task();

        Ok(state)
    }

    /// Spawn the periodic cleanup of expired local state.
    fn spawn_sweeper_task(&self) {
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let events = self.events.clone();
        let period = self.config.sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Sweeper task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let windows = store.local().purge_expired();
                        let cached = gateway.intel().purge_cache();
                        let idle = gateway.detector().purge_idle();
                        let history = events.purge_history();
                        metrics::set_store_degraded(store.is_degraded().await);
                        trace!(windows, cached, idle, history, "Sweep complete");
                    }
                }
            }

            debug!("Sweeper task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals cancellation, closes the tracker and waits. The webhook worker
    /// delivers whatever is still queued before it exits.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn build_store(config: &Config, events: &SecurityEventLogger) -> AppResult<FallbackStore> {
    let local = Arc::new(MemoryStore::new());

    let store = match &config.redis_url {
        Some(url) => {
            let redis = RedisStore::new(
                RedisStoreConfig::new(url.clone()).with_max_connections(config.redis_pool_size),
            )
            .map_err(|e| AppError::ConfigError(format!("Invalid REDIS_URL: {e}")))?;
            info!(pool_size = config.redis_pool_size, "Using Redis store with in-memory fallback");
            FallbackStore::new(
                Arc::new(redis),
                local,
                CircuitBreakerConfig::new(
                    config.store_failure_threshold,
                    STORE_RECOVERY_SUCCESSES,
                    config.store_recovery,
                ),
                config.store_timeout,
            )
        }
        None => {
            info!("REDIS_URL not set, using in-memory store (limits are per instance)");
            FallbackStore::local_only(local)
        }
    };

    Ok(store.with_events(events.clone()))
}
