//! Fire-and-forget security event sink.
//!
//! [`SecurityEventLogger::log`] is synchronous and never fails: it writes a
//! tracing line, updates the per-IP history used by the anomaly detector
//! and, when a webhook is configured, queues the event for the background
//! [`WebhookWorker`]. A full queue drops the event instead of waiting.
//!
//! ```text
//!   log(event) ──► tracing ──► history ──try_send──► [bounded mpsc] ──► WebhookWorker
//!                                                                         │  governor cap
//!                                                                         │  3 attempts, jittered backoff
//!                                                                         ▼
//!                                                                    POST webhook
//! ```

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::Request;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::identity::client_ip;
use crate::metrics;
use crate::models::{RequestInfo, SecurityEvent, SecurityEventType, Severity};
use crate::utils::rand_jitter;

/// How long an event counts toward an IP's recent history.
pub const HISTORY_HORIZON: Duration = Duration::from_secs(300);

const MAX_HISTORY_PER_IP: usize = 64;
const WEBHOOK_ATTEMPTS: u32 = 3;
const WEBHOOK_BASE_BACKOFF: Duration = Duration::from_millis(200);

/// Event sink settings.
#[derive(Debug, Clone)]
pub struct EventSinkConfig {
    pub webhook_url: Option<String>,
    /// Events below this severity are not forwarded.
    pub min_webhook_severity: Severity,
    pub webhook_timeout: Duration,
    pub webhook_max_per_minute: u32,
    pub queue_capacity: usize,
}

impl Default for EventSinkConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            min_webhook_severity: Severity::Critical,
            webhook_timeout: Duration::from_secs(5),
            webhook_max_per_minute: 60,
            queue_capacity: 1024,
        }
    }
}

/// Observed count and configured limit attached to throttle events.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDetails {
    pub count: u32,
    pub limit: u32,
    pub tier: String,
}

struct Inner {
    sender: Option<mpsc::Sender<SecurityEvent>>,
    min_webhook_severity: Severity,
    history: DashMap<String, VecDeque<(Instant, u32)>>,
    logged: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable handle to the process-wide event sink.
#[derive(Clone)]
pub struct SecurityEventLogger {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SecurityEventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEventLogger")
            .field("webhook", &self.inner.sender.is_some())
            .field("logged", &self.events_logged())
            .finish()
    }
}

impl SecurityEventLogger {
    /// Build the sink. The worker is `Some` when a webhook URL is set and
    /// must be spawned by the caller.
    pub fn new(config: EventSinkConfig) -> Result<(Self, Option<WebhookWorker>), reqwest::Error> {
        let (sender, worker) = match config.webhook_url {
            Some(url) => {
                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                let client = reqwest::Client::builder()
                    .timeout(config.webhook_timeout)
                    .build()?;
                let per_minute =
                    NonZeroU32::new(config.webhook_max_per_minute).unwrap_or(NonZeroU32::MIN);
                let worker = WebhookWorker {
                    receiver: rx,
                    client,
                    url,
                    limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
                };
                (Some(tx), Some(worker))
            }
            None => (None, None),
        };

        let logger = Self {
            inner: Arc::new(Inner {
                sender,
                min_webhook_severity: config.min_webhook_severity,
                history: DashMap::new(),
                logged: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        };
        Ok((logger, worker))
    }

    /// Console and history only.
    pub fn local() -> Self {
        Self {
            inner: Arc::new(Inner {
                sender: None,
                min_webhook_severity: Severity::Critical,
                history: DashMap::new(),
                logged: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Record one event. Never blocks and never fails.
    pub fn log(&self, event: SecurityEvent) {
        self.inner.logged.fetch_add(1, Ordering::Relaxed);
        metrics::record_security_event(event.event_type.as_str(), event.severity.as_str());
        emit_console_line(&event);
        self.remember(&event);

        let Some(sender) = &self.inner.sender else {
            return;
        };
        if event.severity < self.inner.min_webhook_severity {
            return;
        }
        if let Err(e) = sender.try_send(event) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_event_dropped();
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(event_id = %event.id, "Security event queue full, webhook delivery skipped");
                }
                mpsc::error::TrySendError::Closed(event) => {
                    debug!(event_id = %event.id, "Webhook worker stopped, event not forwarded");
                }
            }
        }
    }

    /// `rate_limit_exceeded` at medium severity.
    pub fn log_rate_limit_exceeded(&self, info: &RequestInfo, details: RateLimitDetails) {
        let message = format!(
            "Rate limit exceeded on {} ({}/{} in {} tier)",
            info.endpoint, details.count, details.limit, details.tier
        );
        let event = SecurityEvent::new(
            SecurityEventType::RateLimitExceeded,
            Severity::Medium,
            &info.ip,
            message,
        )
        .with_request(info)
        .with_details(serde_json::to_value(&details).unwrap_or_default());
        self.log(event);
    }

    /// Severity-weighted sum of this IP's events within [`HISTORY_HORIZON`].
    pub fn recent_weight(&self, ip: &str) -> u32 {
        let Some(entries) = self.inner.history.get(ip) else {
            return 0;
        };
        let cutoff = Instant::now().checked_sub(HISTORY_HORIZON);
        entries
            .iter()
            .filter(|(at, _)| cutoff.is_none_or(|cutoff| *at >= cutoff))
            .map(|(_, weight)| *weight)
            .sum()
    }

    /// Drop history older than the horizon. Returns the number of IPs removed.
    pub fn purge_history(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(HISTORY_HORIZON) else {
            return 0;
        };
        let before = self.inner.history.len();
        self.inner.history.retain(|_, entries| {
            while entries.front().is_some_and(|(at, _)| *at < cutoff) {
                entries.pop_front();
            }
            !entries.is_empty()
        });
        before.saturating_sub(self.inner.history.len())
    }

    pub fn events_logged(&self) -> u64 {
        self.inner.logged.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn remember(&self, event: &SecurityEvent) {
        if event.ip.is_empty() || event.ip == "-" {
            return;
        }
        let mut entries = self.inner.history.entry(event.ip.clone()).or_default();
        entries.push_back((Instant::now(), event.severity.weight()));
        while entries.len() > MAX_HISTORY_PER_IP {
            entries.pop_front();
        }
    }
}

fn emit_console_line(event: &SecurityEvent) {
    let line = format!(
        "{} {}: {}",
        event.severity.emoji(),
        event.event_type.as_str().to_ascii_uppercase(),
        event.message
    );
    let endpoint = event.endpoint.as_deref().unwrap_or("-");
    let method = event.method.as_deref().unwrap_or("-");
    let user_id = event.user_id.as_deref().unwrap_or("-");

    match event.severity {
        Severity::Low => info!(
            event_id = %event.id, severity = %event.severity, ip = %event.ip,
            endpoint, method, user_id, "{line}"
        ),
        Severity::Medium => warn!(
            event_id = %event.id, severity = %event.severity, ip = %event.ip,
            endpoint, method, user_id, "{line}"
        ),
        Severity::High | Severity::Critical => error!(
            event_id = %event.id, severity = %event.severity, ip = %event.ip,
            endpoint, method, user_id, "{line}"
        ),
    }
}

/// Request metadata for events, using the same header precedence as rate
/// limiting.
pub fn extract_request_info<B>(req: &Request<B>) -> RequestInfo {
    RequestInfo {
        ip: client_ip(req.headers()).into_owned(),
        user_agent: req
            .headers()
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        endpoint: req.uri().path().to_string(),
        method: req.method().to_string(),
    }
}

/// Background webhook delivery.
pub struct WebhookWorker {
    receiver: mpsc::Receiver<SecurityEvent>,
    client: reqwest::Client,
    url: String,
    limiter: DefaultDirectRateLimiter,
}

impl WebhookWorker {
    /// Deliver queued events until `shutdown` fires, then drain what is
    /// already queued and return.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(url = %self.url, "Security webhook worker started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    self.receiver.close();
                    let mut drained = 0usize;
                    while let Some(event) = self.receiver.recv().await {
                        self.deliver(&event).await;
                        drained += 1;
                    }
                    info!(drained, "Security webhook worker stopped");
                    break;
                }
                maybe_event = self.receiver.recv() => {
                    match maybe_event {
                        Some(event) => self.deliver(&event).await,
                        None => {
                            debug!("All event senders dropped, webhook worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, event: &SecurityEvent) {
        if self.limiter.check().is_err() {
            warn!(event_id = %event.id, "Webhook rate cap reached, event not forwarded");
            metrics::record_event_dropped();
            return;
        }

        for attempt in 0..WEBHOOK_ATTEMPTS {
            match self.client.post(&self.url).json(event).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(event_id = %event.id, attempt, "Security event forwarded");
                    return;
                }
                Ok(response) => {
                    warn!(
                        event_id = %event.id,
                        attempt,
                        status = response.status().as_u16(),
                        "Webhook rejected security event"
                    );
                }
                Err(e) => {
                    warn!(event_id = %event.id, attempt, error = %e, "Webhook delivery failed");
                }
            }

            if attempt + 1 < WEBHOOK_ATTEMPTS {
                let backoff = WEBHOOK_BASE_BACKOFF.saturating_mul(1 << attempt);
                tokio::time::sleep(backoff.mul_f64(0.5 + rand_jitter())).await;
            }
        }

        error!(event_id = %event.id, "Giving up on webhook delivery");
        metrics::record_webhook_failure();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    fn event(severity: Severity, ip: &str) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::AnomalyDetected, severity, ip, "test")
    }

    #[test]
    fn test_extract_request_info() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/login?next=/")
            .header("x-real-ip", "198.51.100.3")
            .header("user-agent", "curl/8.4")
            .body(Body::empty())
            .unwrap();

        let info = extract_request_info(&req);
        assert_eq!(info.ip, "198.51.100.3");
        assert_eq!(info.user_agent.as_deref(), Some("curl/8.4"));
        assert_eq!(info.endpoint, "/api/login");
        assert_eq!(info.method, "POST");
    }

    #[test]
    fn test_history_is_weighted_by_severity() {
        let logger = SecurityEventLogger::local();
        logger.log(event(Severity::Medium, "1.2.3.4"));
        logger.log(event(Severity::Critical, "1.2.3.4"));
        logger.log(event(Severity::High, "5.6.7.8"));

        assert_eq!(logger.recent_weight("1.2.3.4"), 10);
        assert_eq!(logger.recent_weight("5.6.7.8"), 4);
        assert_eq!(logger.recent_weight("9.9.9.9"), 0);
        assert_eq!(logger.events_logged(), 3);
    }

    #[test]
    fn test_rate_limit_event_carries_details() {
        let logger = SecurityEventLogger::local();
        let info = RequestInfo {
            ip: "1.2.3.4".into(),
            user_agent: None,
            endpoint: "/api/login".into(),
            method: "POST".into(),
        };
        logger.log_rate_limit_exceeded(
            &info,
            RateLimitDetails {
                count: 5,
                limit: 5,
                tier: "strict".into(),
            },
        );
        assert_eq!(logger.recent_weight("1.2.3.4"), Severity::Medium.weight());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (logger, worker) = SecurityEventLogger::new(EventSinkConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            min_webhook_severity: Severity::Low,
            queue_capacity: 2,
            ..Default::default()
        })
        .unwrap();
        let _worker = worker.expect("worker is created when a webhook is set");

        for _ in 0..5 {
            logger.log(event(Severity::Critical, "1.2.3.4"));
        }
        assert_eq!(logger.events_dropped(), 3);
    }

    #[tokio::test]
    async fn test_events_below_threshold_are_not_queued() {
        let (logger, _worker) = SecurityEventLogger::new(EventSinkConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            queue_capacity: 1,
            ..Default::default()
        })
        .unwrap();

        for _ in 0..5 {
            logger.log(event(Severity::High, "1.2.3.4"));
        }
        assert_eq!(logger.events_dropped(), 0);
    }

    #[tokio::test]
    async fn test_worker_delivers_and_drains_on_shutdown() {
        let received: Arc<Mutex<Vec<SecurityEvent>>> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(seen): State<Arc<Mutex<Vec<SecurityEvent>>>>,
                     Json(event): Json<SecurityEvent>| async move {
                        seen.lock().unwrap().push(event);
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let (logger, worker) = SecurityEventLogger::new(EventSinkConfig {
            webhook_url: Some(format!("http://{addr}/hook")),
            ..Default::default()
        })
        .unwrap();
        let shutdown = CancellationToken::new();

        logger.log(event(Severity::Critical, "1.2.3.4"));
        logger.log(event(Severity::Low, "1.2.3.4"));
        logger.log(event(Severity::Critical, "5.6.7.8"));

        // Cancel before the worker starts: queued events are still drained
        shutdown.cancel();
        worker.unwrap().run(shutdown).await;

        let seen = received.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.severity == Severity::Critical));
        assert_eq!(seen[0].ip, "1.2.3.4");
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_then_abandoned() {
        let hits: Arc<AtomicU64> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(|State(hits): State<Arc<AtomicU64>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let (logger, worker) = SecurityEventLogger::new(EventSinkConfig {
            webhook_url: Some(format!("http://{addr}/hook")),
            ..Default::default()
        })
        .unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.unwrap().run(shutdown.clone()));

        logger.log(event(Severity::Critical, "1.2.3.4"));
        logger.log(event(Severity::Critical, "5.6.7.8"));

        // Both events get every attempt: the first failure does not stop
        // the worker
        let expected = u64::from(WEBHOOK_ATTEMPTS) * 2;
        tokio::time::timeout(Duration::from_secs(10), async {
            while hits.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("worker kept delivering after a failure");

        // Callers are unaffected by the failures
        logger.log(event(Severity::Medium, "1.2.3.4"));
        assert_eq!(logger.events_logged(), 3);
        assert_eq!(logger.events_dropped(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stops on shutdown")
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), expected);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_stall_worker() {
        let (logger, worker) = SecurityEventLogger::new(EventSinkConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            webhook_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();
        let shutdown = CancellationToken::new();

        logger.log(event(Severity::Critical, "1.2.3.4"));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(10), worker.unwrap().run(shutdown))
            .await
            .expect("delivery gives up after the last attempt");
        assert_eq!(logger.events_logged(), 1);
    }
}
