//! Prometheus metrics for the gateway.
//!
//! Metrics are exposed via a dedicated HTTP listener (`METRICS_PORT`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `edge_guard_decisions_total` - Gateway decisions (labels: verdict, tier, reason)
//! - `edge_guard_store_fallbacks_total` - Store calls served by the local fallback (label: op)
//! - `edge_guard_security_events_total` - Security events logged (labels: type, severity)
//! - `edge_guard_events_dropped_total` - Events dropped because the webhook queue was full
//! - `edge_guard_webhook_failures_total` - Webhook deliveries that failed after all retries
//! - `edge_guard_auto_blocks_total` - IPs blacklisted by the anomaly detector
//!
//! ## Histograms
//! - `edge_guard_risk_score` - Risk score per inspected request
//! - `edge_guard_inspection_duration_seconds` - Time spent deciding per request
//!
//! ## Gauges
//! - `edge_guard_store_degraded` - 1 while the distributed store is bypassed
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const DECISIONS_TOTAL: &str = "edge_guard_decisions_total";
    pub const STORE_FALLBACKS_TOTAL: &str = "edge_guard_store_fallbacks_total";
    pub const SECURITY_EVENTS_TOTAL: &str = "edge_guard_security_events_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "edge_guard_events_dropped_total";
    pub const WEBHOOK_FAILURES_TOTAL: &str = "edge_guard_webhook_failures_total";
    pub const AUTO_BLOCKS_TOTAL: &str = "edge_guard_auto_blocks_total";
    pub const RISK_SCORE: &str = "edge_guard_risk_score";
    pub const INSPECTION_DURATION_SECONDS: &str = "edge_guard_inspection_duration_seconds";
    pub const STORE_DEGRADED: &str = "edge_guard_store_degraded";
}

/// Initialize the Prometheus metrics exporter on `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::DECISIONS_TOTAL,
        "Gateway decisions by verdict, tier and reason"
    );
    describe_counter!(
        names::STORE_FALLBACKS_TOTAL,
        "Store operations served by the in-memory fallback"
    );
    describe_counter!(
        names::SECURITY_EVENTS_TOTAL,
        "Security events logged by type and severity"
    );
    describe_counter!(
        names::EVENTS_DROPPED_TOTAL,
        "Security events dropped on a full webhook queue"
    );
    describe_counter!(
        names::WEBHOOK_FAILURES_TOTAL,
        "Webhook deliveries that failed after all retries"
    );
    describe_counter!(
        names::AUTO_BLOCKS_TOTAL,
        "IPs blacklisted by the anomaly detector"
    );

    describe_histogram!(names::RISK_SCORE, "Risk score (0-100) per inspected request");
    describe_histogram!(
        names::INSPECTION_DURATION_SECONDS,
        "Request inspection duration in seconds"
    );

    describe_gauge!(
        names::STORE_DEGRADED,
        "Distributed store bypassed (1 = degraded, 0 = healthy)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

pub fn record_decision(verdict: &'static str, tier: &'static str, reason: &'static str) {
    counter!(names::DECISIONS_TOTAL, "verdict" => verdict, "tier" => tier, "reason" => reason)
        .increment(1);
}

pub fn record_store_fallback(op: &'static str) {
    counter!(names::STORE_FALLBACKS_TOTAL, "op" => op).increment(1);
}

pub fn record_security_event(event_type: &'static str, severity: &'static str) {
    counter!(names::SECURITY_EVENTS_TOTAL, "type" => event_type, "severity" => severity)
        .increment(1);
}

pub fn record_event_dropped() {
    counter!(names::EVENTS_DROPPED_TOTAL).increment(1);
}

pub fn record_webhook_failure() {
    counter!(names::WEBHOOK_FAILURES_TOTAL).increment(1);
}

pub fn record_auto_block() {
    counter!(names::AUTO_BLOCKS_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

pub fn record_risk_score(score: u8) {
    histogram!(names::RISK_SCORE).record(f64::from(score));
}

pub fn record_inspection_duration(duration_secs: f64) {
    histogram!(names::INSPECTION_DURATION_SECONDS).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_store_degraded(degraded: bool) {
    gauge!(names::STORE_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
}
