use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::signal;
use tracing::{error, warn};

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// If a handler cannot be installed the corresponding branch never
/// resolves, so the server keeps running until the other signal arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Wall-clock time in milliseconds since the Unix epoch.
///
/// A clock set before 1970 reads as zero rather than failing.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or(0)
}

/// Convert epoch milliseconds to a timestamp, logging and falling back to
/// the current time for out-of-range values.
pub fn timestamp_from_millis(millis: u64, context: &str) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(|| {
            warn!(context, millis, "Invalid timestamp, using current time as fallback");
            Utc::now()
        })
}

/// Random jitter in `[0.0, 1.0)` for retry backoff.
pub fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(250)), 250);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_timestamp_from_valid_millis() {
        // 2024-01-15T10:30:00Z
        let millis = 1_705_314_600_000_u64;
        let ts = timestamp_from_millis(millis, "test");
        assert_eq!(ts.timestamp_millis(), 1_705_314_600_000);
    }

    #[test]
    fn test_timestamp_from_invalid_millis_uses_now() {
        let ts = timestamp_from_millis(u64::MAX, "test");
        let diff = (Utc::now() - ts).num_seconds().abs();
        assert!(diff < 60, "Fallback should be close to current time");
    }

    #[test]
    fn test_now_millis_is_recent() {
        let now = now_millis();
        let chrono_now = Utc::now().timestamp_millis() as u64;
        assert!(chrono_now.abs_diff(now) < 5_000);
    }

    #[test]
    fn test_rand_jitter_in_range() {
        for _ in 0..100 {
            let jitter = rand_jitter();
            assert!((0.0..1.0).contains(&jitter));
        }
    }
}
