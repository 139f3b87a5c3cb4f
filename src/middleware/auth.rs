//! API key authentication for the admin routes.
//!
//! # Security Features
//!
//! - **Constant-time comparison**: Prevents timing attacks on API key validation
//! - **Brute force protection**: Per-IP limit on failed attempts
//! - **Audit trail**: Every failure is logged as an `auth_failure` security event
//!
//! The key is only accepted in the `X-API-Key` header. Query parameters end
//! up in access logs.
//!
//! ```bash
//! ADMIN_API_KEY=your-secret-key edge-guard
//! curl -H "X-API-Key: your-secret-key" http://localhost:3000/admin/ips/203.0.113.5
//! ```
//!
//! When no key is configured the admin routes are not mounted at all, so this
//! layer always has a key to compare against.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::models::{SecurityEvent, SecurityEventType, Severity};
use crate::security::{SecurityEventLogger, extract_request_info};

/// Header name for API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Maximum auth failures per IP per minute before blocking.
const AUTH_FAILURE_LIMIT: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

/// Burst capacity for auth failure rate limiting.
const AUTH_FAILURE_BURST: NonZeroU32 = match NonZeroU32::new(5) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

/// Per-IP failure limiter.
type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Admin API key authentication layer.
///
/// # Brute Force Protection
///
/// Each failed attempt consumes a token from the caller's bucket; successful
/// requests consume nothing. Once the bucket is empty the IP is locked out
/// until a token frees up, and every request from it is refused with 429
/// before the key is looked at, the correct one included.
#[derive(Clone)]
pub struct AdminAuthLayer {
    expected_key: Arc<String>,
    failure_limiter: Arc<AuthFailureLimiter>,
    lockouts: Arc<DashMap<String, Instant>>,
    events: SecurityEventLogger,
}

impl AdminAuthLayer {
    pub fn new(api_key: String, events: SecurityEventLogger) -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
        Self {
            expected_key: Arc::new(api_key),
            failure_limiter: Arc::new(RateLimiter::keyed(quota)),
            lockouts: Arc::new(DashMap::new()),
            events,
        }
    }
}

impl<S> Layer<S> for AdminAuthLayer {
    type Service = AdminAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdminAuthService {
            inner,
            expected_key: self.expected_key.clone(),
            failure_limiter: self.failure_limiter.clone(),
            lockouts: self.lockouts.clone(),
            events: self.events.clone(),
        }
    }
}

/// Admin authentication service wrapper.
#[derive(Clone)]
pub struct AdminAuthService<S> {
    inner: S,
    expected_key: Arc<String>,
    failure_limiter: Arc<AuthFailureLimiter>,
    lockouts: Arc<DashMap<String, Instant>>,
    events: SecurityEventLogger,
}

impl<S> Service<Request<Body>> for AdminAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let expected = self.expected_key.clone();
        let failure_limiter = self.failure_limiter.clone();
        let lockouts = self.lockouts.clone();
        let events = self.events.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let info = extract_request_info(&req);

            if let Some(retry_after) = locked_out_for(&lockouts, &info.ip) {
                debug!(
                    client_ip = %info.ip,
                    retry_after_secs = retry_after,
                    "Admin request from locked out IP"
                );
                return Ok(rate_limited_response(retry_after));
            }

            let authorized = extract_api_key(&req).map(|key| constant_time_eq(key, &expected));
            let message = match authorized {
                Some(true) => {
                    debug!(path = %info.endpoint, "Admin authentication successful");
                    return inner.call(req).await;
                }
                Some(false) => "Invalid API key",
                None => "API key required",
            };

            events.log(
                SecurityEvent::new(
                    SecurityEventType::AuthFailure,
                    Severity::Medium,
                    info.ip.clone(),
                    format!("Admin authentication failed: {message}"),
                )
                .with_request(&info),
            );

            if let Err(not_until) = failure_limiter.check_key(&info.ip) {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after = wait_time.as_secs().max(1);
                let now = Instant::now();
                lockouts.retain(|_, until| *until > now);
                lockouts.insert(info.ip.clone(), now + wait_time);

                warn!(
                    client_ip = %info.ip,
                    retry_after_secs = retry_after,
                    "IP locked out of admin API after repeated auth failures"
                );
                return Ok(rate_limited_response(retry_after));
            }

            Ok(unauthorized_response(message))
        })
    }
}

/// Seconds left on an active lockout, clearing it once expired.
fn locked_out_for(lockouts: &DashMap<String, Instant>, ip: &str) -> Option<u64> {
    let until = *lockouts.get(ip)?;
    let now = Instant::now();
    if until > now {
        return Some((until - now).as_secs().max(1));
    }
    lockouts.remove(ip);
    None
}

fn extract_api_key<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Build an unauthorized (401) response.
fn unauthorized_response(message: &str) -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        [
            ("WWW-Authenticate", "API-Key"),
            ("Content-Type", "application/json"),
        ],
        format!(r#"{{"error":"unauthorized","message":"{message}"}}"#),
    )
        .into_response()
}

/// Build a rate limited (429) response for auth failures.
fn rate_limited_response(retry_after: u64) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            ("Retry-After", retry_after.to_string()),
            ("Content-Type", "application/json".to_string()),
        ],
        r#"{"error":"too_many_requests","message":"Too many failed authentication attempts. Please wait before retrying."}"#.to_string(),
    )
        .into_response()
}
