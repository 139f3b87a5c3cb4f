//! Request inspection middleware.
//!
//! Every request is passed to [`SecurityGateway::decide`] before it reaches
//! the inner service.
//!
//! # Response Headers
//!
//! On throttle (429):
//! - `Retry-After`: Seconds until the window frees up
//! - `X-RateLimit-Limit`: Quota of the tier the path maps to
//! - `X-RateLimit-Remaining`: `0`
//!
//! On block (403): `Retry-After` with the remaining blacklist time.
//!
//! On allow, `X-RateLimit-Limit` and `X-RateLimit-Remaining` are added to the
//! inner response when a tier applied.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::debug;

use crate::security::{AuthenticatedUser, GatewayDecision, RequestContext, SecurityGateway, Verdict};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Layer applying gateway decisions to every request.
#[derive(Clone)]
pub struct SecurityGuardLayer {
    gateway: SecurityGateway,
}

impl SecurityGuardLayer {
    pub fn new(gateway: SecurityGateway) -> Self {
        Self { gateway }
    }
}

impl<S> Layer<S> for SecurityGuardLayer {
    type Service = SecurityGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityGuardService {
            inner,
            gateway: self.gateway.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SecurityGuardService<S> {
    inner: S,
    gateway: SecurityGateway,
}

impl<S> Service<Request<Body>> for SecurityGuardService<S>
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
        let gateway = self.gateway.clone();
        let mut inner = self.inner.clone();

        let user_id = req
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.as_str());
        let ctx = RequestContext::new(req.headers(), req.method(), req.uri(), user_id);

        Box::pin(async move {
            let decision = gateway.decide(ctx).await;
            if !decision.is_allowed() {
                return Ok(rejection_response(&decision));
            }

            let mut response = inner.call(req).await?;
            apply_quota_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

/// Add `X-RateLimit-*` headers for the tier that applied, if any.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &GatewayDecision) {
    if let Some(tier) = decision.tier {
        headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(tier.max_requests));
        headers.insert(
            RATE_LIMIT_REMAINING_HEADER,
            HeaderValue::from(decision.remaining.unwrap_or(0)),
        );
    }
}

/// Build the 429 or 403 response for a rejected request.
///
/// The body never says why beyond the status: no tier, score or reason.
pub fn rejection_response(decision: &GatewayDecision) -> Response<Body> {
    let retry_after = decision
        .retry_after
        .map(|d| d.as_secs().max(1))
        .unwrap_or(1);

    let mut response = match decision.verdict {
        Verdict::Throttle => {
            debug!(retry_after_secs = retry_after, "Request throttled");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please retry later.",
            )
                .into_response()
        }
        Verdict::Block | Verdict::Allow => {
            debug!(reason = decision.reason.as_str(), "Request blocked");
            (StatusCode::FORBIDDEN, "Access denied.").into_response()
        }
    };

    let headers = response.headers_mut();
    headers.insert("retry-after", HeaderValue::from(retry_after));
    apply_quota_headers(headers, decision);
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::security::{DecisionReason, TierName};

    fn throttled() -> GatewayDecision {
        GatewayDecision {
            verdict: Verdict::Throttle,
            reason: DecisionReason::RateLimited,
            tier: Some(TierName::Strict.tier()),
            remaining: Some(0),
            retry_after: Some(Duration::from_millis(42_300)),
            risk: None,
        }
    }

    #[test]
    fn test_throttle_response_headers() {
        let response = rejection_response(&throttled());
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT_HEADER], "5");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "0");
    }

    #[test]
    fn test_block_response_has_no_quota_headers() {
        let decision = GatewayDecision {
            verdict: Verdict::Block,
            reason: DecisionReason::Blacklisted,
            tier: None,
            remaining: None,
            retry_after: Some(Duration::from_secs(900)),
            risk: None,
        };
        let response = rejection_response(&decision);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["retry-after"], "900");
        assert!(response.headers().get(RATE_LIMIT_LIMIT_HEADER).is_none());
    }

    #[test]
    fn test_sub_second_retry_rounds_up() {
        let mut decision = throttled();
        decision.retry_after = Some(Duration::from_millis(200));
        assert_eq!(rejection_response(&decision).headers()["retry-after"], "1");
    }
}
