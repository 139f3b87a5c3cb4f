//! Forward-auth decision endpoint.
//!
//! A reverse proxy (nginx `auth_request`, Traefik `forwardAuth`, Envoy
//! `ext_authz`) calls `/verify` before routing a client request upstream.
//! The original request is described by the proxy's headers:
//!
//! - `X-Forwarded-For` / `X-Real-IP`: client address
//! - `X-Forwarded-Uri`: original path and query
//! - `X-Forwarded-Method`: original method
//!
//! When the URI or method headers are missing the request's own values are
//! used. A 200 response carries `X-Nonce` and the CSP header, which the
//! proxy copies onto the upstream request and response.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use tracing::{debug, instrument};

use crate::middleware::{apply_quota_headers, attach_policy, rejection_response};
use crate::models::VerifyResponse;
use crate::security::csp::NONCE_HEADER;
use crate::security::RequestContext;
use crate::state::AppState;

pub const FORWARDED_URI_HEADER: &str = "x-forwarded-uri";
pub const FORWARDED_METHOD_HEADER: &str = "x-forwarded-method";

/// Decide on the request described by the forwarding headers.
#[instrument(skip(state, headers))]
pub async fn verify(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response<Body> {
    let original_uri = forwarded_uri(&headers).unwrap_or(uri);
    let original_method = forwarded_method(&headers).unwrap_or(method);
    let ctx = RequestContext::new(&headers, &original_method, &original_uri, None);

    let decision = state.gateway.decide(ctx).await;
    if !decision.is_allowed() {
        return rejection_response(&decision);
    }

    debug!(reason = decision.reason.as_str(), "Forwarded request allowed");
    let body = VerifyResponse {
        decision: decision.verdict.as_str().to_string(),
        reason: decision.reason.as_str().to_string(),
        tier: decision
            .tier
            .map_or("none", |tier| tier.name.as_str())
            .to_string(),
    };
    let mut response = (StatusCode::OK, Json(body)).into_response();

    let nonce = state.csp.generate_nonce();
    if let Ok(value) = HeaderValue::from_str(nonce.as_str()) {
        response.headers_mut().insert(NONCE_HEADER, value);
    }
    apply_quota_headers(response.headers_mut(), &decision);
    attach_policy(&mut response, &state.csp, &nonce);
    response
}

fn forwarded_uri(headers: &HeaderMap) -> Option<Uri> {
    headers
        .get(FORWARDED_URI_HEADER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn forwarded_method(headers: &HeaderMap) -> Option<Method> {
    Method::from_bytes(headers.get(FORWARDED_METHOD_HEADER)?.as_bytes()).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_values() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_URI_HEADER, HeaderValue::from_static("/api/login?next=%2F"));
        headers.insert(FORWARDED_METHOD_HEADER, HeaderValue::from_static("POST"));

        let uri = forwarded_uri(&headers).unwrap();
        assert_eq!(uri.path(), "/api/login");
        assert_eq!(uri.query(), Some("next=%2F"));
        assert_eq!(forwarded_method(&headers), Some(Method::POST));
    }

    #[test]
    fn test_missing_or_invalid_forwarded_values() {
        let mut headers = HeaderMap::new();
        assert!(forwarded_uri(&headers).is_none());
        assert!(forwarded_method(&headers).is_none());

        headers.insert(FORWARDED_URI_HEADER, HeaderValue::from_static("not a uri"));
        assert!(forwarded_uri(&headers).is_none());
    }
}
