//! Per-request CSP nonce and policy header.
//!
//! The nonce is minted before the inner service runs and handed to it two
//! ways: as the `x-nonce` request header (read back with
//! [`get_nonce_from_headers`](crate::security::get_nonce_from_headers)) and
//! as a [`Nonce`] request extension. A client-supplied `x-nonce` header is
//! always overwritten.
//!
//! The policy header is added to the response unless the inner service
//! already set one.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::error;

use crate::security::csp::NONCE_HEADER;
use crate::security::{CspPolicyBuilder, Nonce};

/// Layer attaching a nonce-based Content-Security-Policy.
#[derive(Clone)]
pub struct CspLayer {
    builder: Arc<CspPolicyBuilder>,
}

impl CspLayer {
    pub fn new(builder: Arc<CspPolicyBuilder>) -> Self {
        Self { builder }
    }
}

impl<S> Layer<S> for CspLayer {
    type Service = CspService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CspService {
            inner,
            builder: self.builder.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CspService<S> {
    inner: S,
    builder: Arc<CspPolicyBuilder>,
}

impl<S> Service<Request<Body>> for CspService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let builder = self.builder.clone();
        let mut inner = self.inner.clone();

        let nonce = builder.generate_nonce();
        // Base64 output is always a valid header value
        match HeaderValue::from_str(nonce.as_str()) {
            Ok(value) => {
                req.headers_mut().insert(NONCE_HEADER, value);
            }
            Err(e) => {
                error!(error = %e, "Generated nonce is not a valid header value");
                req.headers_mut().remove(NONCE_HEADER);
            }
        }
        req.extensions_mut().insert(nonce.clone());

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            attach_policy(&mut response, &builder, &nonce);
            Ok(response)
        })
    }
}

/// Set the policy header on `response` unless one is already present.
pub fn attach_policy(response: &mut Response<Body>, builder: &CspPolicyBuilder, nonce: &Nonce) {
    let name = builder.header_name();
    if response.headers().contains_key(name) {
        return;
    }
    match HeaderValue::from_str(&builder.policy_for(nonce)) {
        Ok(value) => {
            response.headers_mut().insert(name, value);
        }
        Err(e) => error!(error = %e, "Built CSP is not a valid header value"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;
    use crate::security::{DeploymentMode, get_nonce_from_headers};

    fn app(builder: CspPolicyBuilder) -> Router {
        Router::new()
            .route(
                "/",
                get(|req: Request<Body>| async move {
                    let from_header = get_nonce_from_headers(req.headers()).unwrap();
                    let from_ext = req.extensions().get::<Nonce>().unwrap().clone();
                    assert_eq!(from_header, from_ext);
                    from_header.to_string()
                }),
            )
            .route(
                "/custom",
                get(|| async {
                    Response::builder()
                        .header("content-security-policy", "default-src 'none'")
                        .body(Body::empty())
                        .unwrap()
                }),
            )
            .layer(CspLayer::new(Arc::new(builder)))
    }

    #[tokio::test]
    async fn test_policy_carries_request_nonce() {
        let response = app(CspPolicyBuilder::default())
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(NONCE_HEADER, "spoofed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let csp = response.headers()["content-security-policy"]
            .to_str()
            .unwrap()
            .to_string();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let nonce = String::from_utf8(body.to_vec()).unwrap();

        assert_ne!(nonce, "spoofed");
        assert!(csp.contains(&format!("'nonce-{nonce}'")));
    }

    #[tokio::test]
    async fn test_existing_policy_is_kept() {
        let response = app(CspPolicyBuilder::default())
            .oneshot(Request::builder().uri("/custom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers()["content-security-policy"],
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn test_report_only_header() {
        let builder = CspPolicyBuilder::new(DeploymentMode::Development, None, true);
        let response = app(builder)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().get("content-security-policy").is_none());
        let csp = response.headers()["content-security-policy-report-only"]
            .to_str()
            .unwrap();
        assert!(csp.contains("'unsafe-eval'"));
    }
}
