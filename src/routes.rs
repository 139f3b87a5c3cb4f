//! Application routing configuration with middleware stack.
//!
//! # Route Groups
//!
//! - `/health`, `/ready`, `/stats` - Health & monitoring
//! - `/verify` - Forward-auth decision endpoint for a reverse proxy
//! - `/csp-report` - Browser violation reports (inspected like any client request)
//! - `/admin/*` - Operator overrides, only mounted when `ADMIN_API_KEY` is set
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ Route middleware │ ← /csp-report: guard + body limit
//! │                  │ ← /admin/*: API key auth (401 / 429)
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! `/verify` runs the gateway itself, so it is not wrapped in the guard.
//! Applications embedding the gateway in-process use [`protect`] instead.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{AdminAuthLayer, CspLayer, SecurityGuardLayer};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let reports = Router::new()
        .route("/csp-report", post(handlers::csp_report))
        .layer(DefaultBodyLimit::max(config.max_report_body_size))
        .layer(SecurityGuardLayer::new(state.gateway.clone()));

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/stats", get(handlers::stats))
        .route("/verify", get(handlers::verify).post(handlers::verify))
        .merge(reports);

    match &config.admin_api_key {
        Some(key) => {
            info!("Admin API enabled");
            let admin = Router::new()
                .route("/blacklist", post(handlers::blacklist_ip))
                .route("/blacklist/{ip}", delete(handlers::unblock_ip))
                .route("/whitelist", post(handlers::add_whitelist))
                .route("/whitelist/{entry}", delete(handlers::remove_whitelist))
                .route("/ips/{ip}", get(handlers::ip_report))
                .layer(AdminAuthLayer::new(key.clone(), state.events.clone()));
            router = router.nest("/admin", admin);
        }
        None => info!("Admin API disabled (no ADMIN_API_KEY set)"),
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Put an application router behind the gateway.
///
/// Every request is inspected first; allowed requests get a CSP nonce
/// (`x-nonce` header and `Nonce` extension) and the policy header on the
/// response.
///
/// ```rust,ignore
/// let app = Router::new().route("/checkout", post(checkout));
/// let app = edge_guard::protect(app, &state);
/// ```
pub fn protect<S>(router: Router<S>, state: &AppState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(CspLayer::new(state.csp.clone()))
        .layer(SecurityGuardLayer::new(state.gateway.clone()))
}
