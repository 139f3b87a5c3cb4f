//! # Edge Guard
//!
//! Request-level security for Axum services and reverse proxies:
//!
//! - **Rate limiting**: Sliding windows per tier, shared through Redis with
//!   an in-memory fallback, plus blacklist and whitelist overrides
//! - **IP intelligence**: Geolocation, anonymizer flags and behavior
//!   profiles folded into a 0-100 risk score
//! - **Anomaly detection**: Progressive auto-blocking of IPs that keep
//!   misbehaving, fail-open on internal errors
//! - **CSP**: Per-request nonces, policy headers and violation triage
//! - **Security events**: Structured logs with webhook alerting
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Axum HTTP Server / embedding application         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Security Guard → CSP, Admin Auth)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SecurityGateway (rate limit → patterns → intel → anomaly)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FallbackStore (Redis behind circuit breaker → memory)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::Router;
//! use axum::routing::get;
//! use edge_guard::{AppState, Config, protect};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!
//!     let app = protect(Router::new().route("/", get(|| async { "hello" })), &state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Shared State
//!
//! Set `REDIS_URL` to share limits and blacklists across instances:
//! ```bash
//! REDIS_URL=redis://localhost:6379 edge-guard
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod security;
pub mod state;
pub mod store;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::{build_router, protect};
pub use security::{GatewayDecision, SecurityGateway};
pub use state::AppState;
