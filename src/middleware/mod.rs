//! HTTP middleware for request inspection, CSP and admin authentication.
//!
//! - **Security Guard**: Runs every request through the gateway pipeline
//! - **CSP**: Mints a per-request nonce and sets the policy header
//! - **Admin Auth**: Constant-time API key check with brute force lockout
//!
//! # Architecture
//!
//! ```text
//! Request → Trace → Security Guard → CSP → Handler → Response
//!                        ↓            ↓
//!                 429 / 403       x-nonce, Content-Security-Policy
//!
//! /admin/* → Admin Auth → Handler
//!                ↓
//!           401 / 429
//! ```

pub mod auth;
pub mod csp;
pub mod guard;

pub use auth::{API_KEY_HEADER, AdminAuthLayer};
pub use csp::{CspLayer, attach_policy};
pub use guard::{
    RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, SecurityGuardLayer,
    apply_quota_headers, rejection_response,
};
