//! Browser CSP violation reports.
//!
//! Browsers POST reports with `Content-Type: application/csp-report`, so the
//! body is read as raw bytes rather than through the `Json` extractor. The
//! route carries its own body limit (`MAX_REPORT_BODY_SIZE`).

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{AppError, AppResult};
use crate::models::{SecurityEvent, SecurityEventType};
use crate::security::{analyze_csp_violation, client_ip, parse_csp_violation_report};
use crate::state::AppState;

/// Accept one violation report.
///
/// Returns 204 once the report is logged, 400 when the body is not a
/// complete `{"csp-report": {...}}` envelope.
#[instrument(skip(state, headers, body))]
pub async fn csp_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::BadRequest("Malformed CSP report".to_string()))?;
    let report = parse_csp_violation_report(&raw)
        .ok_or_else(|| AppError::BadRequest("Incomplete CSP report".to_string()))?;

    let analysis = analyze_csp_violation(&report);
    debug!(
        directive = %report.violated_directive,
        should_alert = analysis.should_alert,
        "CSP violation received"
    );

    let message = match &analysis.reason {
        Some(reason) => format!("{reason} ({})", report.violated_directive),
        None => format!("CSP violation: {}", report.violated_directive),
    };
    state.events.log(
        SecurityEvent::new(
            SecurityEventType::CspViolation,
            analysis.severity,
            client_ip(&headers).into_owned(),
            message,
        )
        .with_endpoint(report.document_uri.clone())
        .with_details(json!({
            "report": report,
            "should_alert": analysis.should_alert,
        })),
    );

    Ok(StatusCode::NO_CONTENT)
}
