//! Operator endpoints for blacklist and whitelist overrides and IP lookup.
//!
//! Mounted under `/admin` behind [`AdminAuthLayer`](crate::middleware::AdminAuthLayer).
//! Blacklist entries live in the shared store and apply to every instance.
//! Whitelist changes made here only affect the instance that served the
//! request; permanent entries belong in `RATE_LIMIT_WHITELIST`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde_json::json;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::models::{
    AdminActionResponse, BlacklistRequest, IpReport, SecurityEvent, SecurityEventType, Severity,
    WhitelistRequest,
};
use crate::security::{Reputation, calculate_risk_score, client_ip};
use crate::state::AppState;
use crate::validation::{
    validate_block_duration, validate_ip, validate_ip_or_cidr, validate_reason,
};

/// Blacklist an IP for a fixed duration.
#[instrument(skip(state, headers))]
pub async fn blacklist_ip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BlacklistRequest>,
) -> AppResult<(StatusCode, Json<AdminActionResponse>)> {
    let ip = validate_ip(&payload.ip)?.to_string();
    let duration = validate_block_duration(payload.duration_secs)?;
    if let Some(reason) = &payload.reason {
        validate_reason(reason)?;
    }

    state.gateway.rate_limiter().blacklist_ip(&ip, duration).await?;

    state.events.log(
        SecurityEvent::new(
            SecurityEventType::IpBlacklisted,
            Severity::High,
            ip.clone(),
            format!("IP blacklisted by operator for {}s", duration.as_secs()),
        )
        .with_details(json!({
            "reason": payload.reason,
            "operator_ip": client_ip(&headers),
            "duration_secs": duration.as_secs(),
        })),
    );

    Ok((
        StatusCode::CREATED,
        Json(AdminActionResponse {
            success: true,
            target: ip,
            expires_in_secs: Some(duration.as_secs()),
        }),
    ))
}

/// Lift a blacklist entry and clear the IP's detector state.
///
/// The detector is reset even when no blacklist entry exists, so an IP stuck
/// in watch can be released by hand.
#[instrument(skip(state, headers))]
pub async fn unblock_ip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> AppResult<Json<AdminActionResponse>> {
    let ip = validate_ip(&ip)?.to_string();

    let existed = state.gateway.rate_limiter().unblock_ip(&ip).await?;
    state.gateway.detector().reset(&ip);

    if !existed {
        return Err(AppError::NotFound(format!("IP {ip} is not blacklisted")));
    }

    state.events.log(
        SecurityEvent::new(
            SecurityEventType::IpUnblocked,
            Severity::Low,
            ip.clone(),
            "IP unblocked by operator",
        )
        .with_details(json!({ "operator_ip": client_ip(&headers) })),
    );

    Ok(Json(AdminActionResponse {
        success: true,
        target: ip,
        expires_in_secs: None,
    }))
}

/// Add an IP or CIDR range to this instance's whitelist.
#[instrument(skip(state))]
pub async fn add_whitelist(
    State(state): State<AppState>,
    Json(payload): Json<WhitelistRequest>,
) -> AppResult<(StatusCode, Json<AdminActionResponse>)> {
    let range = validate_ip_or_cidr(&payload.entry)?;
    let inserted = state.gateway.rate_limiter().whitelist().insert(range);

    info!(entry = %range, inserted, "Whitelist entry added");
    let status = if inserted { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(AdminActionResponse {
            success: true,
            target: range.to_string(),
            expires_in_secs: None,
        }),
    ))
}

/// Remove a whitelist entry. CIDR ranges are passed URL-encoded
/// (`10.0.0.0%2F8`).
#[instrument(skip(state))]
pub async fn remove_whitelist(
    State(state): State<AppState>,
    Path(entry): Path<String>,
) -> AppResult<Json<AdminActionResponse>> {
    let range = validate_ip_or_cidr(&entry)?;
    if !state.gateway.rate_limiter().whitelist().remove(&range) {
        return Err(AppError::NotFound(format!("{range} is not whitelisted")));
    }

    info!(entry = %range, "Whitelist entry removed");
    Ok(Json(AdminActionResponse {
        success: true,
        target: range.to_string(),
        expires_in_secs: None,
    }))
}

/// Everything known about one IP.
///
/// Reading a report does not record behavior, so looking an IP up does not
/// change its score.
#[instrument(skip(state))]
pub async fn ip_report(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> AppResult<Json<IpReport>> {
    let ip = validate_ip(&ip)?.to_string();
    let limiter = state.gateway.rate_limiter();
    let intel = state.gateway.intel();

    let analysis = intel.get_ip_location(&ip).await;
    let behavior = intel.behavior(&ip).await?;
    let score = calculate_risk_score(&analysis.clone().unwrap_or_default(), behavior.as_ref());

    Ok(Json(IpReport {
        whitelisted: limiter.whitelist().contains(&ip),
        blacklisted_for_secs: limiter
            .blacklist_ttl(&ip)
            .await
            .map(|ttl| ttl.as_secs().max(1)),
        analysis,
        behavior,
        risk_score: score.value(),
        reputation: Reputation::from_score(score),
        anomaly_state: state.gateway.detector().state(&ip),
        ip,
    }))
}
