use std::net::IpAddr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use ipnet::IpNet;

use crate::security::parse_network;

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length of an IP or CIDR string accepted from the admin API.
///
/// The longest IPv6 text form plus `/128` fits well within this.
pub const MAX_ADDRESS_LENGTH: usize = 64;

/// Shortest manual blacklist duration in seconds.
pub const MIN_BLOCK_SECS: u64 = 1;

/// Longest manual blacklist duration in seconds (30 days).
pub const MAX_BLOCK_SECS: u64 = 30 * 24 * 3600;

/// Maximum length for operator notes attached to admin actions.
pub const MAX_REASON_LENGTH: usize = 512;

/// Validate a single IP address.
pub fn validate_ip(ip: &str) -> AppResult<IpAddr> {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("IP address cannot be empty".to_string()));
    }
    if trimmed.len() > MAX_ADDRESS_LENGTH {
        return Err(AppError::BadRequest(format!(
            "IP address cannot exceed {MAX_ADDRESS_LENGTH} characters"
        )));
    }
    trimmed
        .parse()
        .map_err(|_| AppError::BadRequest(format!("'{trimmed}' is not a valid IP address")))
}

/// Validate a whitelist entry: a bare IP or CIDR range.
///
/// Rules:
/// - Must be non-empty and at most 64 characters
/// - Prefix length must not exceed 32 (IPv4) or 128 (IPv6)
/// - A `/0` range is refused, it would whitelist everything
pub fn validate_ip_or_cidr(entry: &str) -> AppResult<IpNet> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Whitelist entry cannot be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_ADDRESS_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Whitelist entry cannot exceed {MAX_ADDRESS_LENGTH} characters"
        )));
    }
    let range = parse_network(trimmed).ok_or_else(|| {
        AppError::BadRequest(format!("'{trimmed}' is not a valid IP address or CIDR range"))
    })?;
    if range.prefix_len() == 0 {
        return Err(AppError::BadRequest(
            "Whitelist entry cannot cover the whole address space".to_string(),
        ));
    }
    Ok(range)
}

/// Validate a manual blacklist duration.
pub fn validate_block_duration(secs: u64) -> AppResult<Duration> {
    if secs < MIN_BLOCK_SECS {
        return Err(AppError::BadRequest(format!(
            "Block duration must be at least {MIN_BLOCK_SECS} second"
        )));
    }

    if secs > MAX_BLOCK_SECS {
        return Err(AppError::BadRequest(format!(
            "Block duration cannot exceed {MAX_BLOCK_SECS} seconds"
        )));
    }

    Ok(Duration::from_secs(secs))
}

/// Validate an operator note.
///
/// Rules:
/// - At most 512 bytes
/// - No control characters (keeps log lines single-line)
pub fn validate_reason(reason: &str) -> AppResult<()> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Reason cannot exceed {} characters (got {})",
            MAX_REASON_LENGTH,
            reason.len()
        )));
    }

    if let Some(pos) = reason.chars().position(|c| c.is_control()) {
        return Err(AppError::BadRequest(format!(
            "Reason contains invalid control character at position {pos}"
        )));
    }

    Ok(())
}
