//! Client identity: IP address, authenticated user and rate-limit key.
//!
//! # Header trust
//!
//! The gateway trusts forwarding headers. It must sit behind a proxy that
//! appends its own hops to `X-Forwarded-For`; the left-most entry is taken
//! as the original client. Deployments reachable directly from the internet
//! let clients pick their own identity by sending these headers.
//!
//! Precedence, first non-empty match wins:
//!
//! 1. `X-Forwarded-For` (left-most entry, trimmed)
//! 2. `X-Real-IP`
//! 3. `CF-Connecting-IP`
//! 4. [`UNKNOWN_IP`]
//!
//! All requests without any of these headers share the `"unknown"` identity
//! and therefore one quota.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Identity used when no forwarding header is present.
pub const UNKNOWN_IP: &str = "unknown";

const CDN_IP_HEADER: &str = "cf-connecting-ip";

/// Where the client IP came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    FromXff(&'a str),
    FromRealIp(&'a str),
    FromCdn(&'a str),
    NotFound,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[inline]
fn extract_ip(headers: &HeaderMap) -> ExtractedIp<'_> {
    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
    {
        return ExtractedIp::FromXff(first);
    }
    if let Some(ip) = header_str(headers, "x-real-ip") {
        return ExtractedIp::FromRealIp(ip);
    }
    if let Some(ip) = header_str(headers, CDN_IP_HEADER) {
        return ExtractedIp::FromCdn(ip);
    }
    ExtractedIp::NotFound
}

/// Client IP for a request. Never fails; see the module docs for precedence.
#[inline]
pub fn client_ip(headers: &HeaderMap) -> Cow<'_, str> {
    match extract_ip(headers) {
        ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) | ExtractedIp::FromCdn(ip) => {
            Cow::Borrowed(ip)
        }
        ExtractedIp::NotFound => Cow::Borrowed(UNKNOWN_IP),
    }
}

/// User id attached to the request by the embedding application's
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// What a rate-limit counter is keyed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    /// One counter per client IP.
    #[default]
    Ip,
    /// One counter per authenticated user, per IP for anonymous requests.
    User,
    /// One counter per client IP and path.
    Endpoint,
}

impl KeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Ip => "ip",
            KeyScope::User => "user",
            KeyScope::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(KeyScope::Ip),
            "user" => Ok(KeyScope::User),
            "endpoint" => Ok(KeyScope::Endpoint),
            other => Err(format!("unknown rate limit key scope '{other}'")),
        }
    }
}

/// Sliding-window counter identity.
///
/// The scope prefix keeps keys from different scopes apart even when a user
/// id happens to look like an IP.
pub fn rate_limit_key(ip: &str, path: &str, scope: KeyScope, user_id: Option<&str>) -> String {
    match (scope, user_id) {
        (KeyScope::User, Some(user)) if !user.is_empty() => format!("user:{user}"),
        (KeyScope::Ip | KeyScope::User, _) => format!("ip:{ip}"),
        (KeyScope::Endpoint, _) => format!("endpoint:{ip}:{path}"),
    }
}
