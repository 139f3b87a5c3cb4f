//! Content-Security-Policy assembly, validation and violation triage.

use std::fmt;

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Severity;

/// Request header carrying the nonce minted for the current request.
pub const NONCE_HEADER: &str = "x-nonce";

const NONCE_BYTES: usize = 16;

/// Per-request CSP nonce, 128 random bits, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self(STANDARD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Production,
    Development,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Production => "production",
            DeploymentMode::Development => "development",
        }
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(DeploymentMode::Production),
            "development" | "dev" => Ok(DeploymentMode::Development),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Directive list joined as `name value; name value`.
struct Directives(Vec<(&'static str, String)>);

impl Directives {
    fn new() -> Self {
        Self(Vec::with_capacity(14))
    }

    fn push(&mut self, name: &'static str, value: impl Into<String>) -> &mut Self {
        self.0.push((name, value.into()));
        self
    }

    fn render(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    (*name).to_string()
                } else {
                    format!("{name} {value}")
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Builds the policy attached to every response.
#[derive(Debug, Clone, Default)]
pub struct CspPolicyBuilder {
    mode: DeploymentMode,
    report_uri: Option<String>,
    report_only: bool,
}

impl CspPolicyBuilder {
    pub fn new(mode: DeploymentMode, report_uri: Option<String>, report_only: bool) -> Self {
        Self {
            mode,
            report_uri: report_uri.filter(|uri| !uri.trim().is_empty()),
            report_only,
        }
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Response header name: enforcing or report-only.
    pub fn header_name(&self) -> &'static str {
        if self.report_only {
            "content-security-policy-report-only"
        } else {
            "content-security-policy"
        }
    }

    pub fn generate_nonce(&self) -> Nonce {
        Nonce::generate()
    }

    /// Policy for the configured mode, using the configured report URI.
    pub fn policy_for(&self, nonce: &Nonce) -> String {
        match self.mode {
            DeploymentMode::Production => self.build_csp_header(nonce, self.report_uri.as_deref()),
            DeploymentMode::Development => self.build_dev_csp_header(nonce),
        }
    }

    /// Nonce-based production policy.
    ///
    /// `upgrade-insecure-requests` is only emitted in production mode so that
    /// a staging box on plain HTTP keeps working with the same policy.
    pub fn build_csp_header(&self, nonce: &Nonce, report_uri: Option<&str>) -> String {
        let nonce_src = format!("'nonce-{nonce}'");
        let mut d = Directives::new();
        d.push("default-src", "'self'")
            .push(
                "script-src",
                format!("'self' {nonce_src} 'strict-dynamic' https:"),
            )
            .push("style-src", format!("'self' {nonce_src}"))
            .push("img-src", "'self' blob: data: https:")
            .push("font-src", "'self' data:")
            .push("connect-src", "'self' https:")
            .push("frame-src", "'none'")
            .push("frame-ancestors", "'none'")
            .push("object-src", "'none'")
            .push("base-uri", "'self'")
            .push("form-action", "'self'");
        if let Some(uri) = report_uri.filter(|uri| !uri.is_empty()) {
            d.push("report-uri", uri);
        }
        if self.mode == DeploymentMode::Production {
            d.push("upgrade-insecure-requests", "");
        }
        d.render()
    }

    /// Relaxed policy for local development.
    ///
    /// Inline styles are allowed outright: browsers ignore `'unsafe-inline'`
    /// when a nonce is present, so the style nonce is left out here.
    pub fn build_dev_csp_header(&self, nonce: &Nonce) -> String {
        let mut d = Directives::new();
        d.push("default-src", "'self'")
            .push(
                "script-src",
                format!("'self' 'nonce-{nonce}' 'strict-dynamic' 'unsafe-eval' https: http:"),
            )
            .push("style-src", "'self' 'unsafe-inline'")
            .push("img-src", "'self' blob: data: https: http:")
            .push("font-src", "'self' data:")
            .push(
                "connect-src",
                "'self' https: ws: wss: http://localhost:* ws://localhost:*",
            )
            .push("frame-src", "'none'")
            .push("frame-ancestors", "'none'")
            .push("object-src", "'none'")
            .push("base-uri", "'self'")
            .push("form-action", "'self'");
        if let Some(uri) = self.report_uri.as_deref() {
            d.push("report-uri", uri);
        }
        d.render()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CspValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

const REQUIRED_DIRECTIVES: [&str; 3] = ["default-src", "script-src", "object-src"];

/// Structural completeness check of a policy string.
pub fn validate_csp(csp: &str) -> CspValidation {
    let directives: Vec<(String, Vec<&str>)> = csp
        .split(';')
        .filter_map(|part| {
            let mut tokens = part.split_whitespace();
            let name = tokens.next()?.to_ascii_lowercase();
            Some((name, tokens.collect()))
        })
        .collect();

    let find = |name: &str| directives.iter().find(|(n, _)| n == name);

    let errors: Vec<String> = REQUIRED_DIRECTIVES
        .iter()
        .filter(|name| find(**name).is_none())
        .map(|name| format!("Missing required directive: {name}"))
        .collect();

    let mut warnings = Vec::new();
    if let Some((_, tokens)) = find("script-src") {
        if tokens.contains(&"'unsafe-inline'")
            && !tokens.iter().any(|t| t.starts_with("'nonce-") || t.starts_with("'sha"))
        {
            warnings.push("script-src allows 'unsafe-inline' without a nonce or hash".to_string());
        }
        if tokens.contains(&"*") {
            warnings.push("script-src allows any origin".to_string());
        }
    }
    if find("frame-ancestors").is_none() {
        warnings.push("frame-ancestors not set, page can be framed".to_string());
    }

    CspValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Decoded browser violation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CspViolationReport {
    pub document_uri: String,
    pub violated_directive: String,
    pub effective_directive: String,
    pub original_policy: String,
    pub blocked_uri: String,
    pub status_code: u16,
}

/// Accepts only `{"csp-report": {...}}` with every field present.
pub fn parse_csp_violation_report(raw: &Value) -> Option<CspViolationReport> {
    let report = raw.as_object()?.get("csp-report")?.as_object()?;
    let text = |field: &str| report.get(field)?.as_str().map(str::to_string);
    let status_code = report
        .get("status-code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())?;

    Some(CspViolationReport {
        document_uri: text("document-uri")?,
        violated_directive: text("violated-directive")?,
        effective_directive: text("effective-directive")?,
        original_policy: text("original-policy")?,
        blocked_uri: text("blocked-uri")?,
        status_code,
    })
}

/// Violation categories with distinct triage rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveCategory {
    FrameAncestors,
    Script,
    Connect,
    Image,
    Other,
}

impl DirectiveCategory {
    /// Category of a directive value such as `script-src-elem 'self'`.
    pub fn from_directive(directive: &str) -> Self {
        let name = directive
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match name.as_str() {
            "frame-ancestors" => DirectiveCategory::FrameAncestors,
            "script-src" | "script-src-elem" | "script-src-attr" => DirectiveCategory::Script,
            "connect-src" => DirectiveCategory::Connect,
            "img-src" => DirectiveCategory::Image,
            _ => DirectiveCategory::Other,
        }
    }

    fn rank(self) -> u8 {
        match self {
            DirectiveCategory::FrameAncestors => 0,
            DirectiveCategory::Script => 1,
            DirectiveCategory::Connect => 2,
            DirectiveCategory::Image => 3,
            DirectiveCategory::Other => 4,
        }
    }

    fn classify(self, blocked_uri: &str) -> CspAnalysis {
        let analysis = |severity, should_alert, reason: Option<&str>| CspAnalysis {
            severity,
            should_alert,
            reason: reason.map(str::to_string),
        };

        match self {
            DirectiveCategory::FrameAncestors => analysis(
                Severity::Critical,
                true,
                Some("Possible clickjacking attempt: page embedded by a foreign origin"),
            ),
            // Extensions inject data: scripts constantly
            DirectiveCategory::Script if blocked_uri.starts_with("data:") => analysis(
                Severity::Low,
                false,
                Some("Blocked data: URI script, likely a browser extension"),
            ),
            DirectiveCategory::Script => analysis(
                Severity::Critical,
                true,
                Some("Blocked script execution, possible XSS"),
            ),
            DirectiveCategory::Connect => analysis(
                Severity::High,
                true,
                Some("Blocked outbound connection, possible data exfiltration"),
            ),
            DirectiveCategory::Image => analysis(Severity::Medium, false, None),
            DirectiveCategory::Other => analysis(Severity::Low, false, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CspAnalysis {
    pub severity: Severity,
    pub should_alert: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Triage a violation.
///
/// The violated and effective directives are classified separately
/// (including the `data:` script exemption) and the more severe result
/// wins. On equal severity the higher-priority category wins.
pub fn analyze_csp_violation(violation: &CspViolationReport) -> CspAnalysis {
    let violated = DirectiveCategory::from_directive(&violation.violated_directive);
    let effective = DirectiveCategory::from_directive(&violation.effective_directive);
    if violated == effective {
        return violated.classify(&violation.blocked_uri);
    }

    let (first, second) = if violated.rank() <= effective.rank() {
        (violated, effective)
    } else {
        (effective, violated)
    };
    let first = first.classify(&violation.blocked_uri);
    let second = second.classify(&violation.blocked_uri);
    if second.severity > first.severity {
        second
    } else {
        first
    }
}

pub fn get_nonce_from_headers(headers: &HeaderMap) -> Option<Nonce> {
    headers
        .get(NONCE_HEADER)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| Nonce(n.to_string()))
}

/// Attribute set for an inline `<script>` or `<style>` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceProps {
    pub nonce: String,
}

pub fn script_nonce_props(nonce: &Nonce) -> NonceProps {
    NonceProps {
        nonce: nonce.0.clone(),
    }
}

pub fn style_nonce_props(nonce: &Nonce) -> NonceProps {
    NonceProps {
        nonce: nonce.0.clone(),
    }
}
