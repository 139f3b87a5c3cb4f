//! Attack-signature detection on the request line and user agent.
//!
//! Signatures are coarse on purpose: a hit does not block on its own, it
//! feeds the IP's behavior profile and therefore its risk score.

use regex::Regex;

use crate::models::SuspiciousPattern;

const SQL_INJECTION: &str = r#"(?i)(\bunion\b[\s\S]{0,20}\bselect\b|\b(or|and)\b\s+['"]?\d+['"]?\s*=\s*['"]?\d+|'\s*(or|and)\s+'|;\s*(drop|delete|insert|update)\s+\w+|\b(sleep|benchmark|pg_sleep)\s*\(|\binformation_schema\b|'\s*--)"#;

const XSS: &str = r#"(?i)(<\s*script|%3c\s*script|javascript\s*:|\bon(error|load|mouseover|focus|click)\s*=|<\s*iframe|<\s*svg[^>]*\bon\w+|document\.cookie)"#;

const PATH_TRAVERSAL: &str =
    r#"(?i)(\.\.[/\\]|%2e%2e(%2f|%5c|/|\\)|\.\.%2f|\.\.%5c|/etc/passwd|\\windows\\win\.ini)"#;

const COMMAND_INJECTION: &str = r#"(?i)([;|]\s*(cat|ls|id|whoami|uname|wget|curl|nc|bash|sh)\b|`[^`]+`|\$\([^)]*\)|&&\s*(cat|id|whoami|wget|curl)\b)"#;

const SCANNER_PATH: &str = r#"(?i)(/\.env(\b|$)|/\.git/|/wp-admin|/wp-login\.php|/phpmyadmin|/\.aws/|/actuator/|/cgi-bin/|/server-status)"#;

const SCANNER_AGENT: &str =
    r#"(?i)\b(sqlmap|nikto|nmap|masscan|zgrab|dirbuster|gobuster|nuclei|wpscan|acunetix)\b"#;

/// Compiled signature set.
#[derive(Debug)]
pub struct PatternDetector {
    signatures: Vec<(SuspiciousPattern, Regex)>,
    scanner_agent: Regex,
}

impl PatternDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            signatures: vec![
                (SuspiciousPattern::SqlInjection, Regex::new(SQL_INJECTION)?),
                (SuspiciousPattern::Xss, Regex::new(XSS)?),
                (SuspiciousPattern::PathTraversal, Regex::new(PATH_TRAVERSAL)?),
                (SuspiciousPattern::CommandInjection, Regex::new(COMMAND_INJECTION)?),
                (SuspiciousPattern::ScannerProbe, Regex::new(SCANNER_PATH)?),
            ],
            scanner_agent: Regex::new(SCANNER_AGENT)?,
        })
    }

    /// Distinct pattern kinds found in a request.
    ///
    /// The query is checked both raw and form-decoded so that `%27` and `+`
    /// encodings do not hide a payload.
    pub fn detect(
        &self,
        path: &str,
        query: Option<&str>,
        user_agent: Option<&str>,
    ) -> Vec<SuspiciousPattern> {
        let mut haystacks = vec![path.to_string()];
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            haystacks.push(query.to_string());
            haystacks.extend(
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(key, value)| format!("{key}={value}")),
            );
        }

        let mut found: Vec<SuspiciousPattern> = self
            .signatures
            .iter()
            .filter(|(_, regex)| haystacks.iter().any(|h| regex.is_match(h)))
            .map(|(pattern, _)| *pattern)
            .collect();

        if user_agent.is_some_and(|ua| self.scanner_agent.is_match(ua))
            && !found.contains(&SuspiciousPattern::ScannerProbe)
        {
            found.push(SuspiciousPattern::ScannerProbe);
        }
        found
    }
}
