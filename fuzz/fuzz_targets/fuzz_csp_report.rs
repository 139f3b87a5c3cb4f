//! Fuzz testing for browser-submitted CSP reports and policy validation.
//!
//! `/csp-report` is unauthenticated, so the parser and triage see fully
//! attacker-controlled JSON.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_csp_report
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use edge_guard::security::{analyze_csp_violation, parse_csp_violation_report, validate_csp};

fuzz_target!(|data: &[u8]| {
    if let Ok(raw) = serde_json::from_slice::<serde_json::Value>(data)
        && let Some(report) = parse_csp_violation_report(&raw)
    {
        let analysis = analyze_csp_violation(&report);
        // Alerts are only raised for high and critical findings
        if analysis.should_alert {
            assert!(analysis.severity >= edge_guard::models::Severity::High);
        }
    }

    if let Ok(policy) = std::str::from_utf8(data) {
        let result = validate_csp(policy);
        assert_eq!(result.valid, result.errors.is_empty());
    }
});
