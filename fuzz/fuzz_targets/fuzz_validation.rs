//! Fuzz testing for admin input validation.
//!
//! Every admin request passes through these functions before it reaches the
//! store, so they must never panic, whatever the client sends.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the validation fuzz target
//! cargo +nightly fuzz run fuzz_validation
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```
//!
//! # What This Tests
//!
//! - `validate_ip`: Blacklist and lookup targets
//! - `validate_ip_or_cidr`: Whitelist entries, including prefix parsing
//! - `validate_block_duration`: Full `u64` range
//! - `validate_reason`: Operator notes with arbitrary Unicode

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use edge_guard::validation::{
    validate_block_duration,
    validate_ip,
    validate_ip_or_cidr,
    validate_reason,
};

#[derive(Debug, Arbitrary)]
struct AdminInput<'a> {
    address: &'a str,
    duration_secs: u64,
    reason: &'a str,
}

fuzz_target!(|input: AdminInput<'_>| {
    if let Ok(ip) = validate_ip(input.address) {
        // Anything accepted as an IP is also a valid single-host range
        assert!(validate_ip_or_cidr(&ip.to_string()).is_ok());
    }

    if let Ok(range) = validate_ip_or_cidr(input.address) {
        // Canonical form parses back to the same range
        let again = validate_ip_or_cidr(&range.to_string()).expect("canonical form must parse");
        assert_eq!(again, range);
    }

    if let Ok(duration) = validate_block_duration(input.duration_secs) {
        assert_eq!(duration.as_secs(), input.duration_secs);
    }

    let _ = validate_reason(input.reason);
});
