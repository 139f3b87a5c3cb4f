mod admin;
mod csp_report;
mod health;
mod verify;

pub use admin::{add_whitelist, blacklist_ip, ip_report, remove_whitelist, unblock_ip};
pub use csp_report::csp_report;
pub use health::{health_check, readiness_check, stats};
pub use verify::{FORWARDED_METHOD_HEADER, FORWARDED_URI_HEADER, verify};
