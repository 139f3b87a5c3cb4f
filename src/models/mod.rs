mod api;
mod behavior;
mod event;

pub use api::{
    AdminActionResponse, BlacklistRequest, HealthResponse, IpReport, StatsResponse,
    VerifyResponse, WhitelistRequest,
};
pub use behavior::{IpBehavior, SuspiciousPattern};
pub use event::{RequestInfo, SecurityEvent, SecurityEventType, Severity};
