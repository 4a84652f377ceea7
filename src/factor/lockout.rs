//! Lockout counter rendering.
//!
//! The hardware rate limiter reports raw second-granularity counters; this
//! module renders them into the millisecond countdowns surfaced to callers.
//! It never invents a policy, it only renders counters under the policy the
//! factor already declares.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Sentinel delay meaning "no active delay / not time-limited".
pub const NO_DELAY: u32 = u32::MAX;

/// Sentinel countdown meaning "never / unknown".
pub const NEVER_MS: u64 = u64::MAX;

/// Rate-limiting regime a factor declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LockoutPolicy {
    None,
    AttemptLimited,
    TimeLimited,
}

impl LockoutPolicy {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AttemptLimited => "attempt_limited",
            Self::TimeLimited => "time_limited",
        }
    }
}

/// Rendered lockout state for one factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutStatus {
    /// The declared policy, echoed back unchanged.
    pub policy: LockoutPolicy,
    /// Milliseconds until the factor is usable again; [`NEVER_MS`] when no
    /// delay applies.
    pub time_available_ms: u64,
    /// Milliseconds until the limiter lease expires; [`NEVER_MS`] when the
    /// limiter reports none.
    pub time_expiring_ms: u64,
}

/// Render raw limiter counters under an already-declared policy.
#[must_use]
pub fn evaluate(
    policy: LockoutPolicy,
    delay_seconds: u32,
    expiration_seconds: Option<u32>,
) -> LockoutStatus {
    LockoutStatus {
        policy,
        time_available_ms: seconds_to_ms(delay_seconds),
        time_expiring_ms: expiration_seconds.map_or(NEVER_MS, seconds_to_ms),
    }
}

/// Whether a reported delay actually blocks attempts. The sentinel means
/// "no active delay", not an infinite lock.
#[must_use]
pub fn is_delay_active(delay_seconds: u32) -> bool {
    delay_seconds > 0 && delay_seconds != NO_DELAY
}

fn seconds_to_ms(seconds: u32) -> u64 {
    if seconds == NO_DELAY {
        return NEVER_MS;
    }
    u64::from(seconds).saturating_mul(1000)
}
