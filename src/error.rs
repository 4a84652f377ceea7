//! Caller-facing error taxonomy for session and factor operations.
//!
//! The distinction between retryable and fatal classes is load-bearing:
//! callers decide whether to re-prompt the user based on the variant, so
//! lower layers never downgrade a fatal error to a retryable one or the
//! other way around.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The request itself is malformed; retrying without fixing the input
    /// cannot succeed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The token is unknown, expired, or invalidated. The caller must start
    /// a new session.
    #[error("session not found")]
    SessionNotFound,

    /// The operation requires a prior successful authentication on this
    /// session.
    #[error("session has not been authenticated")]
    Unauthenticated,

    /// No factor is configured under the given label.
    #[error("no factor configured for label {0:?}")]
    NoSuchFactor(String),

    /// The supplied secret did not match.
    #[error("wrong secret")]
    WrongSecret,

    /// The factor is rate limited. `time_available_ms` is the countdown
    /// until it becomes usable again (`u64::MAX` = never/unknown).
    #[error("factor locked out, available again in {time_available_ms}ms")]
    LockedOut { time_available_ms: u64 },

    /// Hardware failed in a way that may resolve on its own; the caller may
    /// retry later. Internal retries were already exhausted.
    #[error("transient hardware failure, the caller may retry")]
    HardwareTransient,

    /// Hardware failed in a way that requires user action, e.g. a firmware
    /// update. Never retried.
    #[error("fatal hardware failure, retrying requires user action")]
    HardwareFatal,

    /// The operation was preempted by a newer request on the same
    /// single-flight resource.
    #[error("operation cancelled by a newer request")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Whether the caller may retry the same request without changing
    /// anything first.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HardwareTransient | Self::Cancelled)
    }

    /// Whether the failure is worth re-prompting the user for input.
    #[must_use]
    pub fn is_user_actionable(&self) -> bool {
        matches!(self, Self::WrongSecret | Self::NoSuchFactor(_))
    }
}
