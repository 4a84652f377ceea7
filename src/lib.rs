//! # Custode (Device Credential & Session Authority)
//!
//! `custode` is the on-device authority that decides whether a caller is
//! allowed to act on a local account, and for how long. It turns a
//! user-supplied secret (password, PIN, smart-card challenge, fingerprint,
//! kiosk token) into an authorization decision recorded on a time-bounded
//! session.
//!
//! ## Session Model
//!
//! Callers start an [`session::AuthSession`] through the process-wide
//! [`session::AuthSessionManager`] and receive an unguessable token. Every
//! later operation resolves that token through the manager, which guarantees
//! at most one accessor per session at a time (lookups queue, they never
//! race). A session starts unauthenticated; the first successful factor
//! verification authorizes a set of intents and arms a five-minute timeout
//! that can only be extended, never shortened.
//!
//! ## Factor Verification
//!
//! Each configured factor type maps to exactly one verification strategy in
//! [`factor::dispatch`]. Strategies consult narrow collaborator traits for
//! persistence, rate limiting, biometrics, and challenge-response hardware,
//! so the state machine itself is deterministic and testable in isolation.
//!
//! Security boundaries:
//! - Raw secrets never reach the registry; only digests are compared.
//! - Rate-limited factors are checked against the limiter *before* the
//!   secret comparison, so a locked-out factor never burns an attempt.
//! - The challenge-response helper admits one in-flight operation; starting
//!   another cancels the first with a failure distinct from hardware errors.

pub mod api;
pub mod challenge;
pub mod cli;
pub mod error;
pub mod factor;
pub mod session;
pub mod signal;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
