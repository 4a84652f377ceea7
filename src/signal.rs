//! Best-effort authentication signals.
//!
//! Every successful authentication (and the trivial post-provisioning
//! grant) is announced to a sink so UI and telemetry can react. Delivery is
//! fire-and-forget: a sink must never block or fail the authentication
//! outcome.

use crate::factor::FactorType;
use crate::session::token::BroadcastToken;
use tracing::info;

/// What produced the successful authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthSource {
    /// A configured or in-memory factor.
    Factor { label: String, kind: FactorType },
    /// The trivial grant right after account provisioning.
    NewAccount,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthEvent {
    /// Safe to hand to lower-trust observers.
    pub broadcast_token: BroadcastToken,
    pub obfuscated_account_id: String,
    pub source: AuthSource,
}

pub trait SignalSink: Send + Sync {
    fn authenticated(&self, event: &AuthEvent);
}

/// Default sink: structured log records only.
#[derive(Clone, Copy, Debug)]
pub struct TracingSignalSink;

impl SignalSink for TracingSignalSink {
    fn authenticated(&self, event: &AuthEvent) {
        match &event.source {
            AuthSource::Factor { label, kind } => info!(
                account = %event.obfuscated_account_id,
                session = %event.broadcast_token,
                label = %label,
                kind = kind.as_str(),
                "authentication succeeded"
            ),
            AuthSource::NewAccount => info!(
                account = %event.obfuscated_account_id,
                session = %event.broadcast_token,
                "new account authorized"
            ),
        }
    }
}
