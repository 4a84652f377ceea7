use crate::api::{self, ApiContext};
use crate::challenge::ChallengeCredentialsHelper;
use crate::challenge::backend::SoftwareSealingBackend;
use crate::factor::dispatch::VerificationDispatch;
use crate::factor::rate_limiter::NoopRateLimiter;
use crate::factor::store::InMemoryFactorStore;
use crate::session::SessionServices;
use crate::session::manager::AuthSessionManager;
use crate::signal::TracingSignalSink;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
}

/// Execute the server action.
///
/// Collaborators default to the development stack (in-memory factor store,
/// software sealing backend, no rate limiter). Embedders with real hardware
/// assemble [`SessionServices`] themselves and call [`api::serve`].
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    warn!("no security module wired, using the software development stack");

    let rate_limiter = Arc::new(NoopRateLimiter);
    let challenge_helper = Arc::new(ChallengeCredentialsHelper::new(Arc::new(
        SoftwareSealingBackend::new(),
    )));
    let dispatch = Arc::new(VerificationDispatch::new(
        rate_limiter.clone(),
        challenge_helper,
    ));
    let services = SessionServices::new(
        Arc::new(InMemoryFactorStore::new()),
        rate_limiter,
        dispatch,
        Arc::new(TracingSignalSink),
    );
    let manager = AuthSessionManager::new(services.clone());
    let context = Arc::new(ApiContext::new(manager, services));

    info!(port = args.port, "starting session authority");
    let result = api::serve(args.port, context).await;
    crate::cli::telemetry::shutdown_tracer();
    result
}
