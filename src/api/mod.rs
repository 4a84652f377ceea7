//! Local HTTP adapter over the session authority.
//!
//! This surface exists for on-device tooling and tests; the production IPC
//! transport is a separate component. The router is documented through the
//! same wiring that serves it, so the `OpenAPI` document can never drift
//! from the routes.

use crate::challenge::delegate::KeyChallengeService;
use crate::factor::{FactorType, supported_factor_types};
use crate::session::SessionServices;
use crate::session::manager::AuthSessionManager;
use anyhow::Result;
use axum::{
    Extension,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request},
};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::mpsc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, debug_span, info};
use ulid::Ulid;
use utoipa::openapi::{InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

pub mod handlers;

/// Reasons the server shuts down gracefully.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Interrupted,
}

/// Shared state handed to every handler.
pub struct ApiContext {
    manager: Arc<AuthSessionManager>,
    services: SessionServices,
    delegate: Option<Arc<dyn KeyChallengeService>>,
}

impl ApiContext {
    #[must_use]
    pub fn new(manager: Arc<AuthSessionManager>, services: SessionServices) -> Self {
        Self {
            manager,
            services,
            delegate: None,
        }
    }

    /// Wire the device's challenge delegate, enabling smart-card
    /// authentication over this surface.
    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn KeyChallengeService>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<AuthSessionManager> {
        &self.manager
    }

    pub(crate) fn delegate(&self) -> Option<Arc<dyn KeyChallengeService>> {
        self.delegate.clone()
    }

    #[must_use]
    pub fn supported_factor_types(&self) -> Vec<FactorType> {
        supported_factor_types(
            self.services.rate_limiter(),
            self.delegate.is_some(),
            self.services.dispatch().has_biometrics(),
        )
    }
}

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both
/// served and included in the generated spec.
fn api_router() -> OpenApiRouter {
    let mut openapi = cargo_openapi();
    let mut sessions_tag = Tag::new("sessions");
    sessions_tag.description = Some("Authentication session lifecycle".to_string());
    let mut factors_tag = Tag::new("factors");
    factors_tag.description = Some("Configured auth factors".to_string());
    openapi.tags = Some(vec![sessions_tag, factors_tag]);

    OpenApiRouter::with_openapi(openapi)
        .routes(routes!(handlers::health::live))
        .routes(routes!(handlers::health::health))
        .routes(routes!(handlers::session::start_session))
        .routes(routes!(handlers::session::invalidate_session))
        .routes(routes!(handlers::session::authenticate))
        .routes(routes!(handlers::session::extend))
        .routes(routes!(handlers::session::account_created))
        .routes(routes!(
            handlers::factors::list_factors,
            handlers::factors::add_factor
        ))
        .routes(routes!(handlers::factors::remove_factor))
        .routes(routes!(handlers::factors::add_verifier))
        .routes(routes!(handlers::factors::list_account_factors))
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.license = optional_str(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });
    OpenApiBuilder::new().info(info).build()
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

/// Serve the API on the loopback interface until interrupted, then tear
/// the registry down so every token stops resolving.
///
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(port: u16, context: Arc<ApiContext>) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownSignal>();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(ShutdownSignal::Interrupted);
        }
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any);

    let (router, _openapi) = api_router().split_for_parts();
    let app = router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &Request<Body>| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors)
            .layer(Extension(context.clone())),
    );

    // The authority is device-local; never bind a routable interface.
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    info!("Listening on 127.0.0.1:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await;
            info!("Gracefully shutdown");
        })
        .await?;

    context.manager().shutdown().map_err(anyhow::Error::from)?;
    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, request_id)
}
