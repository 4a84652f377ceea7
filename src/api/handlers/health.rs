//! Health probe handlers.
//!
//! `/live` reports process liveness only; `/health` adds registry
//! statistics and build identification for supervisors.

use crate::GIT_COMMIT_HASH;
use crate::api::ApiContext;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    sessions: usize,
}

#[utoipa::path(
    get,
    path = "/live",
    responses(
        (status = 200, description = "Process is alive")
    ),
    tag = "health",
)]
/// Report process liveness without checking anything else.
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Authority is serving", body = Health)
    ),
    tag = "health",
)]
/// Report registry statistics and build identification.
pub async fn health(context: Extension<Arc<ApiContext>>) -> impl IntoResponse {
    let sessions = context.manager().session_count().unwrap_or(0);
    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions,
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };
    let mut headers = HeaderMap::new();
    if let Ok(value) =
        format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>()
    {
        debug!("X-App header: {:?}", value);
        headers.insert("X-App", value);
    }

    (StatusCode::OK, headers, Json(health))
}
