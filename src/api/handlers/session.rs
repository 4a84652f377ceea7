//! Session lifecycle endpoints.
//!
//! Flow Overview:
//! 1) `POST /v1/sessions` allocates an unauthenticated session.
//! 2) `POST /v1/sessions/{token}/authenticate` verifies factor input and
//!    grants intents.
//! 3) `POST /v1/sessions/{token}/extend` moves the deadline forward.
//! 4) `DELETE /v1/sessions/{token}` invalidates; always idempotent.
//!
//! Security boundaries: the primary token only ever appears in the start
//! response and in caller-supplied paths; unknown and malformed tokens are
//! indistinguishable (both 404).

use crate::api::ApiContext;
use crate::api::handlers::{ErrorBody, error_response, parse_token};
use crate::error::AuthError;
use crate::factor::{AuthInput, AuthIntent};
use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartSessionRequest {
    pub account_id: String,
    pub intent: AuthIntent,
    #[serde(default)]
    pub ephemeral: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StartSessionResponse {
    pub token: String,
    pub broadcast_token: String,
}

/// Factor input as it crosses the local wire. The smart-card variant
/// carries no payload: the device's registered challenge delegate is used.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthInputRequest {
    Secret { secret: String },
    SmartCard,
    Fingerprint { sample_base64: String },
    Kiosk,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthenticateRequest {
    pub labels: Vec<String>,
    pub input: AuthInputRequest,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthenticateResponse {
    pub authorized_intents: Vec<AuthIntent>,
    /// Seconds until the session expires.
    pub remaining_seconds: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExtendRequest {
    pub seconds: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExtendResponse {
    pub remaining_seconds: u64,
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 200, description = "Session started", body = StartSessionResponse),
        (status = 400, description = "Malformed request", body = ErrorBody)
    ),
    tag = "sessions",
)]
pub async fn start_session(
    context: Extension<Arc<ApiContext>>,
    payload: Option<Json<StartSessionRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(&AuthError::InvalidArgument(
            "missing payload".to_string(),
        ));
    };

    let options = crate::session::SessionOptions::new(request.intent).ephemeral(request.ephemeral);
    match context.manager().start_session(&request.account_id, options) {
        Ok((token, broadcast_token)) => (
            StatusCode::OK,
            Json(StartSessionResponse {
                token: token.to_string(),
                broadcast_token: broadcast_token.to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to start session: {err}");
            error_response(&err)
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{token}/authenticate",
    request_body = AuthenticateRequest,
    responses(
        (status = 200, description = "Authentication succeeded", body = AuthenticateResponse),
        (status = 401, description = "Wrong secret", body = ErrorBody),
        (status = 404, description = "Unknown session or factor", body = ErrorBody),
        (status = 429, description = "Factor locked out", body = ErrorBody)
    ),
    tag = "sessions",
)]
pub async fn authenticate(
    context: Extension<Arc<ApiContext>>,
    Path(token): Path<String>,
    payload: Option<Json<AuthenticateRequest>>,
) -> Response {
    let token = match parse_token(&token) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return error_response(&AuthError::InvalidArgument(
            "missing payload".to_string(),
        ));
    };
    let input = match build_input(&context, request.input) {
        Ok(input) => input,
        Err(response) => return response,
    };

    match context
        .manager()
        .authenticate(&token, &request.labels, &input)
        .await
    {
        Ok(intents) => {
            let remaining = context
                .manager()
                .remaining(&token)
                .await
                .ok()
                .flatten()
                .map_or(0, |duration| duration.as_secs());
            (
                StatusCode::OK,
                Json(AuthenticateResponse {
                    authorized_intents: intents.to_vec(),
                    remaining_seconds: remaining,
                }),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{token}/extend",
    request_body = ExtendRequest,
    responses(
        (status = 200, description = "Deadline extended", body = ExtendResponse),
        (status = 401, description = "Session never authenticated", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    ),
    tag = "sessions",
)]
pub async fn extend(
    context: Extension<Arc<ApiContext>>,
    Path(token): Path<String>,
    payload: Option<Json<ExtendRequest>>,
) -> Response {
    let token = match parse_token(&token) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return error_response(&AuthError::InvalidArgument(
            "missing payload".to_string(),
        ));
    };

    match context
        .manager()
        .extend(&token, Duration::from_secs(request.seconds))
        .await
    {
        Ok(remaining) => (
            StatusCode::OK,
            Json(ExtendResponse {
                remaining_seconds: remaining.as_secs(),
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{token}/account-created",
    responses(
        (status = 200, description = "Provisioning grant applied", body = AuthenticateResponse),
        (status = 400, description = "Grant already consumed", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    ),
    tag = "sessions",
)]
/// Trivial grant for the entity that just provisioned the account.
pub async fn account_created(
    context: Extension<Arc<ApiContext>>,
    Path(token): Path<String>,
) -> Response {
    let token = match parse_token(&token) {
        Ok(token) => token,
        Err(response) => return response,
    };
    match context.manager().on_user_created(&token).await {
        Ok(intents) => {
            let remaining = context
                .manager()
                .remaining(&token)
                .await
                .ok()
                .flatten()
                .map_or(0, |duration| duration.as_secs());
            (
                StatusCode::OK,
                Json(AuthenticateResponse {
                    authorized_intents: intents.to_vec(),
                    remaining_seconds: remaining,
                }),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{token}",
    responses(
        (status = 204, description = "Session invalidated (idempotent)")
    ),
    tag = "sessions",
)]
pub async fn invalidate_session(
    context: Extension<Arc<ApiContext>>,
    Path(token): Path<String>,
) -> Response {
    // Malformed tokens cannot name a live session; the goal "this token
    // must stop working" is already met.
    let Ok(token) = token.parse() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match context.manager().invalidate(&token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Failed to invalidate session: {err}");
            error_response(&err)
        }
    }
}

fn build_input(context: &ApiContext, request: AuthInputRequest) -> Result<AuthInput, Response> {
    match request {
        AuthInputRequest::Secret { secret } => Ok(AuthInput::Secret(SecretString::from(secret))),
        AuthInputRequest::SmartCard => context.delegate().map(|delegate| AuthInput::SmartCard { delegate }).ok_or_else(|| {
            error_response(&AuthError::InvalidArgument(
                "no challenge delegate is configured on this device".to_string(),
            ))
        }),
        AuthInputRequest::Fingerprint { sample_base64 } => STANDARD
            .decode(sample_base64.trim())
            .map(|sample| AuthInput::Fingerprint { sample })
            .map_err(|_| {
                error_response(&AuthError::InvalidArgument(
                    "fingerprint sample must be base64".to_string(),
                ))
            }),
        AuthInputRequest::Kiosk => Ok(AuthInput::Kiosk),
    }
}
