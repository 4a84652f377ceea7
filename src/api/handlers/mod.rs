//! HTTP handlers and the error-to-status mapping they share.

pub mod factors;
pub mod health;
pub mod session;

use crate::error::AuthError;
use crate::session::token::SessionToken;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    /// Present on lockout failures: milliseconds until the factor is
    /// usable again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_available_ms: Option<u64>,
}

pub(crate) fn error_status(err: &AuthError) -> StatusCode {
    match err {
        AuthError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        // Unknown factors map to 404 like unknown sessions: the surface
        // never confirms what does not exist.
        AuthError::SessionNotFound | AuthError::NoSuchFactor(_) => StatusCode::NOT_FOUND,
        AuthError::Unauthenticated | AuthError::WrongSecret => StatusCode::UNAUTHORIZED,
        AuthError::LockedOut { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthError::HardwareTransient | AuthError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::HardwareFatal | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: &AuthError) -> Response {
    let time_available_ms = match err {
        AuthError::LockedOut { time_available_ms } => Some(*time_available_ms),
        _ => None,
    };
    (
        error_status(err),
        Json(ErrorBody {
            error: err.to_string(),
            time_available_ms,
        }),
    )
        .into_response()
}

/// Resolve a path token. Malformed tokens get the same 404 as unknown
/// ones so the surface stays unguessable.
pub(crate) fn parse_token(raw: &str) -> Result<SessionToken, Response> {
    raw.parse()
        .map_err(|_| error_response(&AuthError::SessionNotFound))
}
