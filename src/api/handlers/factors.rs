//! Factor listing and management endpoints.
//!
//! Listing reflects the session's requested intent; management requires a
//! Decrypt-grade authentication on the session. Smart-card and fingerprint
//! factors are provisioned through their dedicated flows, not this surface.

use crate::api::ApiContext;
use crate::api::handlers::{ErrorBody, error_response, parse_token};
use crate::error::AuthError;
use crate::factor::lockout::LockoutPolicy;
use crate::factor::{AuthFactor, FactorMetadata, FactorType};
use crate::session::FactorDescription;
use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ListFactorsResponse {
    pub factors: Vec<FactorDescription>,
    pub supported_factor_types: Vec<FactorType>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddFactorRequest {
    pub label: String,
    pub kind: FactorType,
    /// Required for knowledge factors, ignored otherwise.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_lockout_policy")]
    pub lockout_policy: LockoutPolicy,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddVerifierRequest {
    pub label: String,
    pub kind: FactorType,
    pub secret: String,
}

fn default_lockout_policy() -> LockoutPolicy {
    LockoutPolicy::None
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{token}/factors",
    responses(
        (status = 200, description = "Factors usable under the session's intent", body = ListFactorsResponse),
        (status = 404, description = "Unknown session", body = ErrorBody)
    ),
    tag = "factors",
)]
pub async fn list_factors(
    context: Extension<Arc<ApiContext>>,
    Path(token): Path<String>,
) -> Response {
    let token = match parse_token(&token) {
        Ok(token) => token,
        Err(response) => return response,
    };
    match context.manager().list_factors(&token).await {
        Ok(factors) => (
            StatusCode::OK,
            Json(ListFactorsResponse {
                factors,
                supported_factor_types: context.supported_factor_types(),
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    get,
    path = "/v1/accounts/{account_id}/factors",
    responses(
        (status = 200, description = "All configured factors for the account", body = ListFactorsResponse),
        (status = 400, description = "Malformed account id", body = ErrorBody)
    ),
    tag = "factors",
)]
/// Account-scoped listing for provisioning surfaces that hold no session.
pub async fn list_account_factors(
    context: Extension<Arc<ApiContext>>,
    Path(account_id): Path<String>,
) -> Response {
    match context.manager().list_account_factors(&account_id).await {
        Ok(factors) => (
            StatusCode::OK,
            Json(ListFactorsResponse {
                factors,
                supported_factor_types: context.supported_factor_types(),
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{token}/factors",
    request_body = AddFactorRequest,
    responses(
        (status = 204, description = "Factor persisted"),
        (status = 400, description = "Malformed factor", body = ErrorBody),
        (status = 401, description = "Session lacks Decrypt", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    ),
    tag = "factors",
)]
pub async fn add_factor(
    context: Extension<Arc<ApiContext>>,
    Path(token): Path<String>,
    payload: Option<Json<AddFactorRequest>>,
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
    let factor = match build_factor(request) {
        Ok(factor) => factor,
        Err(response) => return response,
    };
    match context.manager().add_factor(&token, factor).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{token}/factors/{label}",
    responses(
        (status = 204, description = "Factor removed"),
        (status = 400, description = "Cannot remove the last factor", body = ErrorBody),
        (status = 401, description = "Session lacks Decrypt", body = ErrorBody),
        (status = 404, description = "Unknown session or factor", body = ErrorBody)
    ),
    tag = "factors",
)]
pub async fn remove_factor(
    context: Extension<Arc<ApiContext>>,
    Path((token, label)): Path<(String, String)>,
) -> Response {
    let token = match parse_token(&token) {
        Ok(token) => token,
        Err(response) => return response,
    };
    match context.manager().remove_factor(&token, &label).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{token}/verifiers",
    request_body = AddVerifierRequest,
    responses(
        (status = 204, description = "Verifier installed"),
        (status = 400, description = "Unsupported factor type", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    ),
    tag = "factors",
)]
/// Install an in-memory verifier (the only authentication path for
/// ephemeral sessions).
pub async fn add_verifier(
    context: Extension<Arc<ApiContext>>,
    Path(token): Path<String>,
    payload: Option<Json<AddVerifierRequest>>,
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
    let secret = SecretString::from(request.secret);
    match context
        .manager()
        .add_credential_verifier(&token, &request.label, request.kind, &secret)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

fn build_factor(request: AddFactorRequest) -> Result<AuthFactor, Response> {
    match request.kind {
        FactorType::Password | FactorType::Pin | FactorType::Recovery => {
            let Some(secret) = request.secret else {
                return Err(error_response(&AuthError::InvalidArgument(format!(
                    "factor type {:?} requires a secret",
                    request.kind
                ))));
            };
            Ok(AuthFactor::with_secret(
                request.label,
                request.kind,
                &SecretString::from(secret),
                request.lockout_policy,
            ))
        }
        FactorType::Kiosk => Ok(AuthFactor {
            label: request.label,
            kind: FactorType::Kiosk,
            metadata: FactorMetadata::Kiosk,
            lockout_policy: request.lockout_policy,
        }),
        FactorType::SmartCard | FactorType::Fingerprint | FactorType::LegacyFingerprint => {
            Err(error_response(&AuthError::InvalidArgument(format!(
                "factor type {:?} is provisioned through its dedicated flow",
                request.kind
            ))))
        }
    }
}
