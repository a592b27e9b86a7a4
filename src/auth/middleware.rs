//! Per-request credential resolution middleware
//!
//! Every proxied request passes through `credential_auth`, which turns a
//! `{service}/{instance_id}` path pair into a live bearer token via the
//! refresh coordinator: cache fast path, lazy refresh, or cold load.
//! Routes that only need to know an instance exists use
//! `lightweight_auth` and skip credential resolution entirely.

use crate::GatewayError;
use crate::refresh::RefreshCoordinator;
use axum::{
    Json,
    extract::{FromRequestParts, Path, Request, State},
    http::{StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Shared state for the auth middleware layers
#[derive(Clone)]
pub struct AuthState {
    pub coordinator: Arc<RefreshCoordinator>,
}

impl AuthState {
    pub fn new(coordinator: Arc<RefreshCoordinator>) -> Self {
        Self { coordinator }
    }
}

/// Resolved identity attached to the request by `credential_auth`
#[derive(Debug, Clone)]
pub struct InstanceAuth {
    pub instance_id: Uuid,
    pub service_name: String,
    pub user_id: String,
    pub bearer_token: String,
}

impl<S> FromRequestParts<S> for InstanceAuth
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<InstanceAuth>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "credential middleware not configured for this route".to_string(),
        ))
    }
}

/// Full credential resolution: the request proceeds with a token that is
/// valid for at least the refresh margin, or is rejected with a status
/// describing what the caller should do about it.
pub async fn credential_auth(
    State(auth): State<AuthState>,
    Path((service, instance_id)): Path<(String, String)>,
    mut req: Request,
    next: Next,
) -> Response {
    let Ok(instance_id) = Uuid::parse_str(&instance_id) else {
        audit_rejection(&instance_id, &service, "invalid_instance_id", StatusCode::BAD_REQUEST);
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_instance_id",
            format!("'{}' is not a valid instance id", instance_id),
        );
    };

    match auth.coordinator.resolve(instance_id, &service).await {
        Ok(entry) => {
            req.extensions_mut().insert(InstanceAuth {
                instance_id,
                service_name: service,
                user_id: entry.user_id.clone(),
                bearer_token: entry.bearer_token.clone(),
            });
            next.run(req).await
        }
        Err(e) => reject(instance_id, &service, e),
    }
}

/// Existence and status check only. No token is resolved and no refresh
/// is triggered, so status endpoints stay cheap and never touch the
/// provider.
pub async fn lightweight_auth(
    State(auth): State<AuthState>,
    Path((service, instance_id)): Path<(String, String)>,
    mut req: Request,
    next: Next,
) -> Response {
    let Ok(instance_id) = Uuid::parse_str(&instance_id) else {
        audit_rejection(&instance_id, &service, "invalid_instance_id", StatusCode::BAD_REQUEST);
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_instance_id",
            format!("'{}' is not a valid instance id", instance_id),
        );
    };

    let creds = match auth
        .coordinator
        .store()
        .lookup_instance_credentials(instance_id, &service)
        .await
    {
        Ok(Some(creds)) => creds,
        Ok(None) => {
            audit_rejection(
                &instance_id.to_string(),
                &service,
                "instance_not_found",
                StatusCode::NOT_FOUND,
            );
            return error_response(
                StatusCode::NOT_FOUND,
                "instance_not_found",
                format!("instance {} not found for service '{}'", instance_id, service),
            );
        }
        Err(e) => return reject(instance_id, &service, e),
    };

    if !creds.service_active || !creds.status.is_active() {
        audit_rejection(
            &instance_id.to_string(),
            &service,
            "instance_inactive",
            StatusCode::FORBIDDEN,
        );
        return error_response(
            StatusCode::FORBIDDEN,
            "instance_inactive",
            format!("instance {} is not active", instance_id),
        );
    }

    req.extensions_mut().insert(InstanceAuth {
        instance_id,
        service_name: service,
        user_id: creds.user_id,
        bearer_token: String::new(),
    });
    next.run(req).await
}

/// Map a resolution failure onto the HTTP surface. Token values never
/// appear in responses or logs.
fn reject(instance_id: Uuid, service: &str, err: GatewayError) -> Response {
    let (status, code, message) = match err {
        GatewayError::NotFound(msg) => (StatusCode::NOT_FOUND, "instance_not_found", msg),
        GatewayError::Authorization(msg) => (StatusCode::FORBIDDEN, "not_authorized", msg),
        // Refresh is no longer possible; the user has to go back
        // through the OAuth consent flow.
        GatewayError::TokenInvalid(msg) => {
            (StatusCode::UNAUTHORIZED, "reauthorization_required", msg)
        }
        GatewayError::TransientProvider(msg) => {
            (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable", msg)
        }
        e => {
            tracing::error!(%instance_id, service, "credential resolution failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "credential resolution failed".to_string(),
            )
        }
    };
    audit_rejection(&instance_id.to_string(), service, code, status);
    error_response(status, code, message)
}

/// One audit line per terminal failure: who was rejected, on what
/// operation, and how it was classified.
fn audit_rejection(instance_id: &str, service: &str, outcome: &str, status: StatusCode) {
    tracing::warn!(
        instance_id,
        service,
        outcome,
        status = status.as_u16(),
        "request rejected"
    );
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    (status, Json(json!({ "error": error, "message": message }))).into_response()
}
