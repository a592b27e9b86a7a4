//! HTTP server
//!
//! Thin axum surface over the engine: the MCP proxy route behind full
//! credential resolution, a cheap status route behind the lightweight
//! check, and admin endpoints for cache/watcher/session introspection.

use crate::auth::{AuthState, InstanceAuth, credential_auth, lightweight_auth};
use crate::config::Config;
use crate::engine::Engine;
use crate::model::ServiceConfig;
use crate::{GatewayError, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use uuid::Uuid;

/// Shared state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Route-level error wrapper mapping the gateway taxonomy onto HTTP
pub struct AppError(GatewayError);

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Authorization(_) => (StatusCode::FORBIDDEN, "not_authorized"),
            GatewayError::TokenInvalid(_) => {
                (StatusCode::UNAUTHORIZED, "reauthorization_required")
            }
            GatewayError::TransientProvider(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
            }
            GatewayError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_configuration"),
            _ => {
                tracing::error!("request failed: {}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.0.to_string(),
        };
        (status, Json(json!({ "error": error, "message": message }))).into_response()
    }
}

/// Build the full application router for an engine
pub fn build_router(engine: Arc<Engine>) -> Router {
    let state = AppState {
        engine: engine.clone(),
    };
    let auth_state = AuthState::new(engine.coordinator().clone());

    let proxy_routes = Router::new()
        .route("/mcp/{service}/{instance_id}", post(mcp_proxy))
        .route_layer(axum::middleware::from_fn_with_state(
            auth_state.clone(),
            credential_auth,
        ));

    let status_routes = Router::new()
        .route(
            "/instances/{service}/{instance_id}/status",
            get(instance_status),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            auth_state,
            lightweight_auth,
        ));

    let admin_routes = Router::new()
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/cleanup", post(cache_cleanup))
        .route("/admin/watcher/status", get(watcher_status))
        .route("/admin/watcher/refresh/{instance_id}", post(force_refresh))
        .route("/admin/sessions/stats", get(session_stats));

    Router::new()
        .route("/healthz", get(health))
        .merge(proxy_routes)
        .merge(status_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                ]),
        )
}

/// Bind and serve until interrupted, then stop background tasks
pub async fn serve(config: Config, engine: Arc<Engine>) -> Result<()> {
    let http = config.http.clone().unwrap_or_default();
    let addr = format!("{}:{}", http.host, http.port);

    engine.start_credential_watcher();
    engine.start_session_cleanup();

    let app = build_router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install shutdown handler: {}", e);
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "portico" }))
}

/// Proxy one MCP request upstream with the instance's live credential
async fn mcp_proxy(
    State(state): State<AppState>,
    auth: InstanceAuth,
    Json(payload): Json<Value>,
) -> std::result::Result<Json<Value>, AppError> {
    let mut service_config = ServiceConfig::new(&auth.service_name);
    if let Some(entry) = state.engine.config().services.get(&auth.service_name) {
        service_config.base_url = entry.base_url.clone();
        service_config.settings = entry.settings.clone();
    }

    let handler = state.engine.get_or_create_handler(
        auth.instance_id,
        &service_config,
        &auth.bearer_token,
    )?;
    let response = handler.handle(payload).await?;
    Ok(Json(response))
}

/// Connection status without touching tokens or the provider
async fn instance_status(
    State(state): State<AppState>,
    auth: InstanceAuth,
) -> Json<Value> {
    let cached = state.engine.peek_cached_credential(auth.instance_id);
    Json(json!({
        "instanceId": auth.instance_id,
        "service": auth.service_name,
        "cached": cached.is_some(),
        "tokenExpiresAt": cached.as_ref().map(|e| e.expires_at),
        "refreshAttempts": cached.as_ref().map(|e| e.refresh_attempts),
        "status": cached.as_ref().map(|e| e.status),
    }))
}

async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.engine.get_cache_statistics()).unwrap_or(Value::Null))
}

async fn cache_cleanup(State(state): State<AppState>) -> Json<Value> {
    let removed = state.engine.manual_cleanup();
    Json(json!({ "removed": removed }))
}

async fn watcher_status(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.engine.get_watcher_status()).unwrap_or(Value::Null))
}

async fn force_refresh(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> std::result::Result<Json<Value>, AppError> {
    let instance_id = Uuid::parse_str(&instance_id)
        .map_err(|_| GatewayError::config(format!("'{}' is not a valid instance id", instance_id)))?;
    let entry = state.engine.force_refresh_instance_token(instance_id).await?;
    Ok(Json(json!({
        "instanceId": instance_id,
        "tokenExpiresAt": entry.expires_at,
    })))
}

async fn session_stats(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.engine.get_session_statistics()).unwrap_or(Value::Null))
}
