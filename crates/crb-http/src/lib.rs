//! JSON-over-HTTP transport for the gateway.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crb_core::{domain::TenantId, gateway::Gateway, session::AuthProgress, Error};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/status/{tenant}", get(status))
        .route("/qr/{tenant}", get(qr))
        .route("/pairing-code", post(pairing_code))
        .route("/send", post(send))
        .route("/connect/{tenant}", post(connect))
        .route("/disconnect/{tenant}", post(disconnect))
        .route("/reconnect/{tenant}", post(reconnect))
        .route("/sessions", get(sessions))
        .route("/health", get(health))
        .with_state(AppState { gateway })
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")?;
    tracing::info!("http server stopped");
    Ok(())
}

// ============== Errors ==============

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotConnected(_) => StatusCode::CONFLICT,
            Error::ChallengeTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::SendFailed(_) | Error::Transient(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!("request failed: {}", self.0);
        }
        let body = json!({ "success": false, "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn tenant_from(raw: &str) -> ApiResult<TenantId> {
    Ok(TenantId::parse(raw)?)
}

fn already_connected() -> Json<Value> {
    Json(json!({
        "success": false,
        "connected": true,
        "error": "already connected",
    }))
}

// ============== Handlers ==============

async fn status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = tenant_from(&tenant)?;
    Ok(Json(state.gateway.status(&tenant)))
}

async fn qr(State(state): State<AppState>, Path(tenant): Path<String>) -> ApiResult<Json<Value>> {
    let tenant = tenant_from(&tenant)?;
    match state.gateway.request_qr(&tenant).await? {
        AuthProgress::Challenge(qr) => Ok(Json(json!({ "success": true, "qr": qr }))),
        AuthProgress::Connected => Ok(already_connected()),
    }
}

#[derive(Debug, Deserialize)]
struct PairingBody {
    tenant: String,
    phone_number: String,
}

async fn pairing_code(
    State(state): State<AppState>,
    Json(body): Json<PairingBody>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from(&body.tenant)?;
    match state
        .gateway
        .request_pairing(&tenant, &body.phone_number)
        .await?
    {
        AuthProgress::Challenge(code) => {
            Ok(Json(json!({ "success": true, "pairing_code": code })))
        }
        AuthProgress::Connected => Ok(already_connected()),
    }
}

#[derive(Debug, Deserialize)]
struct SendBody {
    tenant: String,
    to: String,
    message: String,
}

async fn send(State(state): State<AppState>, Json(body): Json<SendBody>) -> ApiResult<Json<Value>> {
    let tenant = tenant_from(&body.tenant)?;
    let id = state.gateway.send(&tenant, &body.to, &body.message).await?;
    Ok(Json(json!({ "success": true, "message_id": id })))
}

async fn connect(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = tenant_from(&tenant)?;
    state.gateway.connect(&tenant).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "message": "connection started" })),
    ))
}

async fn disconnect(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from(&tenant)?;
    state.gateway.disconnect(&tenant).await?;
    Ok(Json(json!({ "success": true })))
}

async fn reconnect(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = tenant_from(&tenant)?;
    state.gateway.reconnect(&tenant).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "success": true }))))
}

async fn sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.gateway.list() }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let report = state.gateway.health();
    Json(json!({
        "status": "ok",
        "total_sessions": report.total_sessions,
        "connected_sessions": report.connected_sessions,
        "connecting": report.connecting_sessions,
        "uptime_secs": report.uptime_secs,
    }))
}
