//! Connection negotiation endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use super::auth::Caller;
use super::connection_key;
use super::error::{ApiError, ApiResult};
use crate::transport::{
    Capabilities, ConnectionRegistration, ConnectionState, FallbackOutcome,
};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenConnectionResponse {
    pub connection_id: String,
    pub mode: ConnectionState,
    /// Seconds the client has to attach the push stream
    pub handshake_timeout_secs: u64,
    pub registration: ConnectionRegistration,
}

#[derive(Debug, Default, Deserialize)]
pub struct FallbackRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackResponse {
    pub mode: ConnectionState,
    pub registration: ConnectionRegistration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    pub last_event_id: u64,
}

/// POST /connections
pub async fn open_connection(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Option<Json<Capabilities>>,
) -> ApiResult<(StatusCode, Json<OpenConnectionResponse>)> {
    let capabilities = body.map(|Json(c)| c).unwrap_or_default();
    let registration = state
        .negotiator
        .open(&caller.tenant_id, &caller.user_id, capabilities)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(OpenConnectionResponse {
            connection_id: registration.connection_id.to_string(),
            mode: registration.state,
            handshake_timeout_secs: state.config.transport.handshake_timeout_secs,
            registration,
        }),
    ))
}

/// GET /connections/:id
pub async fn get_connection(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<ConnectionRegistration>> {
    let key = connection_key(&caller, &id)?;
    Ok(Json(state.negotiator.registry().require(&key).await?))
}

/// POST /connections/:id/fallback
///
/// 503 with `manualRefresh` once no mode is left.
pub async fn fallback(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    body: Option<Json<FallbackRequest>>,
) -> ApiResult<Json<FallbackResponse>> {
    let key = connection_key(&caller, &id)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "client reported failure".to_string());
    match state.negotiator.fallback(&key, &reason).await? {
        FallbackOutcome::Degraded(registration) => Ok(Json(FallbackResponse {
            mode: registration.state,
            registration,
        })),
        FallbackOutcome::Exhausted => Err(ApiError::TransportExhausted),
    }
}

/// POST /connections/:id/ack
pub async fn ack(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<AckRequest>,
) -> ApiResult<Json<ConnectionRegistration>> {
    let key = connection_key(&caller, &id)?;
    Ok(Json(state.negotiator.ack(&key, body.last_event_id).await?))
}

/// DELETE /connections/:id
pub async fn close_connection(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let key = connection_key(&caller, &id)?;
    if state.negotiator.close(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("connection {id}")))
    }
}

/// Build connection routes
pub fn connection_routes() -> Router<AppState> {
    Router::new()
        .route("/connections", post(open_connection))
        .route(
            "/connections/:id",
            get(get_connection).delete(close_connection),
        )
        .route("/connections/:id/fallback", post(fallback))
        .route("/connections/:id/ack", post(ack))
}
