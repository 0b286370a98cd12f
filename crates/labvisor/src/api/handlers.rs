//! REST handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use labvisor_protocol::{
    FlagResult, SessionView, StartSessionRequest, VerifyOutcome, VerifyRule,
};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::session::StopReason;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backends: Vec<String>,
    pub default_backend: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let drivers = state.registry.drivers();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backends: drivers.kinds().iter().map(|k| k.to_string()).collect(),
        default_backend: drivers.default_kind().to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<String>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<SessionView>> {
    Json(state.registry.list(query.user_id.as_deref()))
}

/// `201` for a new session, `200` when an active one was returned.
#[instrument(skip(state, request), fields(user_id = %request.user_id, preset = %request.preset))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionView>)> {
    let outcome = state.registry.start_session(request).await?;
    let status = if outcome.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    Ok(Json(state.registry.status(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    pub reason: Option<String>,
}

#[instrument(skip(state))]
pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> ApiResult<Json<SessionView>> {
    let reason: StopReason = query
        .reason
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(ApiError::bad_request)?;
    Ok(Json(state.registry.stop_session(&id, reason).await?))
}

#[derive(Debug, Deserialize)]
pub struct TouchRequest {
    pub extend_minutes: Option<u32>,
}

pub async fn touch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<TouchRequest>>,
) -> ApiResult<Json<SessionView>> {
    let extend = body.and_then(|Json(b)| b.extend_minutes);
    Ok(Json(state.registry.touch(&id, extend)?))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub rule: VerifyRule,
}

pub async fn verify_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<Json<VerifyOutcome>> {
    Ok(Json(state.registry.verify(&id, &request.rule).await?))
}

#[derive(Debug, Serialize)]
pub struct CommandsResponse {
    pub commands: Vec<String>,
}

pub async fn session_commands(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CommandsResponse>> {
    let commands = state.registry.commands(&id)?;
    Ok(Json(CommandsResponse { commands }))
}

#[derive(Debug, Deserialize)]
pub struct FlagRequest {
    pub flag: String,
}

pub async fn submit_flag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FlagRequest>,
) -> ApiResult<Json<FlagResult>> {
    if request.flag.trim().is_empty() {
        return Err(ApiError::bad_request("flag is required"));
    }
    Ok(Json(state.registry.submit_flag(&id, &request.flag)?))
}
