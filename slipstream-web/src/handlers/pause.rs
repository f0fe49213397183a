//! Manual pause and unpause endpoints

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{Value, json};
use slipstream_core::{DEFAULT_PAUSE_ID, PauseOverride};

use crate::error::ApiError;
use crate::server::AppState;

/// An empty body keeps the configured criteria.
fn parse_override(body: &[u8]) -> Result<Option<PauseOverride>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::bad_request(format!("invalid pause criteria: {e}")))
}

async fn pause(state: &AppState, id: &str, body: &[u8]) -> Result<Json<Value>, ApiError> {
    let overrides = parse_override(body)?;
    let obligation = state.service.pause(id, overrides.as_ref()).await?;
    Ok(Json(json!({
        "status": "ok",
        "id": obligation.id,
        "paused": obligation.paused_set,
    })))
}

async fn unpause(state: &AppState, id: &str) -> Result<Json<Value>, ApiError> {
    let resumed = state.service.unpause(id).await?;
    Ok(Json(json!({
        "status": "ok",
        "id": id,
        "resumed": resumed,
    })))
}

pub async fn api_pause_default(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    pause(&state, DEFAULT_PAUSE_ID, &body).await
}

pub async fn api_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    pause(&state, &id, &body).await
}

pub async fn api_unpause_default(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    unpause(&state, DEFAULT_PAUSE_ID).await
}

pub async fn api_unpause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    unpause(&state, &id).await
}
