//! Race endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::server::AppState;

/// Starts a background race; the response carries the task id to poll.
pub async fn api_race(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let task_id = state.service.start_race(&hash)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "task_id": task_id,
        })),
    ))
}

pub async fn api_post_race(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let resumed = state.service.finish_race(&hash).await?;
    Ok(Json(json!({
        "status": "ok",
        "resumed": resumed,
    })))
}
