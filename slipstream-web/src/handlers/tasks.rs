//! Background task endpoints

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{Value, json};
use slipstream_core::TaskSnapshot;

use crate::error::ApiError;
use crate::server::AppState;

pub async fn api_list_tasks(State(state): State<AppState>) -> Json<Vec<TaskSnapshot>> {
    Json(state.service.list_tasks())
}

pub async fn api_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    Ok(Json(state.service.task_status(&task_id)?))
}

/// Requests cancellation; the task reports CANCELLED once it observes it.
pub async fn api_cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.service.cancel_task(&task_id)?;
    Ok(Json(json!({
        "status": "cancelling",
        "task_id": task_id,
    })))
}
