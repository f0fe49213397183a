//! Torrent listing, configuration and pause database endpoints

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use slipstream_core::torrent::{OutputFormat, flatten_fields, format_torrent_info};
use slipstream_core::{PauseObligation, SlipstreamConfig, StatusFilter, TorrentFilter};

use crate::error::ApiError;
use crate::server::{AppState, ROUTES};

/// Query string for `GET /info`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InfoQuery {
    pub status: StatusFilter,
    /// Comma separated field names
    pub fields: Option<String>,
    pub include_field_names: bool,
    pub format: OutputFormat,
}

pub async fn api_routes() -> Json<Value> {
    let routes: Vec<Value> = ROUTES
        .iter()
        .map(|(method, path)| json!({ "method": method, "path": path }))
        .collect();
    Json(json!({ "routes": routes }))
}

pub async fn api_info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> Result<Response, ApiError> {
    let torrents = state
        .service
        .query_torrents(&TorrentFilter::with_status(query.status))
        .await?;

    let fields = query
        .fields
        .as_ref()
        .map(|fields| flatten_fields(std::slice::from_ref(fields)));
    let rendered = format_torrent_info(
        &torrents,
        fields.as_deref(),
        query.include_field_names,
        query.format,
    )
    .map_err(ApiError::bad_request)?;

    let content_type = match query.format {
        OutputFormat::Json => "application/json",
        OutputFormat::Plain => "text/plain; charset=utf-8",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], rendered).into_response())
}

pub async fn api_get_config(
    State(state): State<AppState>,
) -> Result<Json<SlipstreamConfig>, ApiError> {
    Ok(Json(state.service.config()?))
}

/// Validates the submitted configuration before it replaces the stored one.
pub async fn api_update_config(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let text = std::str::from_utf8(&body).map_err(ApiError::bad_request)?;
    let config = SlipstreamConfig::from_json(text).map_err(slipstream_core::ServiceError::from)?;
    state.service.update_config(&config)?;
    tracing::info!("Configuration updated at {}", state.service.config_location());
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn api_list_db(
    State(state): State<AppState>,
) -> Result<Json<Vec<PauseObligation>>, ApiError> {
    Ok(Json(state.service.list_obligations().await?))
}

pub async fn api_clear_db(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let deleted = state.service.clear_obligations().await?;
    Ok(Json(json!({ "status": "ok", "deleted": deleted })))
}

pub async fn api_delete_db_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.service.delete_obligation(&id).await?;
    Ok(Json(json!({ "status": "ok", "deleted": id })))
}
