//! Axum server for the Slipstream JSON API
//!
//! Routes are registered in [`router`]; [`run_server`] binds it and cancels
//! every running task when the process receives Ctrl-C.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use slipstream_core::RaceService;
use tower_http::cors::CorsLayer;

use crate::handlers::{
    api_cancel_task, api_clear_db, api_delete_db_entry, api_get_config, api_info, api_list_db,
    api_list_tasks, api_pause, api_pause_default, api_post_race, api_race, api_routes,
    api_task_status, api_unpause, api_unpause_default, api_update_config,
};

/// Method and path of every route, served by `GET /`.
pub const ROUTES: &[(&str, &str)] = &[
    ("GET", "/"),
    ("POST", "/race/{hash}"),
    ("POST", "/post-race/{hash}"),
    ("POST", "/pause"),
    ("POST", "/pause/{id}"),
    ("POST", "/unpause"),
    ("POST", "/unpause/{id}"),
    ("GET", "/info"),
    ("GET", "/tasks"),
    ("GET", "/tasks/{task_id}"),
    ("POST", "/cancel/{task_id}"),
    ("DELETE", "/cancel/{task_id}"),
    ("GET", "/config"),
    ("PUT", "/config"),
    ("POST", "/config"),
    ("GET", "/db"),
    ("DELETE", "/db"),
    ("DELETE", "/db/{id}"),
];

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RaceService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api_routes))
        .route("/race/{hash}", post(api_race))
        .route("/post-race/{hash}", post(api_post_race))
        .route("/pause", post(api_pause_default))
        .route("/pause/{id}", post(api_pause))
        .route("/unpause", post(api_unpause_default))
        .route("/unpause/{id}", post(api_unpause))
        .route("/info", get(api_info))
        .route("/tasks", get(api_list_tasks))
        .route("/tasks/{task_id}", get(api_task_status))
        .route("/cancel/{task_id}", post(api_cancel_task).delete(api_cancel_task))
        .route(
            "/config",
            get(api_get_config)
                .put(api_update_config)
                .post(api_update_config),
        )
        .route("/db", get(api_list_db).delete(api_clear_db))
        .route("/db/{id}", delete(api_delete_db_entry))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on `bind_address` until Ctrl-C.
///
/// # Errors
///
/// - `std::io::Error` - Address cannot be bound or the server fails
pub async fn run_server(
    service: Arc<RaceService>,
    bind_address: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(AppState {
        service: Arc::clone(&service),
    });

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    tracing::info!("Slipstream server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;
    tracing::info!("Slipstream server stopped");
    Ok(())
}

async fn shutdown_signal(service: Arc<RaceService>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    service.shutdown();
}
