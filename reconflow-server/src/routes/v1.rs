use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    AppState,
    handlers::{assets, scans, strategies, tasks},
};

/// Create all v1 API routes
pub fn create_v1_router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/assets", post(assets::create_asset_handler))
        .route("/scans", post(scans::submit_scan_handler))
        .route("/scan-strategies", get(strategies::list_strategies_handler))
        .route("/tasks", get(tasks::list_tasks_handler))
        .route("/tasks/{id}", get(tasks::get_task_handler))
        .route("/tasks/{id}/artifact", get(tasks::download_artifact_handler))
        .route("/tasks/{id}/retry", post(tasks::retry_task_handler))
}
