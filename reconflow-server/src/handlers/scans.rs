use axum::{Json, extract::State, http::StatusCode};
use reconflow_core::submission::SubmissionResult;
use tracing::info;

use crate::{
    api::{ApiResponse, ScanRequest},
    errors::AppResult,
    infra::app_state::AppState,
};

/// Submit a strategy against an asset. A target that was already scanned is
/// accepted with an empty id list.
pub async fn submit_scan_handler(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<SubmissionResult>>)> {
    let result = state
        .submissions
        .submit(request.asset_id, request.strategy_name.trim(), false)
        .await?;

    let mut response = ApiResponse::success(result);
    if response.data.as_ref().is_some_and(|r| r.task_ids.is_empty()) {
        response = response.with_message(
            "target already has scan tasks; nothing was scheduled".to_string(),
        );
    } else {
        info!(
            asset_id = %request.asset_id,
            strategy = %request.strategy_name,
            "scan submitted"
        );
    }
    Ok((StatusCode::ACCEPTED, Json(response)))
}
