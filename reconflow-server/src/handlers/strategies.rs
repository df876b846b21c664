use axum::{Json, extract::State};
use reconflow_core::catalog::ScanStrategy;

use crate::{api::ApiResponse, infra::app_state::AppState};

pub async fn list_strategies_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ScanStrategy>>> {
    Json(ApiResponse::success(state.catalog.strategies().to_vec()))
}
