use axum::{Json, extract::State, http::StatusCode};
use reconflow_core::tasks::AssetRecord;
use tracing::info;

use crate::{
    api::{ApiResponse, CreateAssetRequest},
    errors::{AppError, AppResult},
    infra::app_state::AppState,
};

/// Register a root target (domain or CIDR) that strategies can be run against.
pub async fn create_asset_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateAssetRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<AssetRecord>>)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("asset name must not be empty"));
    }

    let asset = state.assets.insert(name, request.project_id).await?;
    info!(asset_id = %asset.id, name = %asset.name, "asset created");
    Ok((StatusCode::CREATED, Json(ApiResponse::success(asset))))
}
