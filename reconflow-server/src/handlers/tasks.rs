use std::{io::ErrorKind, path::Path as FsPath};

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use reconflow_core::{
    submission::SubmissionResult,
    tasks::{AssetId, DEFAULT_LIST_LIMIT, TaskFilter, TaskId, TaskRecord, TaskStatus},
};
use tracing::{info, warn};

use crate::{
    api::{ApiResponse, RetryRequest, TaskListQuery, TaskView},
    errors::{AppError, AppResult},
    infra::app_state::AppState,
};

impl TryFrom<TaskListQuery> for TaskFilter {
    type Error = AppError;

    fn try_from(query: TaskListQuery) -> Result<Self, Self::Error> {
        let status = query
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()?;
        if let (Some(after), Some(before)) = (query.created_after, query.created_before)
            && after >= before
        {
            return Err(AppError::bad_request(
                "created_after must be earlier than created_before",
            ));
        }

        Ok(TaskFilter {
            status,
            asset_id: query.asset_id.map(AssetId),
            config_name: query.config_name,
            project_id: query.project_id,
            created_after: query.created_after,
            created_before: query.created_before,
            skip: query.skip.unwrap_or(0),
            limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        })
    }
}

async fn load_task(state: &AppState, id: i64) -> AppResult<TaskRecord> {
    state
        .tasks
        .get(TaskId(id))
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))
}

/// Tasks matching the filters, newest first.
pub async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> AppResult<Json<ApiResponse<Vec<TaskView>>>> {
    let filter = TaskFilter::try_from(query)?;
    let tasks = state.tasks.list(&filter).await?;
    Ok(Json(ApiResponse::success(
        tasks.into_iter().map(TaskView::from).collect(),
    )))
}

pub async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ApiResponse<TaskView>>> {
    let task = load_task(&state, id).await?;
    Ok(Json(ApiResponse::success(TaskView::from(task))))
}

/// Raw tool output of a task: the command line, then stdout and stderr.
pub async fn download_artifact_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let task = load_task(&state, id).await?;
    let Some(artifact_path) = task.artifact_path else {
        return Err(AppError::not_found(format!("task {id} has no artifact")));
    };

    let bytes = match tokio::fs::read(&artifact_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(task_id = id, path = %artifact_path, "artifact file is missing");
            return Err(AppError::not_found(format!(
                "artifact for task {id} is no longer available"
            )));
        }
        Err(err) => {
            return Err(AppError::internal(format!(
                "failed to read artifact for task {id}: {err}"
            )));
        }
    };

    let file_name = FsPath::new(&artifact_path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact.txt")
        .to_string();
    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ),
    ];
    Ok((headers, bytes))
}

/// Re-run a task's step, or its whole strategy. Dedup is bypassed.
pub async fn retry_task_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<RetryRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<SubmissionResult>>)> {
    let result = state
        .submissions
        .retry(TaskId(id), request.mode, request.strategy_name.as_deref())
        .await?;
    info!(
        task_id = id,
        mode = ?request.mode,
        new_tasks = ?result.task_ids,
        "task retry scheduled"
    );
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(result))))
}
