//! Response envelope and request/response bodies of the HTTP API.

use chrono::{DateTime, Utc};
use reconflow_core::{
    submission::RetryMode,
    tasks::{AssetId, TaskId, TaskRecord, TaskStatus, tail_chars},
};
use serde::{Deserialize, Serialize};

/// Characters of a task log returned by the task endpoints.
pub const TASK_LOG_TAIL: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(error),
            message: None,
        }
    }

    pub fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAssetRequest {
    pub name: String,
    pub project_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub asset_id: AssetId,
    pub strategy_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryRequest {
    pub mode: RetryMode,
    /// Strategy to re-run in `strategy` mode; defaults to the first one
    /// containing the task's step.
    pub strategy_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub asset_id: Option<i64>,
    pub config_name: Option<String>,
    pub project_id: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub asset_id: AssetId,
    pub status: TaskStatus,
    pub stage: Option<String>,
    pub config_name: String,
    pub step_name: String,
    pub log: Option<String>,
    pub artifact_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRecord> for TaskView {
    fn from(task: TaskRecord) -> Self {
        Self {
            id: task.id,
            asset_id: task.asset_id,
            status: task.status,
            stage: task.stage,
            config_name: task.config_name,
            step_name: task.step_name,
            log: task
                .log
                .as_deref()
                .map(|log| tail_chars(log, TASK_LOG_TAIL).to_owned()),
            artifact_path: task.artifact_path,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}
