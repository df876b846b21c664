//! Durable scan tasks and the assets they target.
//!
//! A task is created `pending`, moves to `running` when a worker picks it up
//! and ends `completed` or `failed` exactly once. Tasks are never deleted.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AssetId(pub i64);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ReconError::InvalidRequest(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub asset_id: AssetId,
    pub config_name: String,
    pub step_name: String,
    /// Agent kind of the step, e.g. `subdomain`.
    pub stage: Option<String>,
    pub status: TaskStatus,
    pub log: Option<String>,
    pub artifact_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTask {
    pub asset_id: AssetId,
    pub config_name: String,
    pub step_name: String,
    pub stage: Option<String>,
    /// Initial log, used to annotate retries.
    pub log: Option<String>,
}

pub const DEFAULT_LIST_LIMIT: u32 = 10;
pub const MAX_LIST_LIMIT: u32 = 500;

/// Task listing filters; results are newest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub asset_id: Option<AssetId>,
    pub config_name: Option<String>,
    pub project_id: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub skip: u32,
    pub limit: u32,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            asset_id: None,
            config_name: None,
            project_id: None,
            created_after: None,
            created_before: None,
            skip: 0,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl TaskFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit.min(MAX_LIST_LIMIT)
    }

    /// Whether a task (owned by an asset in `project_id`) passes the filters,
    /// pagination aside.
    pub fn matches(&self, task: &TaskRecord, project_id: Option<i64>) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.asset_id.is_none_or(|a| a == task.asset_id)
            && self
                .config_name
                .as_deref()
                .is_none_or(|c| c == task.config_name)
            && self.project_id.is_none_or(|p| Some(p) == project_id)
            && self.created_after.is_none_or(|t| task.created_at >= t)
            && self.created_before.is_none_or(|t| task.created_at < t)
    }
}

#[async_trait]
pub trait TaskRepository: Send + Sync + fmt::Debug {
    async fn insert_pending(&self, task: NewTask) -> Result<TaskRecord>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// `pending -> running`. Returns `false` when the task was not pending.
    async fn mark_running(&self, id: TaskId) -> Result<bool>;

    /// Terminal transition from `pending` or `running`. Returns `false` when
    /// the task was already terminal. A `None` artifact keeps the stored one.
    async fn mark_completed(
        &self,
        id: TaskId,
        log: &str,
        artifact_path: Option<&str>,
    ) -> Result<bool>;

    async fn mark_failed(
        &self,
        id: TaskId,
        log: &str,
        artifact_path: Option<&str>,
    ) -> Result<bool>;

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>>;

    /// Whether any asset whose normalized name equals `normalized_name` has a
    /// task.
    async fn target_has_tasks(&self, normalized_name: &str) -> Result<bool>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub id: AssetId,
    /// Root target: a domain or a CIDR.
    pub name: String,
    pub project_id: Option<i64>,
    pub organization_id: Option<i64>,
}

#[async_trait]
pub trait AssetRepository: Send + Sync + fmt::Debug {
    async fn get(&self, id: AssetId) -> Result<Option<AssetRecord>>;

    async fn insert(&self, name: &str, project_id: Option<i64>) -> Result<AssetRecord>;
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// First `max_chars` characters of `text`.
pub fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("日本語テキスト", 2), "スト");
        assert_eq!(tail_chars("abc", 0), "");
        assert_eq!(head_chars("abcdef", 3), "abc");
        assert_eq!(head_chars("日本語", 2), "日本");
        assert_eq!(head_chars("ab", 5), "ab");
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn filter_limit_is_capped() {
        let filter = TaskFilter {
            limit: 10_000,
            ..TaskFilter::default()
        };
        assert_eq!(filter.effective_limit(), MAX_LIST_LIMIT);
    }
}
