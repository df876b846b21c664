use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{ReconError, Result},
    tasks::{AssetId, NewTask, TaskFilter, TaskId, TaskRecord, TaskRepository},
};

const TASK_COLUMNS: &str = "t.id, t.asset_id, t.config_name, t.step_name, t.stage, \
     t.status, t.log, t.artifact_path, t.created_at, t.started_at, t.completed_at";

#[derive(Clone, Debug)]
pub struct PostgresTaskRepository {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    asset_id: i64,
    config_name: String,
    step_name: String,
    stage: Option<String>,
    status: String,
    log: Option<String>,
    artifact_path: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = ReconError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(TaskRecord {
            id: TaskId(row.id),
            asset_id: AssetId(row.asset_id),
            config_name: row.config_name,
            step_name: row.step_name,
            stage: row.stage,
            status: row.status.parse().map_err(|_| {
                ReconError::Internal(format!(
                    "task {} has unknown status '{}'",
                    row.id, row.status
                ))
            })?,
            log: row.log,
            artifact_path: row.artifact_path,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn mark_terminal(
        &self,
        id: TaskId,
        status: &str,
        log: &str,
        artifact_path: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE scan_tasks
            SET status = $2,
                log = $3,
                artifact_path = COALESCE($4, artifact_path),
                completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id.0)
        .bind(status)
        .bind(log)
        .bind(artifact_path)
        .execute(self.pool())
        .await
        .map_err(|e| {
            ReconError::Internal(format!("Failed to mark task {id} {status}: {e}"))
        })?;
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn insert_pending(&self, task: NewTask) -> Result<TaskRecord> {
        let row: TaskRow = sqlx::query_as(
            r#"
            INSERT INTO scan_tasks (asset_id, config_name, step_name, stage, status, log)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING id, asset_id, config_name, step_name, stage, status, log,
                      artifact_path, created_at, started_at, completed_at
            "#,
        )
        .bind(task.asset_id.0)
        .bind(&task.config_name)
        .bind(&task.step_name)
        .bind(&task.stage)
        .bind(&task.log)
        .fetch_one(self.pool())
        .await
        .map_err(|e| ReconError::Internal(format!("Failed to create task: {e}")))?;
        row.try_into()
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM scan_tasks t WHERE t.id = $1"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| ReconError::Internal(format!("Database query failed: {e}")))?;
        row.map(TaskRecord::try_from).transpose()
    }

    async fn mark_running(&self, id: TaskId) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE scan_tasks
            SET status = 'running', started_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.0)
        .execute(self.pool())
        .await
        .map_err(|e| {
            ReconError::Internal(format!("Failed to mark task {id} running: {e}"))
        })?;
        Ok(res.rows_affected() > 0)
    }

    async fn mark_completed(
        &self,
        id: TaskId,
        log: &str,
        artifact_path: Option<&str>,
    ) -> Result<bool> {
        self.mark_terminal(id, "completed", log, artifact_path).await
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        log: &str,
        artifact_path: Option<&str>,
    ) -> Result<bool> {
        self.mark_terminal(id, "failed", log, artifact_path).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM scan_tasks t
            JOIN assets a ON a.id = t.asset_id
            WHERE ($1::text IS NULL OR t.status = $1)
              AND ($2::bigint IS NULL OR t.asset_id = $2)
              AND ($3::text IS NULL OR t.config_name = $3)
              AND ($4::bigint IS NULL OR a.project_id = $4)
              AND ($5::timestamptz IS NULL OR t.created_at >= $5)
              AND ($6::timestamptz IS NULL OR t.created_at < $6)
            ORDER BY t.created_at DESC, t.id DESC
            OFFSET $7
            LIMIT $8
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.asset_id.map(|a| a.0))
        .bind(filter.config_name.as_deref())
        .bind(filter.project_id)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(i64::from(filter.skip))
        .bind(i64::from(filter.effective_limit()))
        .fetch_all(self.pool())
        .await
        .map_err(|e| ReconError::Internal(format!("Failed to list tasks: {e}")))?;

        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn target_has_tasks(&self, normalized_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM scan_tasks t
                JOIN assets a ON a.id = t.asset_id
                WHERE RTRIM(LOWER(BTRIM(a.name)), '.') = $1
            )
            "#,
        )
        .bind(normalized_name)
        .fetch_one(self.pool())
        .await
        .map_err(|e| ReconError::Internal(format!("Database query failed: {e}")))?;
        Ok(exists)
    }
}
