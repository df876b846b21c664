use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    error::{ReconError, Result},
    tasks::{AssetId, AssetRecord, AssetRepository},
};

#[derive(Clone, Debug)]
pub struct PostgresAssetRepository {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct AssetRow {
    id: i64,
    name: String,
    project_id: Option<i64>,
    organization_id: Option<i64>,
}

impl From<AssetRow> for AssetRecord {
    fn from(row: AssetRow) -> Self {
        AssetRecord {
            id: AssetId(row.id),
            name: row.name,
            project_id: row.project_id,
            organization_id: row.organization_id,
        }
    }
}

impl PostgresAssetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetRepository for PostgresAssetRepository {
    async fn get(&self, id: AssetId) -> Result<Option<AssetRecord>> {
        let row: Option<AssetRow> = sqlx::query_as(
            r#"
            SELECT a.id, a.name, a.project_id, p.organization_id
            FROM assets a
            LEFT JOIN projects p ON p.id = a.project_id
            WHERE a.id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconError::Internal(format!("Database query failed: {e}")))?;
        Ok(row.map(AssetRecord::from))
    }

    async fn insert(&self, name: &str, project_id: Option<i64>) -> Result<AssetRecord> {
        let row: AssetRow = sqlx::query_as(
            r#"
            WITH inserted AS (
                INSERT INTO assets (name, project_id)
                VALUES ($1, $2)
                RETURNING id, name, project_id
            )
            SELECT i.id, i.name, i.project_id, p.organization_id
            FROM inserted i
            LEFT JOIN projects p ON p.id = i.project_id
            "#,
        )
        .bind(name)
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ReconError::Internal(format!("Failed to create asset: {e}")))?;
        Ok(row.into())
    }
}
