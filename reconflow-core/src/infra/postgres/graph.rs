use std::fmt;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction, types::Json};
use tracing::debug;

use crate::{
    error::{ReconError, Result},
    graph::{
        AsnInfo, DnsRecordRow, GraphSession, GraphStore, HostOwnership, HostRow,
        HttpServiceRow, IpAddressRow, NewHttpService, NewVulnerability, Owner,
        PortRow, UpsertOutcome, Upserted, VulnerabilityRow,
    },
    parser::Record,
    tasks::TaskId,
};

/// Asset graph in Postgres. Each session is one transaction.
#[derive(Clone)]
pub struct PostgresGraphStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresGraphStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresGraphStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn begin(&self) -> Result<Box<dyn GraphSession>> {
        let tx = self.pool.begin().await.map_err(|e| {
            ReconError::Internal(format!("Failed to begin graph transaction: {e}"))
        })?;
        Ok(Box::new(PostgresGraphSession { tx }))
    }

    async fn discovered_hostnames(&self, root_asset_id: i64) -> Result<Vec<String>> {
        let hostnames: Vec<String> = sqlx::query_scalar(
            "SELECT hostname FROM hosts WHERE root_asset_id = $1 ORDER BY hostname",
        )
        .bind(root_asset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::Internal(format!("Failed to load hostnames: {e}")))?;
        Ok(hostnames)
    }

    async fn raw_results(&self, task_id: TaskId) -> Result<Vec<Record>> {
        let rows: Vec<Json<Record>> = sqlx::query_scalar(
            "SELECT data FROM raw_scan_results WHERE task_id = $1 ORDER BY id",
        )
        .bind(task_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::Internal(format!("Failed to load raw results: {e}")))?;
        Ok(rows.into_iter().map(|Json(record)| record).collect())
    }
}

struct PostgresGraphSession {
    tx: Transaction<'static, Postgres>,
}

/// Keeps deadlocks and serialization failures retryable.
fn db_err(action: &str) -> impl FnOnce(sqlx::Error) -> ReconError + '_ {
    move |e| {
        let message = format!("Failed to {action}: {e}");
        if ReconError::from(e).is_transient() {
            ReconError::Conflict(message)
        } else {
            ReconError::Internal(message)
        }
    }
}

#[async_trait]
impl GraphSession for PostgresGraphSession {
    async fn archive_raw(&mut self, task_id: TaskId, record: &Record) -> Result<()> {
        sqlx::query("INSERT INTO raw_scan_results (task_id, data) VALUES ($1, $2)")
            .bind(task_id.0)
            .bind(Json(record))
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("archive raw result"))?;
        Ok(())
    }

    async fn upsert_host(
        &mut self,
        hostname: &str,
        owner: Owner,
        ownership: HostOwnership,
    ) -> Result<Upserted<HostRow>> {
        let inserted: Option<HostRow> = sqlx::query_as(
            r#"
            INSERT INTO hosts (hostname, project_id, root_asset_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (hostname) DO NOTHING
            RETURNING id, hostname, project_id, root_asset_id
            "#,
        )
        .bind(hostname)
        .bind(owner.project_id)
        .bind(owner.root_asset_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("insert host"))?;
        if let Some(row) = inserted {
            return Ok(Upserted::created(row));
        }

        let existing: HostRow = sqlx::query_as(
            r#"
            SELECT id, hostname, project_id, root_asset_id
            FROM hosts
            WHERE hostname = $1
            FOR UPDATE
            "#,
        )
        .bind(hostname)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("load host"))?;

        let same_owner = existing.root_asset_id == Some(owner.root_asset_id)
            && existing.project_id == owner.project_id;
        if same_owner || ownership == HostOwnership::KeepFirst {
            return Ok(Upserted::unchanged(existing));
        }

        let row: HostRow = sqlx::query_as(
            r#"
            UPDATE hosts
            SET project_id = $2, root_asset_id = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING id, hostname, project_id, root_asset_id
            "#,
        )
        .bind(existing.id)
        .bind(owner.project_id)
        .bind(owner.root_asset_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("reassign host"))?;
        debug!(
            hostname,
            from = ?existing.root_asset_id,
            to = owner.root_asset_id,
            "host reassigned to observing asset"
        );
        Ok(Upserted {
            row,
            outcome: UpsertOutcome::Updated,
        })
    }

    async fn upsert_ip(&mut self, ip: &str, owner: Owner) -> Result<Upserted<IpAddressRow>> {
        let inserted: Option<IpAddressRow> = sqlx::query_as(
            r#"
            INSERT INTO ip_addresses (ip_address, project_id, root_asset_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (ip_address) DO NOTHING
            RETURNING id, ip_address, project_id, root_asset_id,
                      asn_number, asn_name, asn_country
            "#,
        )
        .bind(ip)
        .bind(owner.project_id)
        .bind(owner.root_asset_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("insert ip address"))?;
        if let Some(row) = inserted {
            return Ok(Upserted::created(row));
        }

        let existing: IpAddressRow = sqlx::query_as(
            r#"
            SELECT id, ip_address, project_id, root_asset_id,
                   asn_number, asn_name, asn_country
            FROM ip_addresses
            WHERE ip_address = $1
            "#,
        )
        .bind(ip)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("load ip address"))?;
        Ok(Upserted::unchanged(existing))
    }

    async fn merge_ip_asn(&mut self, ip_id: i64, asn: &AsnInfo) -> Result<bool> {
        if asn.is_empty() {
            return Ok(false);
        }
        let res = sqlx::query(
            r#"
            UPDATE ip_addresses
            SET asn_number = COALESCE($2, asn_number),
                asn_name = COALESCE($3, asn_name),
                asn_country = COALESCE($4, asn_country),
                updated_at = NOW()
            WHERE id = $1
              AND (($2::bigint IS NOT NULL AND asn_number IS DISTINCT FROM $2)
                OR ($3::text IS NOT NULL AND asn_name IS DISTINCT FROM $3)
                OR ($4::text IS NOT NULL AND asn_country IS DISTINCT FROM $4))
            "#,
        )
        .bind(ip_id)
        .bind(asn.number)
        .bind(asn.name.as_deref())
        .bind(asn.country.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("merge asn attributes"))?;
        Ok(res.rows_affected() > 0)
    }

    async fn upsert_dns_record(
        &mut self,
        host_id: i64,
        ip_id: i64,
        record_type: &str,
    ) -> Result<Upserted<DnsRecordRow>> {
        let inserted: Option<DnsRecordRow> = sqlx::query_as(
            r#"
            INSERT INTO dns_records (host_id, ip_address_id, record_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (host_id, ip_address_id, record_type) DO NOTHING
            RETURNING id, host_id, ip_address_id, record_type
            "#,
        )
        .bind(host_id)
        .bind(ip_id)
        .bind(record_type)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("insert dns record"))?;
        if let Some(row) = inserted {
            return Ok(Upserted::created(row));
        }

        let existing: DnsRecordRow = sqlx::query_as(
            r#"
            SELECT id, host_id, ip_address_id, record_type
            FROM dns_records
            WHERE host_id = $1 AND ip_address_id = $2 AND record_type = $3
            "#,
        )
        .bind(host_id)
        .bind(ip_id)
        .bind(record_type)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("load dns record"))?;
        Ok(Upserted::unchanged(existing))
    }

    async fn upsert_port(
        &mut self,
        ip_id: i64,
        port: u16,
        service: Option<&str>,
    ) -> Result<Upserted<PortRow>> {
        let port_number = i32::from(port);
        let inserted: Option<PortRow> = sqlx::query_as(
            r#"
            INSERT INTO ports (ip_address_id, port_number, service_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (ip_address_id, port_number) DO NOTHING
            RETURNING id, ip_address_id, port_number, service_name
            "#,
        )
        .bind(ip_id)
        .bind(port_number)
        .bind(service)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("insert port"))?;
        if let Some(row) = inserted {
            return Ok(Upserted::created(row));
        }

        let filled: Option<PortRow> = match service {
            Some(service) => sqlx::query_as(
                r#"
                UPDATE ports
                SET service_name = $3
                WHERE ip_address_id = $1 AND port_number = $2
                  AND (service_name IS NULL OR service_name = '')
                RETURNING id, ip_address_id, port_number, service_name
                "#,
            )
            .bind(ip_id)
            .bind(port_number)
            .bind(service)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("fill port service"))?,
            None => None,
        };
        if let Some(row) = filled {
            return Ok(Upserted {
                row,
                outcome: UpsertOutcome::Updated,
            });
        }

        let existing: PortRow = sqlx::query_as(
            r#"
            SELECT id, ip_address_id, port_number, service_name
            FROM ports
            WHERE ip_address_id = $1 AND port_number = $2
            "#,
        )
        .bind(ip_id)
        .bind(port_number)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("load port"))?;
        Ok(Upserted::unchanged(existing))
    }

    async fn upsert_http_service(
        &mut self,
        service: &NewHttpService,
    ) -> Result<Upserted<HttpServiceRow>> {
        let inserted: Option<HttpServiceRow> = sqlx::query_as(
            r#"
            INSERT INTO http_services (
                port_id, url, title, status_code, tech, web_server,
                favicon_hash, ssl_info
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (url) DO NOTHING
            RETURNING id, port_id, url, title, status_code, tech, web_server,
                      favicon_hash, ssl_info
            "#,
        )
        .bind(service.port_id)
        .bind(&service.url)
        .bind(service.title.as_deref())
        .bind(service.status_code)
        .bind(service.tech.as_ref())
        .bind(service.web_server.as_deref())
        .bind(service.favicon_hash.as_deref())
        .bind(service.ssl_info.as_ref())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("insert http service"))?;
        if let Some(row) = inserted {
            return Ok(Upserted::created(row));
        }

        let existing: HttpServiceRow = sqlx::query_as(
            r#"
            SELECT id, port_id, url, title, status_code, tech, web_server,
                   favicon_hash, ssl_info
            FROM http_services
            WHERE url = $1
            "#,
        )
        .bind(&service.url)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("load http service"))?;
        Ok(Upserted::unchanged(existing))
    }

    async fn insert_vulnerability(
        &mut self,
        vulnerability: &NewVulnerability,
    ) -> Result<VulnerabilityRow> {
        let row: VulnerabilityRow = sqlx::query_as(
            r#"
            INSERT INTO vulnerabilities (
                project_id, root_asset_id, vulnerability_name, severity,
                template_id, matched_at, details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, project_id, root_asset_id, vulnerability_name,
                      severity, template_id, matched_at, details
            "#,
        )
        .bind(vulnerability.owner.project_id)
        .bind(vulnerability.owner.root_asset_id)
        .bind(&vulnerability.name)
        .bind(&vulnerability.severity)
        .bind(vulnerability.template_id.as_deref())
        .bind(vulnerability.matched_at.as_deref())
        .bind(&vulnerability.details)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("insert vulnerability"))?;
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err("commit graph transaction"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(db_err("roll back graph transaction"))
    }
}
