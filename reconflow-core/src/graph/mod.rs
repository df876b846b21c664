//! Asset graph: hosts, IP addresses, ports, web services, vulnerabilities and
//! the DNS associations between hosts and IPs.
//!
//! Writers go through a [`GraphSession`], a unit of work that either commits
//! or rolls back as a whole. Every natural key (hostname, IP string,
//! `(ip, port)`, URL, `(host, ip, record type)`) is written with an atomic
//! look-up-or-create, so concurrent chains never duplicate an entity.

pub mod processor;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::Result, parser::Record, tasks::TaskId};

/// What happened to an entity during a look-up-or-create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

#[derive(Clone, Debug)]
pub struct Upserted<T> {
    pub row: T,
    pub outcome: UpsertOutcome,
}

impl<T> Upserted<T> {
    pub fn created(row: T) -> Self {
        Self {
            row,
            outcome: UpsertOutcome::Created,
        }
    }

    pub fn unchanged(row: T) -> Self {
        Self {
            row,
            outcome: UpsertOutcome::Unchanged,
        }
    }

    pub fn changed(&self) -> bool {
        self.outcome.changed()
    }
}

/// Who a newly discovered entity is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    pub project_id: Option<i64>,
    pub root_asset_id: i64,
}

/// What to do when a hostname already belongs to a different root asset.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HostOwnership {
    /// Last writer wins: the host moves to the asset that just observed it.
    #[default]
    Reassign,
    /// The asset that first discovered the host keeps it.
    KeepFirst,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct HostRow {
    pub id: i64,
    pub hostname: String,
    pub project_id: Option<i64>,
    pub root_asset_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct IpAddressRow {
    pub id: i64,
    pub ip_address: String,
    pub project_id: Option<i64>,
    pub root_asset_id: Option<i64>,
    pub asn_number: Option<i64>,
    pub asn_name: Option<String>,
    pub asn_country: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DnsRecordRow {
    pub id: i64,
    pub host_id: i64,
    pub ip_address_id: i64,
    pub record_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PortRow {
    pub id: i64,
    pub ip_address_id: i64,
    pub port_number: i32,
    pub service_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct HttpServiceRow {
    pub id: i64,
    pub port_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub status_code: Option<i32>,
    pub tech: Option<serde_json::Value>,
    pub web_server: Option<String>,
    pub favicon_hash: Option<String>,
    pub ssl_info: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct VulnerabilityRow {
    pub id: i64,
    pub project_id: Option<i64>,
    pub root_asset_id: Option<i64>,
    pub vulnerability_name: String,
    pub severity: String,
    pub template_id: Option<String>,
    pub matched_at: Option<String>,
    pub details: serde_json::Value,
}

/// ASN attributes observed for an IP. Blank values are already dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AsnInfo {
    pub number: Option<i64>,
    pub name: Option<String>,
    pub country: Option<String>,
}

impl AsnInfo {
    pub fn is_empty(&self) -> bool {
        self.number.is_none() && self.name.is_none() && self.country.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewHttpService {
    pub port_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub status_code: Option<i32>,
    pub tech: Option<serde_json::Value>,
    pub web_server: Option<String>,
    pub favicon_hash: Option<String>,
    pub ssl_info: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewVulnerability {
    pub owner: Owner,
    pub name: String,
    pub severity: String,
    pub template_id: Option<String>,
    pub matched_at: Option<String>,
    pub details: serde_json::Value,
}

/// Unit of work against the asset graph for one task attempt.
#[async_trait]
pub trait GraphSession: Send {
    /// Archive a parsed record verbatim against its task.
    async fn archive_raw(&mut self, task_id: TaskId, record: &Record) -> Result<()>;

    async fn upsert_host(
        &mut self,
        hostname: &str,
        owner: Owner,
        ownership: HostOwnership,
    ) -> Result<Upserted<HostRow>>;

    async fn upsert_ip(
        &mut self,
        ip: &str,
        owner: Owner,
    ) -> Result<Upserted<IpAddressRow>>;

    /// Fill in or refresh ASN attributes; never overwrites with absent values.
    /// Returns whether anything changed.
    async fn merge_ip_asn(&mut self, ip_id: i64, asn: &AsnInfo) -> Result<bool>;

    async fn upsert_dns_record(
        &mut self,
        host_id: i64,
        ip_id: i64,
        record_type: &str,
    ) -> Result<Upserted<DnsRecordRow>>;

    /// Keyed by `(ip_id, port)`. A service name fills in a missing one.
    async fn upsert_port(
        &mut self,
        ip_id: i64,
        port: u16,
        service: Option<&str>,
    ) -> Result<Upserted<PortRow>>;

    /// Keyed by URL; an existing service is left as is.
    async fn upsert_http_service(
        &mut self,
        service: &NewHttpService,
    ) -> Result<Upserted<HttpServiceRow>>;

    async fn insert_vulnerability(
        &mut self,
        vulnerability: &NewVulnerability,
    ) -> Result<VulnerabilityRow>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait GraphStore: Send + Sync + fmt::Debug {
    async fn begin(&self) -> Result<Box<dyn GraphSession>>;

    /// Hostnames currently attributed to a root asset, sorted.
    async fn discovered_hostnames(&self, root_asset_id: i64) -> Result<Vec<String>>;

    /// Raw records archived for a task, in archive order.
    async fn raw_results(&self, task_id: TaskId) -> Result<Vec<Record>>;
}

/// Canonical form of a hostname or asset name: trimmed, lowercase, no
/// trailing dot.
pub fn normalize_hostname(name: &str) -> String {
    name.trim().to_lowercase().trim_end_matches('.').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostnames_are_case_folded_without_trailing_dot() {
        assert_eq!(normalize_hostname(" Sub.Example.COM. "), "sub.example.com");
        assert_eq!(normalize_hostname("example.com"), "example.com");
        assert_eq!(normalize_hostname("."), "");
    }
}
