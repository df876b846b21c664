//! Process-local storage for tests and `--in-memory` development runs.
//!
//! A graph session holds the graph lock for its whole lifetime and restores
//! the snapshot taken at `begin` unless it commits, so sessions behave like
//! serialized transactions.

use std::{collections::HashSet, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::Result,
    graph::{
        AsnInfo, DnsRecordRow, GraphSession, GraphStore, HostOwnership, HostRow,
        HttpServiceRow, IpAddressRow, NewHttpService, NewVulnerability, Owner,
        PortRow, UpsertOutcome, Upserted, VulnerabilityRow, normalize_hostname,
    },
    parser::Record,
    tasks::{
        AssetId, AssetRecord, AssetRepository, NewTask, TaskFilter, TaskId,
        TaskRecord, TaskRepository, TaskStatus,
    },
};

/// Copy of the whole asset graph.
#[derive(Clone, Debug, Default)]
pub struct GraphSnapshot {
    pub hosts: Vec<HostRow>,
    pub ip_addresses: Vec<IpAddressRow>,
    pub dns_records: Vec<DnsRecordRow>,
    pub ports: Vec<PortRow>,
    pub http_services: Vec<HttpServiceRow>,
    pub vulnerabilities: Vec<VulnerabilityRow>,
    pub raw_results: Vec<(TaskId, Record)>,
    next_id: i64,
}

impl GraphSnapshot {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn host(&self, hostname: &str) -> Option<&HostRow> {
        self.hosts.iter().find(|h| h.hostname == hostname)
    }

    pub fn ip(&self, ip: &str) -> Option<&IpAddressRow> {
        self.ip_addresses.iter().find(|i| i.ip_address == ip)
    }
}

#[derive(Debug, Default)]
struct TaskTable {
    rows: Vec<TaskRecord>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct AssetTable {
    rows: Vec<AssetRecord>,
    next_id: i64,
}

/// Tasks, assets and the asset graph behind async mutexes.
///
/// Lock order is assets, then tasks; the graph lock is never held together
/// with either.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    assets: Arc<Mutex<AssetTable>>,
    tasks: Arc<Mutex<TaskTable>>,
    graph: Arc<Mutex<GraphSnapshot>>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset directly, with an optional organization link.
    pub async fn add_asset(
        &self,
        name: &str,
        project_id: Option<i64>,
        organization_id: Option<i64>,
    ) -> AssetRecord {
        let mut assets = self.assets.lock().await;
        assets.next_id += 1;
        let record = AssetRecord {
            id: AssetId(assets.next_id),
            name: name.to_owned(),
            project_id,
            organization_id,
        };
        assets.rows.push(record.clone());
        record
    }

    pub async fn graph(&self) -> GraphSnapshot {
        self.graph.lock().await.clone()
    }

    pub async fn all_tasks(&self) -> Vec<TaskRecord> {
        self.tasks.lock().await.rows.clone()
    }
}

#[async_trait]
impl AssetRepository for InMemoryStore {
    async fn get(&self, id: AssetId) -> Result<Option<AssetRecord>> {
        let assets = self.assets.lock().await;
        Ok(assets.rows.iter().find(|a| a.id == id).cloned())
    }

    async fn insert(&self, name: &str, project_id: Option<i64>) -> Result<AssetRecord> {
        Ok(self.add_asset(name, project_id, None).await)
    }
}

impl TaskTable {
    fn find_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.rows.iter_mut().find(|t| t.id == id)
    }

    fn mark_terminal(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        log: &str,
        artifact_path: Option<&str>,
    ) -> bool {
        let Some(task) = self.find_mut(id).filter(|t| !t.status.is_terminal()) else {
            return false;
        };
        task.status = status;
        task.log = Some(log.to_owned());
        if let Some(path) = artifact_path {
            task.artifact_path = Some(path.to_owned());
        }
        task.completed_at = Some(Utc::now());
        true
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn insert_pending(&self, task: NewTask) -> Result<TaskRecord> {
        let mut tasks = self.tasks.lock().await;
        tasks.next_id += 1;
        let record = TaskRecord {
            id: TaskId(tasks.next_id),
            asset_id: task.asset_id,
            config_name: task.config_name,
            step_name: task.step_name,
            stage: task.stage,
            status: TaskStatus::Pending,
            log: task.log,
            artifact_path: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        tasks.rows.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.rows.iter().find(|t| t.id == id).cloned())
    }

    async fn mark_running(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        match tasks.find_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(
        &self,
        id: TaskId,
        log: &str,
        artifact_path: Option<&str>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        Ok(tasks.mark_terminal(id, TaskStatus::Completed, log, artifact_path))
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        log: &str,
        artifact_path: Option<&str>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        Ok(tasks.mark_terminal(id, TaskStatus::Failed, log, artifact_path))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        let assets = self.assets.lock().await;
        let tasks = self.tasks.lock().await;
        let project_of = |asset_id: AssetId| {
            assets
                .rows
                .iter()
                .find(|a| a.id == asset_id)
                .and_then(|a| a.project_id)
        };

        let mut matched: Vec<TaskRecord> = tasks
            .rows
            .iter()
            .filter(|t| filter.matches(t, project_of(t.asset_id)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matched
            .into_iter()
            .skip(filter.skip as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn target_has_tasks(&self, normalized_name: &str) -> Result<bool> {
        let assets = self.assets.lock().await;
        let tasks = self.tasks.lock().await;
        let sharing: HashSet<AssetId> = assets
            .rows
            .iter()
            .filter(|a| normalize_hostname(&a.name) == normalized_name)
            .map(|a| a.id)
            .collect();
        Ok(tasks.rows.iter().any(|t| sharing.contains(&t.asset_id)))
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn GraphSession>> {
        let guard = Arc::clone(&self.graph).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(InMemoryGraphSession {
            graph: guard,
            snapshot: Some(snapshot),
        }))
    }

    async fn discovered_hostnames(&self, root_asset_id: i64) -> Result<Vec<String>> {
        let graph = self.graph.lock().await;
        let mut hostnames: Vec<String> = graph
            .hosts
            .iter()
            .filter(|h| h.root_asset_id == Some(root_asset_id))
            .map(|h| h.hostname.clone())
            .collect();
        hostnames.sort();
        Ok(hostnames)
    }

    async fn raw_results(&self, task_id: TaskId) -> Result<Vec<Record>> {
        let graph = self.graph.lock().await;
        Ok(graph
            .raw_results
            .iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

struct InMemoryGraphSession {
    graph: OwnedMutexGuard<GraphSnapshot>,
    /// State at `begin`; restored on drop unless the session committed.
    snapshot: Option<GraphSnapshot>,
}

impl Drop for InMemoryGraphSession {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.graph = snapshot;
        }
    }
}

#[async_trait]
impl GraphSession for InMemoryGraphSession {
    async fn archive_raw(&mut self, task_id: TaskId, record: &Record) -> Result<()> {
        self.graph.raw_results.push((task_id, record.clone()));
        Ok(())
    }

    async fn upsert_host(
        &mut self,
        hostname: &str,
        owner: Owner,
        ownership: HostOwnership,
    ) -> Result<Upserted<HostRow>> {
        let graph = &mut *self.graph;
        if let Some(host) = graph.hosts.iter_mut().find(|h| h.hostname == hostname) {
            let same_owner = host.root_asset_id == Some(owner.root_asset_id)
                && host.project_id == owner.project_id;
            if same_owner || ownership == HostOwnership::KeepFirst {
                return Ok(Upserted::unchanged(host.clone()));
            }
            host.root_asset_id = Some(owner.root_asset_id);
            host.project_id = owner.project_id;
            return Ok(Upserted {
                row: host.clone(),
                outcome: UpsertOutcome::Updated,
            });
        }
        let row = HostRow {
            id: graph.next_id(),
            hostname: hostname.to_owned(),
            project_id: owner.project_id,
            root_asset_id: Some(owner.root_asset_id),
        };
        graph.hosts.push(row.clone());
        Ok(Upserted::created(row))
    }

    async fn upsert_ip(&mut self, ip: &str, owner: Owner) -> Result<Upserted<IpAddressRow>> {
        let graph = &mut *self.graph;
        if let Some(existing) = graph.ip(ip) {
            return Ok(Upserted::unchanged(existing.clone()));
        }
        let row = IpAddressRow {
            id: graph.next_id(),
            ip_address: ip.to_owned(),
            project_id: owner.project_id,
            root_asset_id: Some(owner.root_asset_id),
            asn_number: None,
            asn_name: None,
            asn_country: None,
        };
        graph.ip_addresses.push(row.clone());
        Ok(Upserted::created(row))
    }

    async fn merge_ip_asn(&mut self, ip_id: i64, asn: &AsnInfo) -> Result<bool> {
        let Some(row) = self.graph.ip_addresses.iter_mut().find(|i| i.id == ip_id) else {
            return Ok(false);
        };
        let mut changed = false;
        if let Some(number) = asn.number.filter(|n| row.asn_number != Some(*n)) {
            row.asn_number = Some(number);
            changed = true;
        }
        if let Some(name) = asn.name.as_ref().filter(|n| row.asn_name.as_ref() != Some(*n)) {
            row.asn_name = Some(name.clone());
            changed = true;
        }
        if let Some(country) = asn
            .country
            .as_ref()
            .filter(|c| row.asn_country.as_ref() != Some(*c))
        {
            row.asn_country = Some(country.clone());
            changed = true;
        }
        Ok(changed)
    }

    async fn upsert_dns_record(
        &mut self,
        host_id: i64,
        ip_id: i64,
        record_type: &str,
    ) -> Result<Upserted<DnsRecordRow>> {
        let graph = &mut *self.graph;
        if let Some(existing) = graph.dns_records.iter().find(|d| {
            d.host_id == host_id && d.ip_address_id == ip_id && d.record_type == record_type
        }) {
            return Ok(Upserted::unchanged(existing.clone()));
        }
        let row = DnsRecordRow {
            id: graph.next_id(),
            host_id,
            ip_address_id: ip_id,
            record_type: record_type.to_owned(),
        };
        graph.dns_records.push(row.clone());
        Ok(Upserted::created(row))
    }

    async fn upsert_port(
        &mut self,
        ip_id: i64,
        port: u16,
        service: Option<&str>,
    ) -> Result<Upserted<PortRow>> {
        let graph = &mut *self.graph;
        let port_number = i32::from(port);
        if let Some(existing) = graph
            .ports
            .iter_mut()
            .find(|p| p.ip_address_id == ip_id && p.port_number == port_number)
        {
            let missing = existing.service_name.as_deref().is_none_or(str::is_empty);
            return Ok(match service {
                Some(service) if missing => {
                    existing.service_name = Some(service.to_owned());
                    Upserted {
                        row: existing.clone(),
                        outcome: UpsertOutcome::Updated,
                    }
                }
                _ => Upserted::unchanged(existing.clone()),
            });
        }
        let row = PortRow {
            id: graph.next_id(),
            ip_address_id: ip_id,
            port_number,
            service_name: service.map(str::to_owned),
        };
        graph.ports.push(row.clone());
        Ok(Upserted::created(row))
    }

    async fn upsert_http_service(
        &mut self,
        service: &NewHttpService,
    ) -> Result<Upserted<HttpServiceRow>> {
        let graph = &mut *self.graph;
        if let Some(existing) = graph.http_services.iter().find(|s| s.url == service.url) {
            return Ok(Upserted::unchanged(existing.clone()));
        }
        let row = HttpServiceRow {
            id: graph.next_id(),
            port_id: service.port_id,
            url: service.url.clone(),
            title: service.title.clone(),
            status_code: service.status_code,
            tech: service.tech.clone(),
            web_server: service.web_server.clone(),
            favicon_hash: service.favicon_hash.clone(),
            ssl_info: service.ssl_info.clone(),
        };
        graph.http_services.push(row.clone());
        Ok(Upserted::created(row))
    }

    async fn insert_vulnerability(
        &mut self,
        vulnerability: &NewVulnerability,
    ) -> Result<VulnerabilityRow> {
        let graph = &mut *self.graph;
        let row = VulnerabilityRow {
            id: graph.next_id(),
            project_id: vulnerability.owner.project_id,
            root_asset_id: Some(vulnerability.owner.root_asset_id),
            vulnerability_name: vulnerability.name.clone(),
            severity: vulnerability.severity.clone(),
            template_id: vulnerability.template_id.clone(),
            matched_at: vulnerability.matched_at.clone(),
            details: vulnerability.details.clone(),
        };
        graph.vulnerabilities.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut session = self;
        session.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(root: i64) -> Owner {
        Owner {
            project_id: Some(7),
            root_asset_id: root,
        }
    }

    #[tokio::test]
    async fn rollback_restores_the_graph() {
        let store = InMemoryStore::new();
        let mut session = store.begin().await.unwrap();
        session
            .upsert_host("a.example.com", owner(1), HostOwnership::Reassign)
            .await
            .unwrap();
        session.rollback().await.unwrap();
        assert!(store.graph().await.hosts.is_empty());

        let mut session = store.begin().await.unwrap();
        session
            .upsert_host("a.example.com", owner(1), HostOwnership::Reassign)
            .await
            .unwrap();
        session.commit().await.unwrap();
        assert_eq!(store.graph().await.hosts.len(), 1);
    }

    #[tokio::test]
    async fn host_ownership_policy_decides_reassignment() {
        let store = InMemoryStore::new();
        let mut session = store.begin().await.unwrap();
        let first = session
            .upsert_host("a.example.com", owner(1), HostOwnership::Reassign)
            .await
            .unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Created);

        let kept = session
            .upsert_host("a.example.com", owner(2), HostOwnership::KeepFirst)
            .await
            .unwrap();
        assert_eq!(kept.outcome, UpsertOutcome::Unchanged);
        assert_eq!(kept.row.root_asset_id, Some(1));

        let moved = session
            .upsert_host("a.example.com", owner(2), HostOwnership::Reassign)
            .await
            .unwrap();
        assert_eq!(moved.outcome, UpsertOutcome::Updated);
        assert_eq!(moved.row.id, first.row.id);
        assert_eq!(moved.row.root_asset_id, Some(2));
        session.commit().await.unwrap();

        assert!(store.discovered_hostnames(1).await.unwrap().is_empty());
        assert_eq!(
            store.discovered_hostnames(2).await.unwrap(),
            vec!["a.example.com".to_owned()]
        );
    }

    #[tokio::test]
    async fn asn_merge_never_clears_known_values() {
        let store = InMemoryStore::new();
        let mut session = store.begin().await.unwrap();
        let ip = session.upsert_ip("8.8.8.8", owner(1)).await.unwrap().row;
        let full = AsnInfo {
            number: Some(15169),
            name: Some("GOOGLE".into()),
            country: Some("US".into()),
        };
        assert!(session.merge_ip_asn(ip.id, &full).await.unwrap());
        assert!(!session.merge_ip_asn(ip.id, &full).await.unwrap());
        assert!(!session.merge_ip_asn(ip.id, &AsnInfo::default()).await.unwrap());
        session.commit().await.unwrap();

        let graph = store.graph().await;
        let stored = graph.ip("8.8.8.8").unwrap();
        assert_eq!(stored.asn_number, Some(15169));
        assert_eq!(stored.asn_country.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn port_service_is_filled_once() {
        let store = InMemoryStore::new();
        let mut session = store.begin().await.unwrap();
        let ip = session.upsert_ip("10.0.0.1", owner(1)).await.unwrap().row;
        let bare = session.upsert_port(ip.id, 22, None).await.unwrap();
        assert_eq!(bare.outcome, UpsertOutcome::Created);
        let filled = session.upsert_port(ip.id, 22, Some("ssh")).await.unwrap();
        assert_eq!(filled.outcome, UpsertOutcome::Updated);
        let again = session.upsert_port(ip.id, 22, Some("other")).await.unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Unchanged);
        assert_eq!(again.row.service_name.as_deref(), Some("ssh"));
    }

    #[tokio::test]
    async fn task_listing_is_newest_first_and_filtered() {
        let store = InMemoryStore::new();
        let a = store.add_asset("example.com", Some(1), None).await;
        let b = store.add_asset("other.org", Some(2), None).await;
        for (asset, config) in [(a.id, "s1"), (a.id, "s2"), (b.id, "s1")] {
            store
                .insert_pending(NewTask {
                    asset_id: asset,
                    config_name: config.into(),
                    step_name: config.into(),
                    stage: None,
                    log: None,
                })
                .await
                .unwrap();
        }

        let all = store.list(&TaskFilter::default()).await.unwrap();
        let ids: Vec<i64> = all.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let project = store
            .list(&TaskFilter {
                project_id: Some(1),
                config_name: Some("s1".into()),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(project.len(), 1);
        assert_eq!(project[0].asset_id, a.id);

        let page = store
            .list(&TaskFilter {
                skip: 1,
                limit: 1,
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page[0].id, TaskId(2));

        assert!(store.target_has_tasks("example.com").await.unwrap());
        assert!(!store.target_has_tasks("missing.net").await.unwrap());
    }

    #[tokio::test]
    async fn terminal_transitions_happen_once() {
        let store = InMemoryStore::new();
        let asset = store.add_asset("example.com", None, None).await;
        let task = store
            .insert_pending(NewTask {
                asset_id: asset.id,
                config_name: "s".into(),
                step_name: "s".into(),
                stage: None,
                log: None,
            })
            .await
            .unwrap();
        assert!(store.mark_running(task.id).await.unwrap());
        assert!(!store.mark_running(task.id).await.unwrap());
        assert!(
            store
                .mark_completed(task.id, "done", Some("artifacts/task_1.log"))
                .await
                .unwrap()
        );
        assert!(!store.mark_failed(task.id, "late", None).await.unwrap());

        let stored = TaskRepository::get(&store, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.log.as_deref(), Some("done"));
        assert!(stored.completed_at.is_some());
    }
}
