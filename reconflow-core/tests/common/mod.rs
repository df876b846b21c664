#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use reconflow_core::{
    catalog::ScanCatalog,
    executor::{ExecutorSettings, TaskExecutor},
    graph::{GraphStore, HostOwnership, processor::ProcessorRegistry},
    infra::InMemoryStore,
    queue::{InMemoryChainQueue, QueueService},
    submission::SubmissionService,
    tasks::{AssetRecord, TaskId, TaskRecord, TaskRepository},
};
use tempfile::TempDir;

/// Mock tools driven by `/bin/sh` builtins.
pub const SCANNERS: &str = r#"
- config_name: discover-subs
  command_template: |
    printf '{"host":"sub.%s","a":["1.2.3.4"]}\n' {target}
  output_parser_type: json_lines
  data_mapping:
    hostname: host
    ip: a
  agent_type: subdomain
- config_name: slow-subs
  command_template: |
    sleep 1; printf '{"host":"slow.%s"}\n' {target}
  output_parser_type: json_lines
  data_mapping:
    hostname: host
  agent_type: subdomain
- config_name: probe-http
  command_template: |
    while read -r h; do printf '{"url":"http://%s:80","ip":"1.2.3.4","status_code":200,"title":"Example"}\n' "$h"; done
  output_parser_type: json_lines
  data_mapping:
    url: url
    ip: ip
    status_code: status_code
    title: title
  agent_type: http
  target_source: subdomains
- config_name: broken
  command_template: "echo 'tool crashed' >&2; exit 1"
  output_parser_type: line_parser
  data_mapping:
    hostname: self
  agent_type: subdomain
- config_name: torn-xml
  command_template: |
    printf '<nmaprun><host><status state="up"/><address addr="10.0.0.7" addrtype="ipv4"/><ports><port protocol="tcp" portid="22"><state state="open"/></port></ports></hots></nmaprun>\n'
  output_parser_type: nmap_xml
  data_mapping: {}
  agent_type: portscan
- config_name: noisy-json
  command_template: |
    printf '{"host":"a.%s","ip":"10.0.0.1"}\nnot json\n{"host":"b.%s","ip":"10.0.0.2"}\n' {target} {target}
  output_parser_type: json_lines
  data_mapping:
    hostname: host
    ip: ip
  agent_type: subdomain
"#;

pub const STRATEGIES: &str = r#"
- strategy_name: web
  description: subdomains then web probe
  steps: [discover-subs, probe-http]
- strategy_name: fragile
  steps: [broken, discover-subs]
- strategy_name: noisy
  steps: [noisy-json]
- strategy_name: slow-then-web
  steps: [slow-subs, discover-subs]
- strategy_name: empty
  steps: []
- strategy_name: dangling
  steps: [discover-subs, masscan]
"#;

pub struct Harness {
    pub store: InMemoryStore,
    pub queue: Arc<InMemoryChainQueue>,
    pub catalog: Arc<ScanCatalog>,
    pub executor: Arc<TaskExecutor>,
    pub submissions: SubmissionService,
    pub artifacts: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_queue(Arc::new(InMemoryChainQueue::new()))
    }

    pub fn with_queue(queue: Arc<InMemoryChainQueue>) -> Self {
        Self::build(Arc::clone(&queue) as Arc<dyn QueueService>, queue)
    }

    pub fn build(dispatch: Arc<dyn QueueService>, queue: Arc<InMemoryChainQueue>) -> Self {
        let store = InMemoryStore::new();
        Self::assemble(
            dispatch,
            queue,
            store.clone(),
            Arc::new(store),
            ProcessorRegistry::standard(HostOwnership::Reassign),
        )
    }

    /// Harness whose executor merges through `graph` with `processors`.
    pub fn with_graph(
        store: InMemoryStore,
        graph: Arc<dyn GraphStore>,
        processors: ProcessorRegistry,
    ) -> Self {
        let queue = Arc::new(InMemoryChainQueue::new());
        Self::assemble(
            Arc::clone(&queue) as Arc<dyn QueueService>,
            queue,
            store,
            graph,
            processors,
        )
    }

    fn assemble(
        dispatch: Arc<dyn QueueService>,
        queue: Arc<InMemoryChainQueue>,
        store: InMemoryStore,
        graph: Arc<dyn GraphStore>,
        processors: ProcessorRegistry,
    ) -> Self {
        let artifacts = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ScanCatalog::from_yaml(SCANNERS, STRATEGIES).unwrap());
        let settings = ExecutorSettings {
            artifact_dir: artifacts.path().to_path_buf(),
            command_timeout: Duration::from_secs(20),
            ..ExecutorSettings::default()
        };
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&catalog),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            graph,
            Arc::new(processors),
            settings,
        ));
        let submissions = SubmissionService::new(
            Arc::clone(&catalog),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            dispatch,
        );
        Self {
            store,
            queue,
            catalog,
            executor,
            submissions,
            artifacts,
        }
    }

    pub async fn asset(&self, name: &str) -> AssetRecord {
        self.store.add_asset(name, Some(1), Some(1)).await
    }

    pub async fn task(&self, id: TaskId) -> TaskRecord {
        TaskRepository::get(&self.store, id).await.unwrap().unwrap()
    }
}
