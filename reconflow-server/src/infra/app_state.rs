use std::{fmt, sync::Arc};

use reconflow_core::{
    Result,
    catalog::ScanCatalog,
    executor::TaskExecutor,
    graph::{GraphStore, processor::ProcessorRegistry},
    infra::{
        InMemoryStore, PostgresAssetRepository, PostgresGraphStore, PostgresTaskRepository,
    },
    queue::{InMemoryChainQueue, PostgresChainQueue, QueueService},
    submission::SubmissionService,
    tasks::{AssetRepository, TaskRepository},
};
use sqlx::PgPool;

use crate::infra::config::Config;

/// Persistence and queue backends behind their ports.
#[derive(Clone)]
pub struct Storage {
    pub tasks: Arc<dyn TaskRepository>,
    pub assets: Arc<dyn AssetRepository>,
    pub graph: Arc<dyn GraphStore>,
    pub queue: Arc<dyn QueueService>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("tasks", &self.tasks)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Process-local backends. The store handle is returned as well so
    /// callers can seed assets or inspect the graph.
    pub fn in_memory() -> (Self, InMemoryStore) {
        let store = InMemoryStore::new();
        let storage = Self {
            tasks: Arc::new(store.clone()),
            assets: Arc::new(store.clone()),
            graph: Arc::new(store.clone()),
            queue: Arc::new(InMemoryChainQueue::new()),
        };
        (storage, store)
    }

    pub async fn postgres(pool: PgPool) -> Result<Self> {
        let queue = PostgresChainQueue::new(pool.clone()).await?;
        Ok(Self {
            tasks: Arc::new(PostgresTaskRepository::new(pool.clone())),
            assets: Arc::new(PostgresAssetRepository::new(pool.clone())),
            graph: Arc::new(PostgresGraphStore::new(pool)),
            queue: Arc::new(queue),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<ScanCatalog>,
    pub tasks: Arc<dyn TaskRepository>,
    pub assets: Arc<dyn AssetRepository>,
    pub queue: Arc<dyn QueueService>,
    pub submissions: Arc<SubmissionService>,
    pub executor: Arc<TaskExecutor>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire the submission service and the executor over one set of
    /// backends and a shared catalog.
    pub fn from_parts(config: Config, catalog: ScanCatalog, storage: Storage) -> Self {
        let catalog = Arc::new(catalog);
        let processors = Arc::new(ProcessorRegistry::standard(config.graph.host_ownership));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&catalog),
            Arc::clone(&storage.tasks),
            Arc::clone(&storage.assets),
            Arc::clone(&storage.graph),
            processors,
            config.executor_settings(),
        ));
        let submissions = Arc::new(SubmissionService::new(
            Arc::clone(&catalog),
            Arc::clone(&storage.tasks),
            Arc::clone(&storage.assets),
            Arc::clone(&storage.queue),
        ));

        Self {
            config: Arc::new(config),
            catalog,
            tasks: storage.tasks,
            assets: storage.assets,
            queue: storage.queue,
            submissions,
            executor,
        }
    }
}
