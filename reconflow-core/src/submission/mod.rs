//! Strategy submission and retries.
//!
//! A submission expands a strategy into its steps, creates one pending task
//! per step (each committed on its own, ids increasing in step order) and
//! enqueues the ordered id list as a single chain.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    catalog::{ScanCatalog, ScanConfig},
    error::{ReconError, Result},
    graph::normalize_hostname,
    queue::{ChainMessage, QueueService},
    tasks::{AssetId, AssetRecord, AssetRepository, NewTask, TaskId, TaskRepository},
};

pub const STRATEGY_RETRY_NOTE: &str = "retry: strategy chain re-run";
pub const STEP_RETRY_NOTE: &str = "retry: single step re-run";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub strategy_name: String,
    pub task_ids: Vec<TaskId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Re-run only the step of the given task.
    Step,
    /// Re-run the whole strategy the task belonged to.
    Strategy,
}

pub struct SubmissionService {
    catalog: Arc<ScanCatalog>,
    tasks: Arc<dyn TaskRepository>,
    assets: Arc<dyn AssetRepository>,
    queue: Arc<dyn QueueService>,
}

impl fmt::Debug for SubmissionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionService")
            .field("strategies", &self.catalog.strategies().len())
            .field("tasks", &self.tasks)
            .field("queue", &self.queue)
            .finish()
    }
}

impl SubmissionService {
    pub fn new(
        catalog: Arc<ScanCatalog>,
        tasks: Arc<dyn TaskRepository>,
        assets: Arc<dyn AssetRepository>,
        queue: Arc<dyn QueueService>,
    ) -> Self {
        Self {
            catalog,
            tasks,
            assets,
            queue,
        }
    }

    pub fn catalog(&self) -> &ScanCatalog {
        &self.catalog
    }

    /// Submit a strategy against an asset.
    ///
    /// Without `force`, a target (compared by normalized name across all
    /// assets) that already has any task is not scanned again and the result
    /// carries no ids.
    pub async fn submit(
        &self,
        asset_id: AssetId,
        strategy_name: &str,
        force: bool,
    ) -> Result<SubmissionResult> {
        let asset = self.load_asset(asset_id).await?;
        let steps = self.catalog.resolve_strategy(strategy_name)?;

        if !force {
            let normalized = normalize_hostname(&asset.name);
            if self.tasks.target_has_tasks(&normalized).await? {
                info!(
                    asset_id = %asset.id,
                    target = %normalized,
                    strategy = strategy_name,
                    "target already scanned; submission suppressed"
                );
                return Ok(SubmissionResult {
                    strategy_name: strategy_name.to_owned(),
                    task_ids: Vec::new(),
                });
            }
        }

        let note = force.then_some(STRATEGY_RETRY_NOTE);
        let task_ids = self.create_chain(&asset, &steps, note).await?;
        Ok(SubmissionResult {
            strategy_name: strategy_name.to_owned(),
            task_ids,
        })
    }

    /// Re-run a task's step or its whole strategy. Both bypass suppression.
    ///
    /// `strategy_name` is needed for [`RetryMode::Strategy`]; when absent the
    /// first strategy containing the task's step is used.
    pub async fn retry(
        &self,
        task_id: TaskId,
        mode: RetryMode,
        strategy_name: Option<&str>,
    ) -> Result<SubmissionResult> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("task {task_id} not found")))?;
        let asset = self.load_asset(task.asset_id).await?;

        match mode {
            RetryMode::Step => {
                let config = self.catalog.config(&task.config_name).ok_or_else(|| {
                    ReconError::InvalidRequest(format!(
                        "task {task_id} references unknown step '{}'",
                        task.config_name
                    ))
                })?;
                let task_ids = self
                    .create_chain(&asset, &[config], Some(STEP_RETRY_NOTE))
                    .await?;
                Ok(SubmissionResult {
                    strategy_name: task.step_name,
                    task_ids,
                })
            }
            RetryMode::Strategy => {
                let name = match strategy_name {
                    Some(name) => name.to_owned(),
                    None => self
                        .catalog
                        .strategies()
                        .iter()
                        .find(|s| s.steps.contains(&task.step_name))
                        .map(|s| s.name.clone())
                        .ok_or_else(|| {
                            ReconError::InvalidRequest(format!(
                                "no strategy contains step '{}'",
                                task.step_name
                            ))
                        })?,
                };
                self.submit(asset.id, &name, true).await
            }
        }
    }

    async fn load_asset(&self, asset_id: AssetId) -> Result<AssetRecord> {
        self.assets
            .get(asset_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("asset {asset_id} not found")))
    }

    async fn create_chain(
        &self,
        asset: &AssetRecord,
        steps: &[&ScanConfig],
        note: Option<&str>,
    ) -> Result<Vec<TaskId>> {
        let mut task_ids = Vec::with_capacity(steps.len());
        for config in steps {
            let task = self
                .tasks
                .insert_pending(NewTask {
                    asset_id: asset.id,
                    config_name: config.name.clone(),
                    step_name: config.name.clone(),
                    stage: Some(config.agent.as_str().to_owned()),
                    log: note.map(str::to_owned),
                })
                .await?;
            task_ids.push(task.id);
        }

        if let Err(e) = self.queue.enqueue(ChainMessage::new(task_ids.clone())).await {
            error!(
                asset_id = %asset.id,
                tasks = ?task_ids,
                error = %e,
                "tasks created but chain enqueue failed; tasks stay pending"
            );
            return Err(ReconError::Queue(format!(
                "tasks {task_ids:?} created but not enqueued: {e}"
            )));
        }
        info!(asset_id = %asset.id, tasks = ?task_ids, "scan chain submitted");
        Ok(task_ids)
    }
}
