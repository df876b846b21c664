//! Runs one persisted task end to end: resolve its step, prepare input, run
//! the tool, capture the artifact, parse, merge into the graph, and record the
//! terminal status.

pub mod artifact;
pub mod command;

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    catalog::{ScanCatalog, ScanConfig, TargetSource},
    error::{ReconError, Result},
    graph::{
        GraphStore, Owner,
        processor::{ProcessorRegistry, RecordProcessor},
    },
    parser::parser_for,
    tasks::{
        AssetRecord, AssetRepository, TaskId, TaskRecord, TaskRepository,
        TaskStatus, head_chars,
    },
};

use self::{
    artifact::write_artifact,
    command::{render_command, run_shell},
};

#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    pub artifact_dir: PathBuf,
    pub command_timeout: Duration,
    pub shell: String,
    /// Maximum characters kept from a failure message.
    pub log_limit: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            command_timeout: Duration::from_secs(3600),
            shell: "/bin/sh".to_owned(),
            log_limit: 2000,
        }
    }
}

/// Extra graph transactions attempted after a deadlock or serialization
/// failure.
const MAX_GRAPH_CONFLICT_RETRIES: u32 = 2;

/// Result of one `execute` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Task missing or no longer pending; nothing was done.
    Skipped { status: Option<TaskStatus> },
    Completed { records: u64, changed: u64 },
    Failed { reason: String },
}

#[derive(Debug, Default)]
struct AttemptReport {
    records: u64,
    changed: u64,
    note: Option<&'static str>,
}

pub struct TaskExecutor {
    catalog: Arc<ScanCatalog>,
    tasks: Arc<dyn TaskRepository>,
    assets: Arc<dyn AssetRepository>,
    graph: Arc<dyn GraphStore>,
    processors: Arc<ProcessorRegistry>,
    settings: ExecutorSettings,
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("configs", &self.catalog.configs().len())
            .field("graph", &self.graph)
            .field("settings", &self.settings)
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(
        catalog: Arc<ScanCatalog>,
        tasks: Arc<dyn TaskRepository>,
        assets: Arc<dyn AssetRepository>,
        graph: Arc<dyn GraphStore>,
        processors: Arc<ProcessorRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            catalog,
            tasks,
            assets,
            graph,
            processors,
            settings,
        }
    }

    pub fn tasks(&self) -> &Arc<dyn TaskRepository> {
        &self.tasks
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute a pending task. Failures of the attempt itself are reported as
    /// [`ExecutionOutcome::Failed`]; `Err` means the task state could not be
    /// read or written.
    pub async fn execute(&self, task_id: TaskId) -> Result<ExecutionOutcome> {
        let Some(task) = self.tasks.get(task_id).await? else {
            warn!(target: "scan::executor", %task_id, "task not found; skipping");
            return Ok(ExecutionOutcome::Skipped { status: None });
        };
        if task.status != TaskStatus::Pending {
            info!(
                target: "scan::executor",
                %task_id,
                status = %task.status,
                "task is not pending; skipping"
            );
            return Ok(ExecutionOutcome::Skipped {
                status: Some(task.status),
            });
        }

        let Some(asset) = self.assets.get(task.asset_id).await? else {
            let reason = format!("asset {} not found", task.asset_id);
            self.tasks.mark_failed(task_id, &reason, None).await?;
            warn!(
                target: "scan::executor",
                %task_id,
                asset_id = %task.asset_id,
                "asset not found"
            );
            return Ok(ExecutionOutcome::Failed { reason });
        };

        if !self.tasks.mark_running(task_id).await? {
            debug!(
                target: "scan::executor",
                %task_id,
                "task left pending state concurrently"
            );
            return Ok(ExecutionOutcome::Skipped { status: None });
        }
        info!(
            target: "scan::executor",
            %task_id,
            config = %task.config_name,
            asset = %asset.name,
            "task started"
        );

        let mut artifact = None;
        match self.attempt(&task, &asset, &mut artifact).await {
            Ok(report) => {
                let mut log = format!(
                    "{} records processed, {} entities created or updated",
                    report.records, report.changed
                );
                if let Some(note) = report.note {
                    log = format!("{note}; {log}");
                }
                self.tasks
                    .mark_completed(task_id, &log, artifact.as_deref())
                    .await?;
                info!(
                    target: "scan::executor",
                    %task_id,
                    records = report.records,
                    changed = report.changed,
                    "task completed"
                );
                Ok(ExecutionOutcome::Completed {
                    records: report.records,
                    changed: report.changed,
                })
            }
            Err(e) => {
                let message = e.to_string();
                let reason =
                    head_chars(&message, self.settings.log_limit).to_owned();
                self.tasks
                    .mark_failed(task_id, &reason, artifact.as_deref())
                    .await?;
                error!(target: "scan::executor", %task_id, error = %e, "task failed");
                Ok(ExecutionOutcome::Failed { reason })
            }
        }
    }

    async fn attempt(
        &self,
        task: &TaskRecord,
        asset: &AssetRecord,
        artifact: &mut Option<String>,
    ) -> Result<AttemptReport> {
        let config = self.catalog.config(&task.config_name).ok_or_else(|| {
            ReconError::Execution(format!(
                "scan config '{}' not found",
                task.config_name
            ))
        })?;

        let command = render_command(&config.command_template, &asset.name)?;
        let stdin = match config.target_source {
            TargetSource::Root => None,
            TargetSource::Subdomains => {
                let hostnames = self.graph.discovered_hostnames(asset.id.0).await?;
                if hostnames.is_empty() {
                    return Ok(AttemptReport {
                        note: Some("no discovered hostnames to scan"),
                        ..AttemptReport::default()
                    });
                }
                Some(hostnames.join("\n"))
            }
        };

        debug!(target: "scan::executor", task_id = %task.id, %command, "running command");
        let output = run_shell(
            &self.settings.shell,
            &command,
            stdin,
            self.settings.command_timeout,
        )
        .await?;

        let path =
            write_artifact(&self.settings.artifact_dir, task.id, &command, &output).await?;
        *artifact = Some(path.to_string_lossy().into_owned());

        if !output.success() && output.stdout.trim().is_empty() {
            let code = output
                .exit_code
                .map_or_else(|| "signal".to_owned(), |c| c.to_string());
            return Err(ReconError::Execution(format!(
                "command exited with {code}: {}",
                output.stderr.trim()
            )));
        }

        let processor = self.processors.get(config.agent);
        if processor.is_none() {
            warn!(
                target: "scan::executor",
                task_id = %task.id,
                agent = %config.agent,
                "no processor registered; records are archived only"
            );
        }
        let owner = Owner {
            project_id: asset.project_id,
            root_asset_id: asset.id.0,
        };

        let mut conflicts = 0;
        loop {
            match self
                .merge_output(task.id, config, processor, owner, &output.stdout)
                .await
            {
                Err(e) if e.is_transient() && conflicts < MAX_GRAPH_CONFLICT_RETRIES => {
                    conflicts += 1;
                    warn!(
                        target: "scan::executor",
                        task_id = %task.id,
                        attempt = conflicts,
                        error = %e,
                        "graph transaction conflicted; retrying"
                    );
                }
                result => return result,
            }
        }
    }

    /// Parse the output and merge every record in one graph transaction.
    async fn merge_output(
        &self,
        task_id: TaskId,
        config: &ScanConfig,
        processor: Option<&dyn RecordProcessor>,
        owner: Owner,
        stdout: &str,
    ) -> Result<AttemptReport> {
        let records = parser_for(config.parser).parse(stdout, &config.mapping)?;

        let mut session = self.graph.begin().await?;
        let mut report = AttemptReport::default();
        for record in records {
            let step = async {
                session.archive_raw(task_id, &record).await?;
                match processor {
                    Some(processor) => {
                        processor.process(session.as_mut(), owner, &record).await
                    }
                    None => Ok(0),
                }
            }
            .await;

            match step {
                Ok(changed) => {
                    report.records += 1;
                    report.changed += changed;
                }
                Err(e) => {
                    if let Err(rollback) = session.rollback().await {
                        warn!(
                            target: "scan::executor",
                            %task_id,
                            error = %rollback,
                            "rollback failed"
                        );
                    }
                    return Err(e);
                }
            }
        }
        session.commit().await?;
        Ok(report)
    }
}
