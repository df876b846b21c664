//! Scan catalog: named step definitions and the strategies that chain them.
//!
//! The catalog is loaded once from two YAML documents and then shared
//! read-only (behind an `Arc`) by the submission service and the executor.
//! Kinds are resolved while loading, so an unknown parser, agent or target
//! mode never reaches a worker.

mod model;

pub use model::{
    AgentKind, FieldMapping, FieldSource, ParserKind, ScanConfig,
    ScanStrategy, TargetSource,
};

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ReconError, Result};

#[derive(Debug, Deserialize)]
struct ScanConfigDocument {
    config_name: String,
    #[serde(default)]
    description: Option<String>,
    command_template: String,
    output_parser_type: String,
    #[serde(default)]
    data_mapping: BTreeMap<String, String>,
    agent_type: String,
    #[serde(default)]
    target_source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScanStrategyDocument {
    strategy_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<String>,
}

impl TryFrom<ScanConfigDocument> for ScanConfig {
    type Error = ReconError;

    fn try_from(doc: ScanConfigDocument) -> Result<Self> {
        let name = doc.config_name.trim().to_owned();
        if name.is_empty() {
            return Err(ReconError::Config(
                "scanner entry with empty config_name".into(),
            ));
        }
        if doc.command_template.trim().is_empty() {
            return Err(ReconError::Config(format!(
                "scanner '{name}': empty command_template"
            )));
        }

        let with_name =
            |e: ReconError| ReconError::Config(format!("scanner '{name}': {e}"));
        let parser = doc.output_parser_type.parse().map_err(with_name)?;
        let agent = doc.agent_type.parse().map_err(with_name)?;
        let target_source = doc
            .target_source
            .as_deref()
            .map(str::parse::<TargetSource>)
            .transpose()
            .map_err(with_name)?
            .unwrap_or_default();

        Ok(ScanConfig {
            name,
            description: doc.description,
            command_template: doc.command_template,
            parser,
            mapping: FieldMapping::from_pairs(doc.data_mapping),
            agent,
            target_source,
        })
    }
}

/// Immutable registry of step definitions and strategies.
#[derive(Clone, Debug, Default)]
pub struct ScanCatalog {
    configs: Vec<ScanConfig>,
    strategies: Vec<ScanStrategy>,
    config_index: HashMap<String, usize>,
    strategy_index: HashMap<String, usize>,
}

impl ScanCatalog {
    /// Build a catalog from already-resolved entries. Duplicate names are
    /// rejected; strategies naming unknown steps are kept (and rejected when
    /// resolved).
    pub fn new(
        configs: Vec<ScanConfig>,
        strategies: Vec<ScanStrategy>,
    ) -> Result<Self> {
        let mut config_index = HashMap::with_capacity(configs.len());
        for (idx, config) in configs.iter().enumerate() {
            if config_index.insert(config.name.clone(), idx).is_some() {
                return Err(ReconError::Config(format!(
                    "duplicate config_name '{}'",
                    config.name
                )));
            }
        }

        let mut strategy_index = HashMap::with_capacity(strategies.len());
        for (idx, strategy) in strategies.iter().enumerate() {
            if strategy_index.insert(strategy.name.clone(), idx).is_some() {
                return Err(ReconError::Config(format!(
                    "duplicate strategy_name '{}'",
                    strategy.name
                )));
            }
            if strategy.steps.is_empty() {
                warn!(strategy = %strategy.name, "strategy has no steps");
            }
            for step in &strategy.steps {
                if !config_index.contains_key(step) {
                    warn!(
                        strategy = %strategy.name,
                        step = %step,
                        "strategy references unknown step"
                    );
                }
            }
        }

        Ok(Self {
            configs,
            strategies,
            config_index,
            strategy_index,
        })
    }

    /// Parse both catalog documents. Each root must be a list of records.
    pub fn from_yaml(scanners: &str, strategies: &str) -> Result<Self> {
        let config_docs: Vec<ScanConfigDocument> =
            serde_yaml::from_str(scanners).map_err(|e| {
                ReconError::Config(format!(
                    "scanners document must be a list of scanner records: {e}"
                ))
            })?;
        let strategy_docs: Vec<ScanStrategyDocument> =
            serde_yaml::from_str(strategies).map_err(|e| {
                ReconError::Config(format!(
                    "strategies document must be a list of strategy records: {e}"
                ))
            })?;

        let configs = config_docs
            .into_iter()
            .map(ScanConfig::try_from)
            .collect::<Result<Vec<_>>>()?;
        let strategies = strategy_docs
            .into_iter()
            .map(|doc| ScanStrategy {
                name: doc.strategy_name.trim().to_owned(),
                description: doc.description,
                steps: doc.steps,
            })
            .collect();

        Self::new(configs, strategies)
    }

    /// Load the catalog from disk; both files must exist.
    pub fn load(
        scanners_path: impl AsRef<Path>,
        strategies_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let scanners = read_document(scanners_path.as_ref())?;
        let strategies = read_document(strategies_path.as_ref())?;
        let catalog = Self::from_yaml(&scanners, &strategies)?;
        info!(
            configs = catalog.configs.len(),
            strategies = catalog.strategies.len(),
            "scan catalog loaded"
        );
        Ok(catalog)
    }

    pub fn config(&self, name: &str) -> Option<&ScanConfig> {
        self.config_index.get(name).map(|&idx| &self.configs[idx])
    }

    pub fn strategy(&self, name: &str) -> Option<&ScanStrategy> {
        self.strategy_index
            .get(name)
            .map(|&idx| &self.strategies[idx])
    }

    pub fn configs(&self) -> &[ScanConfig] {
        &self.configs
    }

    pub fn strategies(&self) -> &[ScanStrategy] {
        &self.strategies
    }

    /// Expand a strategy into its step configs, in order.
    ///
    /// Unknown strategy is `NotFound`; an empty strategy or an unknown step is
    /// `InvalidRequest`.
    pub fn resolve_strategy(&self, name: &str) -> Result<Vec<&ScanConfig>> {
        let strategy = self.strategy(name).ok_or_else(|| {
            ReconError::NotFound(format!("scan strategy '{name}' not found"))
        })?;
        if strategy.steps.is_empty() {
            return Err(ReconError::InvalidRequest(format!(
                "scan strategy '{name}' has no steps"
            )));
        }
        strategy
            .steps
            .iter()
            .map(|step| {
                self.config(step).ok_or_else(|| {
                    ReconError::InvalidRequest(format!(
                        "scan strategy '{name}' references unknown step '{step}'"
                    ))
                })
            })
            .collect()
    }
}

fn read_document(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(ReconError::Config(format!(
            "catalog file not found: {}",
            path.display()
        )));
    }
    std::fs::read_to_string(path).map_err(|e| {
        ReconError::Config(format!("failed to read {}: {e}", path.display()))
    })
}
