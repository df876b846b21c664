use async_trait::async_trait;
use serde_json::Value;

use super::{RecordProcessor, str_field};
use crate::{
    catalog::AgentKind,
    error::Result,
    graph::{GraphSession, NewVulnerability, Owner},
    parser::Record,
};

const DEFAULT_SEVERITY: &str = "medium";

/// Append-only vulnerability findings.
#[derive(Clone, Copy, Debug, Default)]
pub struct VulnerabilityProcessor;

#[async_trait]
impl RecordProcessor for VulnerabilityProcessor {
    fn agent(&self) -> AgentKind {
        AgentKind::Vulnerability
    }

    async fn process(
        &self,
        session: &mut dyn GraphSession,
        owner: Owner,
        record: &Record,
    ) -> Result<u64> {
        let Some(name) = str_field(record, "vulnerability_name") else {
            return Ok(0);
        };

        let vulnerability = NewVulnerability {
            owner,
            name: name.to_owned(),
            severity: str_field(record, "severity")
                .unwrap_or(DEFAULT_SEVERITY)
                .to_lowercase(),
            template_id: str_field(record, "template_id").map(str::to_owned),
            matched_at: str_field(record, "url").map(str::to_owned),
            details: Value::Object(record.clone()),
        };
        session.insert_vulnerability(&vulnerability).await?;
        Ok(1)
    }
}
