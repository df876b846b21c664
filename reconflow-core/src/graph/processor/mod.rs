//! Record processors: one per agent kind, each merging a parsed record into
//! the asset graph and reporting how many entities it created or changed.
//!
//! Processors are idempotent. Delivering the same record twice leaves the
//! graph as after the first delivery (vulnerabilities excepted, which are
//! append-only).

mod http;
mod port;
mod subdomain;
mod vulnerability;

pub use http::HttpProcessor;
pub use port::PortProcessor;
pub use subdomain::SubdomainProcessor;
pub use vulnerability::VulnerabilityProcessor;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::{GraphSession, HostOwnership, Owner};
use crate::{catalog::AgentKind, error::Result, parser::Record};

#[async_trait]
pub trait RecordProcessor: Send + Sync + fmt::Debug {
    fn agent(&self) -> AgentKind;

    /// Returns the number of entities created or materially changed.
    async fn process(
        &self,
        session: &mut dyn GraphSession,
        owner: Owner,
        record: &Record,
    ) -> Result<u64>;
}

/// Agent kind to processor lookup.
#[derive(Clone, Debug, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<AgentKind, Arc<dyn RecordProcessor>>,
}

impl ProcessorRegistry {
    /// Registry with the built-in processor for every agent kind.
    pub fn standard(ownership: HostOwnership) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(SubdomainProcessor::new(ownership)));
        registry.register(Arc::new(PortProcessor));
        registry.register(Arc::new(HttpProcessor));
        registry.register(Arc::new(VulnerabilityProcessor));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn RecordProcessor>) {
        self.processors.insert(processor.agent(), processor);
    }

    pub fn get(&self, agent: AgentKind) -> Option<&dyn RecordProcessor> {
        self.processors.get(&agent).map(|p| p.as_ref())
    }
}

/// Non-blank string field, trimmed.
pub(crate) fn str_field<'r>(record: &'r Record, key: &str) -> Option<&'r str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Integer field given either as a JSON number or a numeric string.
pub(crate) fn int_field(record: &Record, key: &str) -> Option<i64> {
    match record.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A string field, or the first non-blank string of a list field.
pub(crate) fn first_str<'r>(value: Option<&'r Value>) -> Option<&'r str> {
    match value? {
        Value::String(s) => Some(s.trim()).filter(|s| !s.is_empty()),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty()),
        _ => None,
    }
}

pub(crate) fn port_number(value: i64) -> Option<u16> {
    u16::try_from(value).ok().filter(|p| *p != 0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn field_helpers_tolerate_shapes() {
        let r = record(json!({
            "a": "  x ",
            "blank": "   ",
            "n": 80,
            "ns": "443",
            "bad": "http",
            "list": ["", "first", "second"],
        }));
        assert_eq!(str_field(&r, "a"), Some("x"));
        assert_eq!(str_field(&r, "blank"), None);
        assert_eq!(str_field(&r, "missing"), None);
        assert_eq!(int_field(&r, "n"), Some(80));
        assert_eq!(int_field(&r, "ns"), Some(443));
        assert_eq!(int_field(&r, "bad"), None);
        assert_eq!(first_str(r.get("list")), Some("first"));
        assert_eq!(first_str(r.get("a")), Some("x"));
        assert_eq!(port_number(0), None);
        assert_eq!(port_number(70000), None);
        assert_eq!(port_number(8080), Some(8080));
    }

    #[test]
    fn standard_registry_covers_every_agent() {
        let registry = ProcessorRegistry::standard(HostOwnership::Reassign);
        for agent in [
            AgentKind::Subdomain,
            AgentKind::Portscan,
            AgentKind::Http,
            AgentKind::Vulnerability,
        ] {
            assert_eq!(registry.get(agent).map(|p| p.agent()), Some(agent));
        }
        assert!(ProcessorRegistry::default().get(AgentKind::Http).is_none());
    }
}
