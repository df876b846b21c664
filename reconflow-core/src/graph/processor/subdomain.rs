use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use super::{RecordProcessor, str_field};
use crate::{
    catalog::AgentKind,
    error::Result,
    graph::{GraphSession, HostOwnership, Owner, normalize_hostname},
    parser::Record,
};

/// Host, its IPs, and the DNS association between them.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubdomainProcessor {
    ownership: HostOwnership,
}

impl SubdomainProcessor {
    pub fn new(ownership: HostOwnership) -> Self {
        Self { ownership }
    }
}

fn ip_values(record: &Record) -> BTreeSet<String> {
    let mut ips = BTreeSet::new();
    let mut collect = |value: &Value| match value {
        Value::String(s) if !s.trim().is_empty() => {
            ips.insert(s.trim().to_owned());
        }
        Value::Array(items) => {
            for ip in items.iter().filter_map(Value::as_str).map(str::trim) {
                if !ip.is_empty() {
                    ips.insert(ip.to_owned());
                }
            }
        }
        _ => {}
    };
    if let Some(value) = record.get("ip") {
        collect(value);
    }
    if let Some(value @ Value::Array(_)) = record.get("ips") {
        collect(value);
    }
    ips
}

#[async_trait]
impl RecordProcessor for SubdomainProcessor {
    fn agent(&self) -> AgentKind {
        AgentKind::Subdomain
    }

    async fn process(
        &self,
        session: &mut dyn GraphSession,
        owner: Owner,
        record: &Record,
    ) -> Result<u64> {
        let Some(raw) = ["hostname", "host", "target"]
            .into_iter()
            .find_map(|key| str_field(record, key))
        else {
            return Ok(0);
        };
        let hostname = normalize_hostname(raw);
        if hostname.is_empty() {
            return Ok(0);
        }
        let record_type = str_field(record, "record_type")
            .or_else(|| str_field(record, "type"))
            .unwrap_or("A");

        let mut changed = 0;
        let host = session.upsert_host(&hostname, owner, self.ownership).await?;
        changed += u64::from(host.changed());

        for ip in ip_values(record) {
            let ip = session.upsert_ip(&ip, owner).await?;
            changed += u64::from(ip.changed());

            let dns = session
                .upsert_dns_record(host.row.id, ip.row.id, record_type)
                .await?;
            changed += u64::from(dns.changed());
        }

        Ok(changed)
    }
}
