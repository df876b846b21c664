use async_trait::async_trait;

use super::{RecordProcessor, int_field, port_number, str_field};
use crate::{
    catalog::AgentKind,
    error::Result,
    graph::{GraphSession, Owner},
    parser::Record,
};

/// Open port on an IP, with its service name when known.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortProcessor;

#[async_trait]
impl RecordProcessor for PortProcessor {
    fn agent(&self) -> AgentKind {
        AgentKind::Portscan
    }

    async fn process(
        &self,
        session: &mut dyn GraphSession,
        owner: Owner,
        record: &Record,
    ) -> Result<u64> {
        let (Some(ip), Some(port)) = (
            str_field(record, "ip"),
            int_field(record, "port").and_then(port_number),
        ) else {
            return Ok(0);
        };

        let ip = session.upsert_ip(ip, owner).await?;
        let port = session
            .upsert_port(ip.row.id, port, str_field(record, "service"))
            .await?;

        Ok(u64::from(ip.changed()) + u64::from(port.changed()))
    }
}
