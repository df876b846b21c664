use async_trait::async_trait;
use serde_json::Value;
use url::{Host, Url};

use super::{RecordProcessor, first_str, int_field, port_number, str_field};
use crate::{
    catalog::AgentKind,
    error::Result,
    graph::{AsnInfo, GraphSession, NewHttpService, Owner},
    parser::Record,
};

/// Web service probe result: IP (with ASN), port, then the service itself.
///
/// A service is only stored when it can be anchored to a concrete port, which
/// requires an IP: the record's `ip`, else an IP literal in the URL.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpProcessor;

/// Port from the URL authority, else the scheme default.
pub(crate) fn infer_port(url: &str) -> u16 {
    match Url::parse(url) {
        Ok(parsed) => parsed
            .port()
            .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 }),
        Err(_) => 80,
    }
}

/// Host of `url` when it is an IPv4 or IPv6 literal.
pub(crate) fn url_ip_literal(url: &str) -> Option<String> {
    match Url::parse(url).ok()?.host()? {
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
        Host::Domain(_) => None,
    }
}

/// `asn.as-number` ("AS15169"), `asn.as-name`, `asn.as-country`.
pub(crate) fn asn_info(record: &Record) -> AsnInfo {
    let Some(asn) = record.get("asn").and_then(Value::as_object) else {
        return AsnInfo::default();
    };
    let number = asn
        .get("as-number")
        .and_then(Value::as_str)
        .map(str::trim)
        .and_then(|raw| {
            let prefix = raw.get(..2)?;
            prefix
                .eq_ignore_ascii_case("AS")
                .then(|| raw[2..].parse().ok())
                .flatten()
        });
    AsnInfo {
        number,
        name: first_str(asn.get("as-name")).map(str::to_owned),
        country: first_str(asn.get("as-country")).map(str::to_owned),
    }
}

fn string_value(record: &Record, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_value(record: &Record, key: &str) -> Option<Value> {
    record.get(key).filter(|v| !v.is_null()).cloned()
}

#[async_trait]
impl RecordProcessor for HttpProcessor {
    fn agent(&self) -> AgentKind {
        AgentKind::Http
    }

    async fn process(
        &self,
        session: &mut dyn GraphSession,
        owner: Owner,
        record: &Record,
    ) -> Result<u64> {
        let Some(url) = str_field(record, "url") else {
            return Ok(0);
        };
        let port = int_field(record, "port")
            .and_then(port_number)
            .unwrap_or_else(|| infer_port(url));
        let literal = url_ip_literal(url);
        let Some(ip) = first_str(record.get("ip")).or(literal.as_deref()) else {
            return Ok(0);
        };

        let mut changed = 0;
        let ip = session.upsert_ip(ip, owner).await?;
        let asn = asn_info(record);
        let asn_changed = !asn.is_empty() && session.merge_ip_asn(ip.row.id, &asn).await?;
        changed += u64::from(ip.changed() || asn_changed);

        let port = session.upsert_port(ip.row.id, port, Some("http")).await?;
        changed += u64::from(port.changed());

        let service = NewHttpService {
            port_id: port.row.id,
            url: url.to_owned(),
            title: string_value(record, "title"),
            status_code: int_field(record, "status_code")
                .and_then(|code| i32::try_from(code).ok()),
            tech: json_value(record, "tech"),
            web_server: string_value(record, "web_server"),
            favicon_hash: string_value(record, "favicon_hash"),
            ssl_info: json_value(record, "ssl_info"),
        };
        let service = session.upsert_http_service(&service).await?;
        changed += u64::from(service.changed());

        Ok(changed)
    }
}
