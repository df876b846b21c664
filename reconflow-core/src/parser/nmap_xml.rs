use quick_xml::de::from_str;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{OutputParser, Record, Records};
use crate::{
    catalog::{FieldMapping, ParserKind},
    error::{ReconError, Result},
};

#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, Deserialize)]
struct NmapHost {
    #[serde(default)]
    status: Option<NmapStatus>,
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    ports: Option<NmapPorts>,
}

#[derive(Debug, Deserialize)]
struct NmapStatus {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addrtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, Deserialize)]
struct NmapPort {
    #[serde(rename = "@protocol")]
    protocol: String,
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(default)]
    state: Option<NmapState>,
    #[serde(default)]
    service: Option<NmapService>,
}

#[derive(Debug, Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct NmapService {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@product", default)]
    product: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
}

/// nmap `-oX` output: one record per open port on a host that is up.
///
/// Records have a fixed shape (`ip`, `port`, `protocol`, `service`, and
/// `product`/`version` when reported); the field mapping is not consulted.
#[derive(Clone, Copy, Debug, Default)]
pub struct NmapXmlParser;

impl OutputParser for NmapXmlParser {
    fn kind(&self) -> ParserKind {
        ParserKind::NmapXml
    }

    fn parse<'a>(&self, raw: &'a str, _mapping: &'a FieldMapping) -> Result<Records<'a>> {
        let records = parse_document(raw)?;
        Ok(Box::new(records.into_iter()))
    }
}

fn parse_document(raw: &str) -> Result<Vec<Record>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let Some(start) = raw.find("<nmaprun") else {
        warn!(target: "scan::parser", "no <nmaprun> element in nmap output");
        return Err(ReconError::Parse(
            "no <nmaprun> element in nmap output".to_owned(),
        ));
    };

    let run: NmapRun = from_str(&raw[start..]).map_err(|e| {
        warn!(target: "scan::parser", error = %e, "malformed nmap XML; discarding output");
        ReconError::Parse(format!("malformed nmap XML: {e}"))
    })?;

    let mut records = Vec::new();
    for host in run.hosts {
        let Some(ip) = host
            .addresses
            .iter()
            .find(|a| a.addrtype.as_deref() == Some("ipv4"))
            .map(|a| a.addr.clone())
        else {
            debug!(target: "scan::parser", "skipping host without an ipv4 address");
            continue;
        };
        if host.status.as_ref().map(|s| s.state.as_str()) != Some("up") {
            continue;
        }
        let Some(ports) = host.ports else {
            continue;
        };

        for port in ports.ports {
            if port.state.as_ref().map(|s| s.state.as_str()) != Some("open") {
                continue;
            }
            let mut record = Record::new();
            record.insert("ip".into(), Value::String(ip.clone()));
            record.insert("port".into(), Value::from(port.portid));
            record.insert("protocol".into(), Value::String(port.protocol));

            let service = port.service.unwrap_or(NmapService {
                name: None,
                product: None,
                version: None,
            });
            record.insert(
                "service".into(),
                Value::String(service.name.unwrap_or_else(|| "unknown".into())),
            );
            if let Some(product) = service.product {
                record.insert("product".into(), Value::String(product));
            }
            if let Some(version) = service.version {
                record.insert("version".into(), Value::String(version));
            }
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SCAN: &str = r#"Starting Nmap 7.94
<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -oX - 10.0.0.0/30" version="7.94">
<scaninfo type="syn" protocol="tcp" numservices="1000" services="1-1000"/>
<host starttime="1" endtime="2">
  <status state="up" reason="syn-ack"/>
  <address addr="10.0.0.1" addrtype="ipv4"/>
  <address addr="AA:BB:CC:DD:EE:FF" addrtype="mac"/>
  <hostnames><hostname name="gw.local" type="PTR"/></hostnames>
  <ports>
    <extraports state="closed" count="997"/>
    <port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh" product="OpenSSH" version="9.6"/></port>
    <port protocol="tcp" portid="80"><state state="open" reason="syn-ack"/><service name="http"/></port>
    <port protocol="tcp" portid="443"><state state="filtered" reason="no-response"/></port>
    <port protocol="tcp" portid="8080"><state state="open" reason="syn-ack"/></port>
  </ports>
</host>
<host starttime="1" endtime="2">
  <status state="down" reason="no-response"/>
  <address addr="10.0.0.2" addrtype="ipv4"/>
  <ports>
    <port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/></port>
  </ports>
</host>
<host starttime="1" endtime="2">
  <status state="up" reason="syn-ack"/>
  <address addr="fe80::1" addrtype="ipv6"/>
  <ports>
    <port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/></port>
  </ports>
</host>
<runstats><finished time="3"/><hosts up="2" down="1" total="3"/></runstats>
</nmaprun>
"#;

    #[test]
    fn open_ports_on_up_ipv4_hosts_only() {
        let mapping = FieldMapping::default();
        let records: Vec<_> = NmapXmlParser.parse(SCAN, &mapping).unwrap().collect();

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r["ip"] == "10.0.0.1"));

        assert_eq!(records[0]["port"], json!(22));
        assert_eq!(records[0]["protocol"], json!("tcp"));
        assert_eq!(records[0]["service"], json!("ssh"));
        assert_eq!(records[0]["product"], json!("OpenSSH"));
        assert_eq!(records[0]["version"], json!("9.6"));

        assert_eq!(records[1]["port"], json!(80));
        assert!(!records[1].contains_key("product"));

        assert_eq!(records[2]["port"], json!(8080));
        assert_eq!(records[2]["service"], json!("unknown"));
    }

    #[test]
    fn down_host_yields_nothing() {
        let xml = r#"<nmaprun><host><status state="down"/><address addr="10.0.0.9" addrtype="ipv4"/><ports><port protocol="tcp" portid="80"><state state="open"/></port></ports></host></nmaprun>"#;
        assert_eq!(
            NmapXmlParser
                .parse(xml, &FieldMapping::default())
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn malformed_xml_is_an_error_without_partial_results() {
        let broken = SCAN.replacen("</ports>\n</host>", "</ports>\n</hots>", 1);
        assert!(matches!(
            NmapXmlParser.parse(&broken, &FieldMapping::default()),
            Err(ReconError::Parse(_))
        ));
        assert!(matches!(
            NmapXmlParser.parse("not xml at all", &FieldMapping::default()),
            Err(ReconError::Parse(_))
        ));
    }

    #[test]
    fn empty_scan_is_not_an_error() {
        let xml = r#"<nmaprun scanner="nmap"><runstats><finished time="3"/></runstats></nmaprun>"#;
        let mapping = FieldMapping::default();
        let records = NmapXmlParser.parse(xml, &mapping).unwrap();
        assert_eq!(records.count(), 0);
    }
}
