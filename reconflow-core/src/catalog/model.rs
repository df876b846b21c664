use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ReconError;

/// Output format a scan tool produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParserKind {
    #[serde(rename = "line_parser")]
    Line,
    #[serde(rename = "json_lines")]
    JsonLines,
    #[serde(rename = "nmap_xml")]
    NmapXml,
}

impl ParserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKind::Line => "line_parser",
            ParserKind::JsonLines => "json_lines",
            ParserKind::NmapXml => "nmap_xml",
        }
    }
}

impl FromStr for ParserKind {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "line_parser" => Ok(ParserKind::Line),
            "json_lines" => Ok(ParserKind::JsonLines),
            "nmap_xml" => Ok(ParserKind::NmapXml),
            other => Err(ReconError::Config(format!(
                "unknown output_parser_type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which record processor merges a step's output into the asset graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Subdomain,
    Portscan,
    Http,
    Vulnerability,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Subdomain => "subdomain",
            AgentKind::Portscan => "portscan",
            AgentKind::Http => "http",
            AgentKind::Vulnerability => "vulnerability",
        }
    }
}

impl FromStr for AgentKind {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subdomain" => Ok(AgentKind::Subdomain),
            "portscan" => Ok(AgentKind::Portscan),
            "http" => Ok(AgentKind::Http),
            "vulnerability" => Ok(AgentKind::Vulnerability),
            other => {
                Err(ReconError::Config(format!("unknown agent_type '{other}'")))
            }
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a step takes its input from.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    /// The asset name is substituted into the command template.
    #[default]
    Root,
    /// Hostnames already discovered for the asset are piped on stdin.
    Subdomains,
}

impl FromStr for TargetSource {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(TargetSource::Root),
            "subdomains" => Ok(TargetSource::Subdomains),
            other => Err(ReconError::Config(format!(
                "unknown target_source '{other}'"
            ))),
        }
    }
}

/// Source of one output field: the whole input item, or a dotted path into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldSource {
    SelfValue,
    Path(Vec<String>),
}

impl FieldSource {
    pub fn parse(raw: &str) -> Self {
        if raw == "self" {
            FieldSource::SelfValue
        } else {
            FieldSource::Path(raw.split('.').map(str::to_owned).collect())
        }
    }
}

/// Declarative mapping from output field name to [`FieldSource`], ordered by
/// field name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMapping {
    fields: Vec<(String, FieldSource)>,
}

impl FieldMapping {
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let sorted: BTreeMap<String, FieldSource> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), FieldSource::parse(v.as_ref())))
            .collect();
        Self {
            fields: sorted.into_iter().collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSource)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// First field (by name) whose source is `self`.
    pub fn self_target(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, source)| *source == FieldSource::SelfValue)
            .map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// A named step definition.
#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub name: String,
    pub description: Option<String>,
    /// Shell command; `{target}` is replaced with the quoted asset name.
    pub command_template: String,
    pub parser: ParserKind,
    pub mapping: FieldMapping,
    pub agent: AgentKind,
    pub target_source: TargetSource,
}

/// A named, ordered chain of step names.
#[derive(Clone, Debug, Serialize)]
pub struct ScanStrategy {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<String>,
}
