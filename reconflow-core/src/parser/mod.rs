//! Output parsers: turn raw tool output into flat key/value records.
//!
//! Every parser is a pull-based iterator over the captured stdout, so a
//! caller archives and processes one record before the next one is produced.
//! Line and JSON-Lines parsing skip bad input line by line; XML parsing is
//! all-or-nothing and reports a malformed document as an error.

mod json_lines;
mod line;
mod nmap_xml;

pub use json_lines::JsonLinesParser;
pub use line::LineParser;
pub use nmap_xml::NmapXmlParser;

use std::fmt;

use serde_json::{Map, Value};

use crate::{
    catalog::{FieldMapping, ParserKind},
    error::Result,
};

/// One normalized record. Absent fields are omitted, never `null`.
pub type Record = Map<String, Value>;

/// Lazy record sequence borrowed from the raw output.
pub type Records<'a> = Box<dyn Iterator<Item = Record> + Send + 'a>;

pub trait OutputParser: Send + Sync + fmt::Debug {
    fn kind(&self) -> ParserKind;

    /// Fails only when the output as a whole cannot be interpreted.
    fn parse<'a>(&self, raw: &'a str, mapping: &'a FieldMapping) -> Result<Records<'a>>;
}

static LINE: LineParser = LineParser;
static JSON_LINES: JsonLinesParser = JsonLinesParser;
static NMAP_XML: NmapXmlParser = NmapXmlParser;

/// Parser registered for a kind.
pub fn parser_for(kind: ParserKind) -> &'static dyn OutputParser {
    match kind {
        ParserKind::Line => &LINE,
        ParserKind::JsonLines => &JSON_LINES,
        ParserKind::NmapXml => &NMAP_XML,
    }
}
