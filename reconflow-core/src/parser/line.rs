use serde_json::Value;
use tracing::warn;

use super::{OutputParser, Record, Records};
use crate::{
    catalog::{FieldMapping, ParserKind},
    error::Result,
};

/// One non-blank line becomes one record under the mapping's `self` field.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineParser;

impl OutputParser for LineParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Line
    }

    fn parse<'a>(&self, raw: &'a str, mapping: &'a FieldMapping) -> Result<Records<'a>> {
        let Some(field) = mapping.self_target() else {
            warn!(
                target: "scan::parser",
                "line parser mapping has no field sourced from `self`; output ignored"
            );
            return Ok(Box::new(std::iter::empty()));
        };

        Ok(Box::new(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(move |line| {
                    let mut record = Record::new();
                    record.insert(field.to_owned(), Value::String(line.to_owned()));
                    record
                }),
        ))
    }
}
