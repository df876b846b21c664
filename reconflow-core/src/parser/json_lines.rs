use serde_json::{Map, Value};
use tracing::warn;

use super::{OutputParser, Record, Records};
use crate::{
    catalog::{FieldMapping, FieldSource, ParserKind},
    error::Result,
};

/// One JSON object per line, projected through the field mapping.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLinesParser;

impl OutputParser for JsonLinesParser {
    fn kind(&self) -> ParserKind {
        ParserKind::JsonLines
    }

    fn parse<'a>(&self, raw: &'a str, mapping: &'a FieldMapping) -> Result<Records<'a>> {
        Ok(Box::new(raw.lines().enumerate().filter_map(move |(idx, line)| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let object = match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(object)) => object,
                Ok(_) => {
                    warn!(
                        target: "scan::parser",
                        line = idx + 1,
                        "skipping JSON line that is not an object"
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        target: "scan::parser",
                        line = idx + 1,
                        error = %e,
                        "skipping malformed JSON line"
                    );
                    return None;
                }
            };

            let record = project(&object, mapping);
            (!record.is_empty()).then_some(record)
        })))
    }
}

fn project(object: &Map<String, Value>, mapping: &FieldMapping) -> Record {
    let mut record = Record::new();
    for (field, source) in mapping.iter() {
        match source {
            FieldSource::SelfValue => {
                record.insert(field.to_owned(), Value::Object(object.clone()));
            }
            FieldSource::Path(path) => {
                if let Some(value) = lookup(object, path)
                    && !value.is_null()
                {
                    record.insert(field.to_owned(), value.clone());
                }
            }
        }
    }
    record
}

/// Descend a dotted path; any non-object intermediate ends the walk.
fn lookup<'v>(object: &'v Map<String, Value>, path: &[String]) -> Option<&'v Value> {
    let (first, rest) = path.split_first()?;
    let mut current = object.get(first)?;
    for key in rest {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}
