use crate::document::Document;
use crate::error::StoreError;
use crate::filter::field_equals;
use serde_json::{Map, Value};
use serde_json_path::JsonPath;

/// Which documents a watch is interested in.
#[derive(Debug)]
pub enum WatchFilter {
    All,
    /// Every field must hold the given value. `{"$exists": bool}` tests presence.
    Match(Map<String, Value>),
    /// JSONPath expressions evaluated against `[document]`; any selected node is a match.
    Paths(Vec<JsonPath>),
}

impl WatchFilter {
    /// `null` or `{}` watch everything, an object is an exact match, a
    /// string or list of strings are JSONPath expressions.
    pub fn parse(spec: &Value) -> Result<Self, StoreError> {
        match spec {
            Value::Null => Ok(WatchFilter::All),
            Value::Object(map) if map.is_empty() => Ok(WatchFilter::All),
            Value::Object(map) => Ok(WatchFilter::Match(map.clone())),
            Value::String(path) => Ok(WatchFilter::Paths(vec![parse_path(path)?])),
            Value::Array(items) if !items.is_empty() => {
                let mut paths = Vec::with_capacity(items.len());
                for item in items {
                    let path = item
                        .as_str()
                        .ok_or_else(|| StoreError::invalid(format!("watch path {item} is not a string")))?;
                    paths.push(parse_path(path)?);
                }
                Ok(WatchFilter::Paths(paths))
            }
            other => Err(StoreError::invalid(format!("unsupported watch filter {other}"))),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            WatchFilter::All => true,
            WatchFilter::Match(fields) => fields.iter().all(|(field, expected)| {
                match expected.get("$exists").and_then(Value::as_bool) {
                    Some(present) => doc.values_at(field).is_empty() != present,
                    None => field_equals(doc, field, expected),
                }
            }),
            WatchFilter::Paths(paths) => {
                let root = Value::Array(vec![Value::Object(doc.as_map().clone())]);
                paths.iter().any(|p| !p.query(&root).is_empty())
            }
        }
    }
}

fn parse_path(path: &str) -> Result<JsonPath, StoreError> {
    JsonPath::parse(path).map_err(|e| StoreError::invalid(format!("watch path {path}: {e}")))
}

#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub collection: String,
    pub filter: WatchFilter,
}
