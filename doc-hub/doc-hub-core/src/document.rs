//! JSON document wrapper and the reserved system field names.

use crate::acl::Ace;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::{Deref, DerefMut};

pub mod fields {
    pub const ID: &str = "_id";
    pub const TYPE: &str = "_type";
    pub const ACL: &str = "_acl";
    pub const VERSION: &str = "_version";
    pub const CREATED: &str = "_created";
    pub const CREATED_BY: &str = "_createdby";
    pub const CREATED_BY_ID: &str = "_createdbyid";
    pub const MODIFIED: &str = "_modified";
    pub const MODIFIED_BY: &str = "_modifiedby";
    pub const MODIFIED_BY_ID: &str = "_modifiedbyid";
    pub const ENCRYPT: &str = "_encrypt";
    pub const SEARCH_NAME: &str = "_searchname";
    pub const SEARCH_NAMES: &str = "_searchnames";
    pub const DELETED: &str = "_deleted";
    pub const DELETED_BY: &str = "_deletedby";
    pub const DELETED_BY_ID: &str = "_deletedbyid";
    pub const HEARTBEAT: &str = "_heartbeat";

    /// Prefix shared by every system-managed field.
    pub const RESERVED_PREFIX: char = '_';
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// `None` unless `value` is a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(fields::ID).and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(fields::ID.to_string(), Value::String(id.into()));
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.0.get(fields::TYPE).and_then(Value::as_str)
    }

    /// Missing or malformed versions read as 0.
    pub fn version(&self) -> u64 {
        self.0
            .get(fields::VERSION)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn set_version(&mut self, version: u64) {
        self.0.insert(fields::VERSION.to_string(), Value::from(version));
    }

    /// Entries that fail to parse are skipped.
    pub fn acl(&self) -> Vec<Ace> {
        match self.0.get(fields::ACL) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_acl(&mut self, acl: &[Ace]) {
        let items = acl
            .iter()
            .filter_map(|ace| serde_json::to_value(ace).ok())
            .collect();
        self.0.insert(fields::ACL.to_string(), Value::Array(items));
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn encrypted_fields(&self) -> Vec<String> {
        match self.0.get(fields::ENCRYPT) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every value reachable at a dotted path. Arrays along the way are
    /// expanded, so `members._id` yields the id of every member.
    pub fn values_at(&self, path: &str) -> Vec<&Value> {
        let mut current: Vec<&Value> = Vec::new();
        let mut segments = path.split('.');
        let Some(first) = segments.next() else {
            return current;
        };
        if let Some(v) = self.0.get(first) {
            current.push(v);
        }
        for segment in segments {
            let mut next = Vec::new();
            for value in current {
                step(value, segment, &mut next);
            }
            current = next;
        }
        current
    }

    pub fn first_at(&self, path: &str) -> Option<&Value> {
        self.values_at(path).into_iter().next()
    }

    /// Serialized size in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }

    /// Copy without the listed keys.
    pub fn without(&self, keys: &[&str]) -> Document {
        let mut out = self.clone();
        for key in keys {
            out.0.remove(*key);
        }
        out
    }
}

fn step<'a>(value: &'a Value, segment: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(segment) {
                out.push(v);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(v) = items.get(index) {
                    out.push(v);
                }
                return;
            }
            for item in items {
                step(item, segment, out);
            }
        }
        _ => {}
    }
}

impl Deref for Document {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Document {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn dotted_paths_expand_arrays() {
        let d = doc(json!({
            "members": [{"_id": "a"}, {"_id": "b"}],
            "nested": {"inner": {"x": 1}},
            "list": [10, 20]
        }));
        let ids: Vec<_> = d.values_at("members._id").into_iter().cloned().collect();
        assert_eq!(ids, vec![json!("a"), json!("b")]);
        assert_eq!(d.first_at("nested.inner.x"), Some(&json!(1)));
        assert_eq!(d.first_at("list.1"), Some(&json!(20)));
        assert!(d.values_at("missing.path").is_empty());
    }

    #[test]
    fn version_defaults_to_zero() {
        let mut d = doc(json!({"_id": "x"}));
        assert_eq!(d.version(), 0);
        d.set_version(4);
        assert_eq!(d.version(), 4);
        assert_eq!(d.id(), Some("x"));
        assert!(Document::from_value(json!([1])).is_none());
    }
}
