//! Query filters, operator updates and aggregation stages understood by
//! the database seam, plus their parsers from the JSON query syntax
//! clients send (`{"name": "a", "_version": {"$gt": 2}}`).

use crate::acl::Rights;
use crate::document::{fields, Document};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid query: {0}")]
pub struct FilterError(pub String);

type Result<T> = std::result::Result<T, FilterError>;

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Exists(String, bool),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    /// Some non-deny ACE for one of `subjects` carries every bit in `bits`.
    AclGrants { subjects: Vec<String>, bits: Rights },
    /// Some deny ACE for one of `subjects` carries any bit in `bits`.
    AclDenies { subjects: Vec<String>, bits: Rights },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn id(id: impl Into<String>) -> Self {
        Filter::Eq(fields::ID.to_string(), Value::String(id.into()))
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut parts = Vec::new();
        for f in filters {
            match f {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => field_equals(doc, field, value),
            Filter::Ne(field, value) => !field_equals(doc, field, value),
            Filter::In(field, values) => values.iter().any(|v| field_equals(doc, field, v)),
            Filter::Exists(field, present) => doc.values_at(field).is_empty() != *present,
            Filter::Gt(field, value) => compare_any(doc, field, value, |o| o == Ordering::Greater),
            Filter::Gte(field, value) => compare_any(doc, field, value, |o| o != Ordering::Less),
            Filter::Lt(field, value) => compare_any(doc, field, value, |o| o == Ordering::Less),
            Filter::Lte(field, value) => compare_any(doc, field, value, |o| o != Ordering::Greater),
            Filter::AclGrants { subjects, bits } => acl_entries(doc)
                .any(|(id, deny, rights)| !deny && subjects.iter().any(|s| s == id) && rights.contains_all(*bits)),
            Filter::AclDenies { subjects, bits } => acl_entries(doc)
                .any(|(id, deny, rights)| deny && subjects.iter().any(|s| s == id) && rights.intersects(*bits)),
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
        }
    }

    /// Parse the JSON query syntax. `null` and `{}` select everything.
    pub fn from_query(query: &Value) -> Result<Self> {
        match query {
            Value::Null => Ok(Filter::All),
            Value::Object(map) => parse_object(map),
            other => Err(FilterError(format!("expected an object, got {other}"))),
        }
    }
}

fn parse_object(map: &Map<String, Value>) -> Result<Filter> {
    let mut parts = Vec::new();
    for (key, value) in map {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| FilterError(format!("{key} expects an array")))?;
                let inner = items
                    .iter()
                    .map(Filter::from_query)
                    .collect::<Result<Vec<_>>>()?;
                parts.push(match key.as_str() {
                    "$and" => Filter::And(inner),
                    "$or" => Filter::Or(inner),
                    _ => Filter::Or(inner).negate(),
                });
            }
            k if k.starts_with('$') => {
                return Err(FilterError(format!("unsupported operator {k}")));
            }
            field => parts.push(parse_field(field, value)?),
        }
    }
    Ok(Filter::and(parts))
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn parse_field(field: &str, value: &Value) -> Result<Filter> {
    if !is_operator_object(value) {
        return Ok(Filter::Eq(field.to_string(), value.clone()));
    }
    let Value::Object(ops) = value else {
        return Ok(Filter::Eq(field.to_string(), value.clone()));
    };
    let mut parts = Vec::new();
    for (op, arg) in ops {
        let f = field.to_string();
        parts.push(match op.as_str() {
            "$eq" => Filter::Eq(f, arg.clone()),
            "$ne" => Filter::Ne(f, arg.clone()),
            "$gt" => Filter::Gt(f, arg.clone()),
            "$gte" => Filter::Gte(f, arg.clone()),
            "$lt" => Filter::Lt(f, arg.clone()),
            "$lte" => Filter::Lte(f, arg.clone()),
            "$exists" => Filter::Exists(f, truthy(arg)),
            "$in" | "$nin" => {
                let values = arg
                    .as_array()
                    .ok_or_else(|| FilterError(format!("{op} expects an array")))?
                    .clone();
                if op == "$in" {
                    Filter::In(f, values)
                } else {
                    Filter::In(f, values).negate()
                }
            }
            "$not" => parse_field(field, arg)?.negate(),
            other => return Err(FilterError(format!("unsupported operator {other}"))),
        });
    }
    Ok(Filter::and(parts))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

/// Equality as the query language sees it: array fields match any member.
pub(crate) fn field_equals(doc: &Document, field: &str, expected: &Value) -> bool {
    let values = doc.values_at(field);
    if expected.is_null() && values.is_empty() {
        return true;
    }
    values.iter().any(|v| {
        json_equals(v, expected)
            || matches!(v, Value::Array(items) if items.iter().any(|i| json_equals(i, expected)))
    })
}

/// Numbers compare by value so `1` equals `1.0`.
fn json_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_any(doc: &Document, field: &str, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    doc.values_at(field)
        .iter()
        .any(|v| comparable(v, bound).map(&accept).unwrap_or(false))
}

/// Ordering between values of the same kind; `None` across kinds.
fn comparable(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn acl_entries(doc: &Document) -> impl Iterator<Item = (&str, bool, Rights)> {
    doc.get(fields::ACL)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|ace| {
            let id = ace.get(fields::ID)?.as_str()?;
            let deny = ace.get("deny").and_then(Value::as_bool).unwrap_or(false);
            let bits = ace.get("rights")?.as_u64()?;
            Some((id, deny, Rights::from_bits(u32::try_from(bits).ok()?)))
        })
}

/// Field operators applied by `update_one`/`update_many`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateSpec {
    #[serde(rename = "$set", default, skip_serializing_if = "Map::is_empty")]
    pub set: Map<String, Value>,
    #[serde(rename = "$inc", default, skip_serializing_if = "Map::is_empty")]
    pub inc: Map<String, Value>,
    #[serde(rename = "$mul", default, skip_serializing_if = "Map::is_empty")]
    pub mul: Map<String, Value>,
    #[serde(rename = "$unset", default, skip_serializing_if = "Map::is_empty")]
    pub unset: Map<String, Value>,
}

impl UpdateSpec {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| FilterError(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty() && self.mul.is_empty() && self.unset.is_empty()
    }

    pub fn touched_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for key in self
            .set
            .keys()
            .chain(self.inc.keys())
            .chain(self.mul.keys())
            .chain(self.unset.keys())
        {
            if !out.contains(key) {
                out.push(key.clone());
            }
        }
        out
    }

    /// True when any operator writes `field` or something below it.
    pub fn touches(&self, field: &str) -> bool {
        self.touched_fields().iter().any(|p| covers(field, p))
    }

    /// Remove every operator entry that writes `field` or below it.
    pub fn strip(&mut self, field: &str) {
        for map in [&mut self.set, &mut self.inc, &mut self.mul, &mut self.unset] {
            map.retain(|path, _| !covers(field, path));
        }
    }

    pub fn apply(&self, doc: &mut Document) -> Result<()> {
        for (path, value) in &self.set {
            set_path(doc, path, value.clone())?;
        }
        for (path, by) in &self.inc {
            let next = arithmetic(doc.first_at(path), by, Arith::Add)?;
            set_path(doc, path, next)?;
        }
        for (path, by) in &self.mul {
            let next = arithmetic(doc.first_at(path), by, Arith::Mul)?;
            set_path(doc, path, next)?;
        }
        for path in self.unset.keys() {
            unset_path(doc, path);
        }
        Ok(())
    }
}

fn covers(field: &str, path: &str) -> bool {
    path == field || path.starts_with(&format!("{field}."))
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Mul,
}

fn arithmetic(current: Option<&Value>, by: &Value, op: Arith) -> Result<Value> {
    let Value::Number(by) = by else {
        return Err(FilterError(format!("operand {by} is not a number")));
    };
    let current = match current {
        None | Some(Value::Null) => match op {
            Arith::Add => return Ok(Value::Number(by.clone())),
            Arith::Mul => return Ok(Value::from(0)),
        },
        Some(Value::Number(n)) => n,
        Some(other) => return Err(FilterError(format!("cannot do arithmetic on {other}"))),
    };
    if let (Some(a), Some(b)) = (current.as_i64(), by.as_i64()) {
        let exact = match op {
            Arith::Add => a.checked_add(b),
            Arith::Mul => a.checked_mul(b),
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }
    let (a, b) = (
        current.as_f64().unwrap_or_default(),
        by.as_f64().unwrap_or_default(),
    );
    let result = match op {
        Arith::Add => a + b,
        Arith::Mul => a * b,
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| FilterError("arithmetic result is not finite".to_string()))
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return Ok(());
    };
    let mut map: &mut Map<String, Value> = doc;
    for segment in segments {
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        map = entry
            .as_object_mut()
            .ok_or_else(|| FilterError(format!("{path}: {segment} is not an object")))?;
    }
    map.insert(last.to_string(), value);
    Ok(())
}

fn unset_path(doc: &mut Document, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut map: &mut Map<String, Value> = doc;
    for segment in segments {
        match map.get_mut(segment).and_then(Value::as_object_mut) {
            Some(inner) => map = inner,
            None => return,
        }
    }
    map.remove(last);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

pub fn parse_sort(value: &Value) -> Result<Vec<(String, SortOrder)>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let order = match v.as_i64() {
                    Some(1) => SortOrder::Ascending,
                    Some(-1) => SortOrder::Descending,
                    _ => return Err(FilterError(format!("sort {k}: expected 1 or -1"))),
                };
                Ok((k.clone(), order))
            })
            .collect(),
        other => Err(FilterError(format!("sort expects an object, got {other}"))),
    }
}

pub fn sort_documents(docs: &mut [Document], keys: &[(String, SortOrder)]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, order) in keys {
            let ord = sort_cmp(a.first_at(field), b.first_at(field));
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => comparable(x, y).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b))),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Keep `_id` plus the top-level fields named in `keep`.
pub fn project(doc: &Document, keep: &[String]) -> Document {
    if keep.is_empty() {
        return doc.clone();
    }
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        let wanted = key == fields::ID
            || keep
                .iter()
                .any(|k| k == key || k.split('.').next() == Some(key.as_str()));
        if wanted {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<(String, SortOrder)>),
    Skip(usize),
    Limit(usize),
    Project(Vec<String>),
}

pub fn parse_pipeline(value: &Value) -> Result<Vec<Stage>> {
    let stages = value
        .as_array()
        .ok_or_else(|| FilterError("pipeline must be an array".to_string()))?;
    stages.iter().map(parse_stage).collect()
}

fn parse_stage(value: &Value) -> Result<Stage> {
    let map = value
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| FilterError(format!("stage must have exactly one operator: {value}")))?;
    let (op, arg) = map
        .iter()
        .next()
        .ok_or_else(|| FilterError("empty stage".to_string()))?;
    let count = || {
        arg.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| FilterError(format!("{op} expects a non-negative integer")))
    };
    match op.as_str() {
        "$match" => Ok(Stage::Match(Filter::from_query(arg)?)),
        "$sort" => Ok(Stage::Sort(parse_sort(arg)?)),
        "$skip" => Ok(Stage::Skip(count()?)),
        "$limit" => Ok(Stage::Limit(count()?)),
        "$project" => {
            let keep = arg
                .as_object()
                .ok_or_else(|| FilterError("$project expects an object".to_string()))?
                .iter()
                .filter(|(_, v)| truthy(v))
                .map(|(k, _)| k.clone())
                .collect();
            Ok(Stage::Project(keep))
        }
        other => Err(FilterError(format!("unsupported stage {other}"))),
    }
}

pub fn run_pipeline(mut docs: Vec<Document>, stages: &[Stage]) -> Vec<Document> {
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Sort(keys) => {
                sort_documents(&mut docs, keys);
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n).collect(),
            Stage::Project(keep) => docs.iter().map(|d| project(d, keep)).collect(),
        };
    }
    docs
}
