//! Field-by-field reconciliation of a caller's replacement document
//! against the stored original.

use crate::auth::Subject;
use crate::authz;
use crate::config::StoreConfig;
use crate::document::{fields, Document};
use serde_json::Value;

/// Fields that change on every write and never count as content.
const VOLATILE: [&str; 4] = [
    fields::MODIFIED,
    fields::MODIFIED_BY,
    fields::MODIFIED_BY_ID,
    fields::VERSION,
];

const CREATED: [&str; 3] = [fields::CREATED, fields::CREATED_BY, fields::CREATED_BY_ID];

pub(crate) fn stamp_created(doc: &mut Document, actor: &Subject, now: &str) {
    doc.insert(fields::CREATED.to_string(), Value::String(now.to_string()));
    doc.insert(fields::CREATED_BY.to_string(), Value::String(actor.name.clone()));
    doc.insert(fields::CREATED_BY_ID.to_string(), Value::String(actor.id.clone()));
}

pub(crate) fn stamp_modified(doc: &mut Document, actor: &Subject, now: &str) {
    doc.insert(fields::MODIFIED.to_string(), Value::String(now.to_string()));
    doc.insert(fields::MODIFIED_BY.to_string(), Value::String(actor.name.clone()));
    doc.insert(fields::MODIFIED_BY_ID.to_string(), Value::String(actor.id.clone()));
}

/// Turn `next` into the document that replaces `original`.
///
/// * `_id`, `_version` and the creation audit fields always come from the original.
/// * A reserved (`_`-prefixed) field absent from `next` keeps its original
///   value; a reserved field set to `null` is deleted.
/// * In the subject collection, protected fields are restored for
///   non-administrators and the type of a user or role document cannot change.
pub(crate) fn reconcile_replace(
    next: &mut Document,
    original: &Document,
    actor: &Subject,
    config: &StoreConfig,
    collection: &str,
    now: &str,
) {
    if let Some(id) = original.get(fields::ID) {
        next.insert(fields::ID.to_string(), id.clone());
    }
    next.set_version(original.version());
    for key in CREATED {
        match original.get(key) {
            Some(v) => next.insert(key.to_string(), v.clone()),
            None => next.remove(key),
        };
    }

    for (key, value) in original.iter() {
        if key.starts_with(fields::RESERVED_PREFIX) && !next.contains_key(key) {
            next.insert(key.clone(), value.clone());
        }
    }
    next.retain(|key, value| !(key.starts_with(fields::RESERVED_PREFIX) && value.is_null()));

    stamp_modified(next, actor, now);

    if collection == config.subject_collection {
        authz::restore_protected_fields(next, original, actor, config);
        if let Some(kind @ ("user" | "role")) = original.doc_type() {
            next.insert(fields::TYPE.to_string(), Value::String(kind.to_string()));
        }
    }
}

/// True when `next` differs from `original` only in volatile fields.
pub(crate) fn unchanged(original: &Document, next: &Document) -> bool {
    original.without(&VOLATILE) == next.without(&VOLATILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn original() -> Document {
        doc(json!({
            "_id": "d1",
            "_type": "widget",
            "_version": 3,
            "_created": "2024-01-01T00:00:00Z",
            "_createdby": "alice",
            "_createdbyid": "alice",
            "_encrypt": ["secret"],
            "_note": "keep",
            "name": "A",
            "color": "red"
        }))
    }

    #[test]
    fn reserved_fields_follow_omission_and_null_rules() {
        let actor = Subject::new("bob", "bob");
        let mut next = doc(json!({
            "_id": "other",
            "_version": 99,
            "_created": "forged",
            "_note": null,
            "name": "B"
        }));
        reconcile_replace(&mut next, &original(), &actor, &StoreConfig::default(), "entities", "now");
        assert_eq!(next.id(), Some("d1"));
        assert_eq!(next.version(), 3);
        assert_eq!(next.str_field("_created"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(next.str_field("_modifiedby"), Some("bob"));
        assert_eq!(next.doc_type(), Some("widget"));
        assert_eq!(next.get("_encrypt"), Some(&json!(["secret"])));
        assert!(next.get("_note").is_none());
        assert!(next.get("color").is_none(), "plain fields are replaced wholesale");
    }

    #[test]
    fn subject_types_are_pinned() {
        let config = StoreConfig::default();
        let stored = doc(json!({"_id": "u1", "_type": "user", "username": "alice"}));
        let mut next = doc(json!({"_type": "role", "username": "root"}));
        reconcile_replace(&mut next, &stored, &Subject::new("u1", "alice"), &config, "users", "now");
        assert_eq!(next.doc_type(), Some("user"));
        assert_eq!(next.str_field("username"), Some("alice"));
    }

    #[test]
    fn protected_names_are_plain_fields_elsewhere() {
        let config = StoreConfig::default();
        let stored = doc(json!({"_id": "w1", "_type": "widget", "username": "old", "dbusage": 3}));
        let mut next = doc(json!({"_type": "widget", "username": "new"}));
        reconcile_replace(&mut next, &stored, &Subject::new("bob", "bob"), &config, "entities", "now");
        assert_eq!(next.str_field("username"), Some("new"));
        assert!(next.get("dbusage").is_none());
    }

    #[test]
    fn volatile_fields_do_not_count_as_changes() {
        let a = original();
        let mut b = a.clone();
        stamp_modified(&mut b, &Subject::new("x", "x"), "later");
        b.set_version(4);
        assert!(unchanged(&a, &b));
        b.insert("color".into(), json!("blue"));
        assert!(!unchanged(&a, &b));
    }
}
