//! Version history kept in `<collection>_hist`.
//!
//! Every record is keyed by the document id (`id`) and `_version` and holds
//! one or more of:
//! * `item`: the full persisted document at that version (a baseline),
//! * `delta`: a JSON patch from the previous version,
//! * `update`: the operator update that produced the version.
//!
//! Version 0 and every `delta_count`-th version carry an `item`, so
//! reconstruction needs one baseline read and fewer than `delta_count`
//! replay steps.

use crate::auth::Subject;
use crate::db::{Database, DbError, FindOptions};
use crate::document::{fields, Document};
use crate::filter::{Filter, SortOrder, UpdateSpec};
use chrono::Utc;
use json_patch::Patch;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

const DOC_ID: &str = "id";
const ITEM: &str = "item";
const DELTA: &str = "delta";
const UPDATE: &str = "update";

pub fn history_collection(collection: &str) -> String {
    format!("{collection}_hist")
}

pub fn is_history_collection(collection: &str) -> bool {
    collection.ends_with("_hist")
}

pub(crate) struct History {
    db: Arc<dyn Database>,
    delta_count: u64,
}

impl History {
    pub(crate) fn new(db: Arc<dyn Database>, delta_count: u64) -> Self {
        Self {
            db,
            delta_count: delta_count.max(1),
        }
    }

    fn is_baseline(&self, version: u64) -> bool {
        version % self.delta_count == 0
    }

    fn record(&self, source: &Document, actor: &Subject) -> Document {
        let mut rec = Document::new();
        rec.set_id(Uuid::new_v4().simple().to_string());
        rec.insert(
            DOC_ID.to_string(),
            Value::String(source.id().unwrap_or_default().to_string()),
        );
        rec.set_version(source.version());
        for key in [fields::TYPE, fields::ACL] {
            if let Some(v) = source.get(key) {
                rec.insert(key.to_string(), v.clone());
            }
        }
        rec.insert(fields::CREATED.to_string(), Value::String(Utc::now().to_rfc3339()));
        rec.insert(fields::CREATED_BY.to_string(), Value::String(actor.name.clone()));
        rec.insert(fields::CREATED_BY_ID.to_string(), Value::String(actor.id.clone()));
        rec
    }

    async fn write(&self, collection: &str, rec: Document) -> Result<(), DbError> {
        self.db
            .insert_one(&history_collection(collection), rec)
            .await
            .map(|_| ())
    }

    pub(crate) async fn baseline(&self, collection: &str, doc: &Document, actor: &Subject) -> Result<(), DbError> {
        let mut rec = self.record(doc, actor);
        rec.insert(ITEM.to_string(), doc.clone().into_value());
        self.write(collection, rec).await
    }

    /// Returns false when the two versions do not differ.
    pub(crate) async fn delta(
        &self,
        collection: &str,
        before: &Document,
        after: &Document,
        actor: &Subject,
    ) -> Result<bool, DbError> {
        let patch = json_patch::diff(&before.clone().into_value(), &after.clone().into_value());
        if patch.0.is_empty() {
            return Ok(false);
        }
        let mut rec = self.record(after, actor);
        let delta = serde_json::to_value(&patch).map_err(|e| DbError::Backend(e.to_string()))?;
        rec.insert(DELTA.to_string(), delta);
        if self.is_baseline(after.version()) {
            rec.insert(ITEM.to_string(), after.clone().into_value());
        }
        self.write(collection, rec).await?;
        Ok(true)
    }

    pub(crate) async fn operation(
        &self,
        collection: &str,
        after: &Document,
        update: &UpdateSpec,
        actor: &Subject,
    ) -> Result<(), DbError> {
        let mut rec = self.record(after, actor);
        let update = serde_json::to_value(update).map_err(|e| DbError::Backend(e.to_string()))?;
        rec.insert(UPDATE.to_string(), update);
        if self.is_baseline(after.version()) {
            rec.insert(ITEM.to_string(), after.clone().into_value());
        }
        self.write(collection, rec).await
    }

    pub(crate) async fn deletion(&self, collection: &str, doc: &Document, actor: &Subject) -> Result<(), DbError> {
        let mut rec = self.record(doc, actor);
        rec.insert(ITEM.to_string(), doc.clone().into_value());
        rec.insert(fields::DELETED.to_string(), Value::String(Utc::now().to_rfc3339()));
        rec.insert(fields::DELETED_BY.to_string(), Value::String(actor.name.clone()));
        rec.insert(fields::DELETED_BY_ID.to_string(), Value::String(actor.id.clone()));
        self.write(collection, rec).await
    }

    pub(crate) async fn latest_version(&self, collection: &str, id: &str) -> Result<Option<u64>, DbError> {
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::sorted(fields::VERSION, SortOrder::Descending)
        };
        let found = self
            .db
            .find(&history_collection(collection), &Filter::eq(DOC_ID, id), &options)
            .await?;
        Ok(found.first().map(Document::version))
    }

    /// Rebuild the persisted form of `id` at `version`. `None` when no
    /// baseline precedes it or the replay chain has a gap.
    pub(crate) async fn reconstruct(
        &self,
        collection: &str,
        id: &str,
        version: u64,
    ) -> Result<Option<Document>, DbError> {
        let hist = history_collection(collection);
        let base_filter = Filter::and([
            Filter::eq(DOC_ID, id),
            Filter::Lte(fields::VERSION.to_string(), Value::from(version)),
            Filter::Exists(ITEM.to_string(), true),
        ]);
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::sorted(fields::VERSION, SortOrder::Descending)
        };
        let Some(base) = self.db.find(&hist, &base_filter, &options).await?.pop() else {
            return Ok(None);
        };
        let base_version = base.version();
        let Some(mut current) = base.get(ITEM).cloned() else {
            return Ok(None);
        };

        let steps_filter = Filter::and([
            Filter::eq(DOC_ID, id),
            Filter::Gt(fields::VERSION.to_string(), Value::from(base_version)),
            Filter::Lte(fields::VERSION.to_string(), Value::from(version)),
        ]);
        let options = FindOptions::sorted(fields::VERSION, SortOrder::Ascending);
        let steps = self.db.find(&hist, &steps_filter, &options).await?;

        let mut reached = base_version;
        for step in steps {
            let v = step.version();
            if v == reached {
                continue;
            }
            if v != reached + 1 {
                tracing::warn!(collection, id, missing = reached + 1, "history gap");
                return Ok(None);
            }
            if !replay(&mut current, &step) {
                tracing::warn!(collection, id, version = v, "history record does not apply");
                return Ok(None);
            }
            reached = v;
        }
        if reached != version {
            return Ok(None);
        }
        Ok(Document::from_value(current))
    }
}

fn replay(current: &mut Value, step: &Document) -> bool {
    if let Some(delta) = step.get(DELTA) {
        let Ok(patch) = serde_json::from_value::<Patch>(delta.clone()) else {
            return false;
        };
        return json_patch::patch(current, &patch.0).is_ok();
    }
    if let Some(update) = step.get(UPDATE) {
        let (Ok(spec), Some(mut doc)) = (
            UpdateSpec::from_value(update),
            Document::from_value(current.clone()),
        ) else {
            return false;
        };
        if spec.apply(&mut doc).is_err() {
            return false;
        }
        *current = doc.into_value();
        return true;
    }
    if let Some(item) = step.get(ITEM) {
        *current = item.clone();
        return true;
    }
    false
}
