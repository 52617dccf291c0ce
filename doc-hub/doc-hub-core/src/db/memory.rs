use super::{ChangeEvent, ChangeStream, Database, DbError, FindOptions, IndexInfo, OperationType};
use crate::document::{fields, Document};
use crate::events::{ChangeBus, FeedItem};
use crate::filter::{project, run_pipeline, sort_documents, Filter, Stage, UpdateSpec};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

#[derive(Default)]
struct Collection {
    docs: Vec<Document>,
    indexes: Vec<IndexInfo>,
}

impl Collection {
    fn positions(&self, filter: &Filter) -> Vec<usize> {
        self.docs
            .iter()
            .enumerate()
            .filter(|(_, d)| filter.matches(d))
            .map(|(i, _)| i)
            .collect()
    }

    /// Name of the first unique key `doc` would collide on, ignoring the
    /// document at `skip`.
    fn collision(&self, doc: &Document, skip: Option<usize>) -> Option<String> {
        let others = || {
            self.docs
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != skip)
                .map(|(_, d)| d)
        };
        if let Some(id) = doc.get(fields::ID) {
            if others().any(|d| d.get(fields::ID) == Some(id)) {
                return Some(format!("{}={}", fields::ID, id));
            }
        }
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key: Vec<Option<&Value>> = index.keys.iter().map(|k| doc.first_at(k)).collect();
            if key.iter().all(Option::is_none) {
                continue;
            }
            let clash = others().any(|d| {
                index
                    .keys
                    .iter()
                    .map(|k| d.first_at(k))
                    .eq(key.iter().copied())
            });
            if clash {
                return Some(index.name.clone());
            }
        }
        None
    }
}

/// In-process engine: every call runs atomically under one lock and
/// committed writes are published on a [`ChangeBus`].
pub struct MemoryDatabase {
    collections: RwLock<HashMap<String, Collection>>,
    bus: ChangeBus,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_feed_capacity(1024)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            bus: ChangeBus::new(capacity),
        }
    }

    /// Break every open change stream.
    pub fn fault_feed(&self, reason: impl Into<String>) {
        self.bus.fault(reason);
    }

    pub fn feed_subscribers(&self) -> usize {
        self.bus.receiver_count()
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.bus.send(event);
        }
    }

    fn duplicate(collection: &str, key: String) -> DbError {
        DbError::DuplicateKey {
            collection: collection.to_string(),
            key,
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn change(collection: &str, operation: OperationType, doc: &Document) -> ChangeEvent {
    ChangeEvent {
        collection: collection.to_string(),
        operation,
        document_id: doc.id().map(str::to_string),
        full_document: Some(doc.clone()),
        updated_fields: Vec::new(),
    }
}

fn apply_update(doc: &Document, update: &UpdateSpec) -> Result<Document, DbError> {
    if update.touches(fields::ID) {
        return Err(DbError::Backend("the _id field is immutable".to_string()));
    }
    let mut next = doc.clone();
    update.apply(&mut next)?;
    Ok(next)
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, DbError> {
        let mut docs: Vec<Document> = {
            let guard = self.collections.read();
            match guard.get(collection) {
                Some(c) => c.docs.iter().filter(|d| filter.matches(d)).cloned().collect(),
                None => Vec::new(),
            }
        };
        sort_documents(&mut docs, &options.sort);
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(docs
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .map(|d| project(&d, &options.projection))
            .collect())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        let guard = self.collections.read();
        Ok(guard
            .get(collection)
            .map(|c| c.docs.iter().filter(|d| filter.matches(d)).count() as u64)
            .unwrap_or(0))
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, DbError> {
        let guard = self.collections.read();
        let mut out: Vec<Value> = Vec::new();
        let Some(c) = guard.get(collection) else {
            return Ok(out);
        };
        for doc in c.docs.iter().filter(|d| filter.matches(d)) {
            for value in doc.values_at(field) {
                let items = match value {
                    Value::Array(items) => items.iter().collect::<Vec<_>>(),
                    other => vec![other],
                };
                for item in items {
                    if !out.contains(item) {
                        out.push(item.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Document>, DbError> {
        let docs = {
            let guard = self.collections.read();
            guard.get(collection).map(|c| c.docs.clone()).unwrap_or_default()
        };
        Ok(run_pipeline(docs, pipeline))
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<Document, DbError> {
        if doc.id().is_none() {
            doc.set_id(Uuid::new_v4().simple().to_string());
        }
        {
            let mut guard = self.collections.write();
            let c = guard.entry(collection.to_string()).or_default();
            if let Some(key) = c.collision(&doc, None) {
                return Err(Self::duplicate(collection, key));
            }
            c.docs.push(doc.clone());
        }
        self.publish(vec![change(collection, OperationType::Insert, &doc)]);
        Ok(doc)
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        mut doc: Document,
    ) -> Result<u64, DbError> {
        {
            let mut guard = self.collections.write();
            let Some(c) = guard.get_mut(collection) else {
                return Ok(0);
            };
            let Some(pos) = c.positions(filter).first().copied() else {
                return Ok(0);
            };
            if let Some(id) = c.docs[pos].get(fields::ID).cloned() {
                doc.insert(fields::ID.to_string(), id);
            }
            if let Some(key) = c.collision(&doc, Some(pos)) {
                return Err(Self::duplicate(collection, key));
            }
            c.docs[pos] = doc.clone();
        }
        self.publish(vec![change(collection, OperationType::Replace, &doc)]);
        Ok(1)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateSpec,
    ) -> Result<Option<Document>, DbError> {
        let next = {
            let mut guard = self.collections.write();
            let Some(c) = guard.get_mut(collection) else {
                return Ok(None);
            };
            let Some(pos) = c.positions(filter).first().copied() else {
                return Ok(None);
            };
            let next = apply_update(&c.docs[pos], update)?;
            if let Some(key) = c.collision(&next, Some(pos)) {
                return Err(Self::duplicate(collection, key));
            }
            c.docs[pos] = next.clone();
            next
        };
        let mut event = change(collection, OperationType::Update, &next);
        event.updated_fields = update.touched_fields();
        self.publish(vec![event]);
        Ok(Some(next))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateSpec,
    ) -> Result<Vec<Document>, DbError> {
        let updated = {
            let mut guard = self.collections.write();
            let Some(c) = guard.get_mut(collection) else {
                return Ok(Vec::new());
            };
            let positions = c.positions(filter);
            let mut staged = Vec::with_capacity(positions.len());
            for pos in &positions {
                staged.push((*pos, apply_update(&c.docs[*pos], update)?));
            }
            for (pos, next) in &staged {
                if let Some(key) = c.collision(next, Some(*pos)) {
                    return Err(Self::duplicate(collection, key));
                }
            }
            for (pos, next) in &staged {
                c.docs[*pos] = next.clone();
            }
            staged.into_iter().map(|(_, d)| d).collect::<Vec<_>>()
        };
        let touched = update.touched_fields();
        self.publish(
            updated
                .iter()
                .map(|d| {
                    let mut event = change(collection, OperationType::Update, d);
                    event.updated_fields = touched.clone();
                    event
                })
                .collect(),
        );
        Ok(updated)
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, DbError> {
        let removed = {
            let mut guard = self.collections.write();
            let Some(c) = guard.get_mut(collection) else {
                return Ok(None);
            };
            match c.positions(filter).first().copied() {
                Some(pos) => c.docs.remove(pos),
                None => return Ok(None),
            }
        };
        let mut event = change(collection, OperationType::Delete, &removed);
        event.full_document = None;
        self.publish(vec![event]);
        Ok(Some(removed))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        let removed: Vec<Document> = {
            let mut guard = self.collections.write();
            let Some(c) = guard.get_mut(collection) else {
                return Ok(0);
            };
            let (gone, kept): (Vec<Document>, Vec<Document>) =
                std::mem::take(&mut c.docs).into_iter().partition(|d| filter.matches(d));
            c.docs = kept;
            gone
        };
        let count = removed.len() as u64;
        self.publish(
            removed
                .iter()
                .map(|d| {
                    let mut event = change(collection, OperationType::Delete, d);
                    event.full_document = None;
                    event
                })
                .collect(),
        );
        Ok(count)
    }

    async fn watch(&self) -> Result<ChangeStream, DbError> {
        let stream = BroadcastStream::new(self.bus.subscribe()).map(|item| match item {
            Ok(FeedItem::Change(event)) => Ok(event),
            Ok(FeedItem::Fault(reason)) => Err(DbError::Feed(reason)),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                Err(DbError::Feed(format!("feed lagged by {n} events")))
            }
        });
        Ok(stream.boxed())
    }

    async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, DbError> {
        let mut out = vec![IndexInfo {
            name: "_id_".to_string(),
            keys: vec![fields::ID.to_string()],
            unique: true,
            text: false,
        }];
        if let Some(c) = self.collections.read().get(collection) {
            out.extend(c.indexes.iter().cloned());
        }
        Ok(out)
    }

    async fn create_index(&self, collection: &str, index: IndexInfo) -> Result<(), DbError> {
        let mut guard = self.collections.write();
        let c = guard.entry(collection.to_string()).or_default();
        c.indexes.retain(|i| i.name != index.name);
        c.indexes.push(index);
        let clash = (0..c.docs.len()).find_map(|pos| c.collision(&c.docs[pos], Some(pos)));
        if let Some(key) = clash {
            c.indexes.pop();
            return Err(Self::duplicate(collection, key));
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), DbError> {
        let existed = self.collections.write().remove(collection).is_some();
        if existed {
            self.publish(vec![ChangeEvent {
                collection: collection.to_string(),
                operation: OperationType::Drop,
                document_id: None,
                full_document: None,
                updated_fields: Vec::new(),
            }]);
        }
        Ok(())
    }
}
