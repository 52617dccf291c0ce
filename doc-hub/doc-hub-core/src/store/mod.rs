//! The versioned document store.
//!
//! Every operation runs as a [`Subject`] against one collection. Reads are
//! scoped by the read access filter; writes resolve their target through
//! the matching access filter, normalize the ACL, encrypt listed fields and
//! then append to the collection's history (see [`history`]).
//!
//! Writes to the same document serialize on the database's single-document
//! primitives: replaces and operator updates are guarded on the `_version`
//! they read, and a guard that matches nothing is a concurrency error.

mod history;
mod reconcile;


pub use history::{history_collection, is_history_collection};

use crate::acl::{Ace, Right, Rights};
use crate::auth::{DatabaseDirectory, Subject, SubjectDirectory, ADMINS_ID, ROOT_ID, USERS_ID};
use crate::authz::{self, access_filter_for};
use crate::cache::MetadataCache;
use crate::config::StoreConfig;
use crate::crypt::{decrypt_document, encrypt_document, encrypt_value, FieldCipher, PlainCipher};
use crate::db::{Database, FindOptions};
use crate::document::{fields, Document};
use crate::error::{Result, StoreError};
use crate::filter::{Filter, Stage, UpdateSpec};
use chrono::{SecondsFormat, Utc};
use history::History;
use reconcile::{reconcile_replace, stamp_created, stamp_modified, unchanged};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fields an operator update may never write.
const IMMUTABLE: [&str; 5] = [
    fields::ID,
    fields::VERSION,
    fields::CREATED,
    fields::CREATED_BY,
    fields::CREATED_BY_ID,
];

/// Well-known subject ids only administrators may create.
const RESERVED_IDS: [&str; 3] = [ROOT_ID, ADMINS_ID, USERS_ID];

/// Operator updates writing these fields of a subject document are
/// checked against the subject rules.
const SUBJECT_SHAPE: [&str; 3] = [fields::TYPE, "username", "name"];

pub struct DocumentStore {
    db: Arc<dyn Database>,
    cipher: Arc<dyn FieldCipher>,
    directory: Arc<dyn SubjectDirectory>,
    cache: Arc<MetadataCache>,
    config: Arc<StoreConfig>,
    history: History,
    upsert_gate: Semaphore,
}

impl DocumentStore {
    pub fn new(db: Arc<dyn Database>, config: StoreConfig) -> Self {
        let directory = DatabaseDirectory::new(db.clone(), config.subject_collection.clone());
        Self {
            history: History::new(db.clone(), config.history_delta_count),
            db,
            cipher: Arc::new(PlainCipher),
            directory: Arc::new(directory),
            cache: Arc::new(MetadataCache::new()),
            config: Arc::new(config),
            upsert_gate: Semaphore::new(1),
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn FieldCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn SubjectDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_cache(mut self, cache: Arc<MetadataCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn directory(&self) -> &Arc<dyn SubjectDirectory> {
        &self.directory
    }

    /// Decrypt a persisted document and strip the fields `subject` may not see.
    pub async fn reveal(&self, doc: Document, subject: &Subject) -> Document {
        let mut doc = decrypt_document(self.cipher.as_ref(), doc).await;
        authz::redact(&mut doc, subject, &self.config);
        doc
    }

    async fn reveal_all(&self, docs: Vec<Document>, subject: &Subject) -> Vec<Document> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(self.reveal(doc, subject).await);
        }
        out
    }

    async fn seal(&self, doc: Document) -> Result<Document> {
        encrypt_document(self.cipher.as_ref(), doc)
            .await
            .map_err(|e| StoreError::Encryption(e.to_string()))
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn read_scope(subject: &Subject, filter: Filter) -> Filter {
        Filter::and([filter, access_filter_for(subject, Right::Read)])
    }

    fn check_capacity(&self, sizes: impl IntoIterator<Item = usize>) -> Result<()> {
        let total: usize = sizes.into_iter().sum();
        if total > self.config.query_max_bytes {
            return Err(StoreError::CapacityExceeded(format!(
                "result of {total} bytes exceeds the {} byte ceiling",
                self.config.query_max_bytes
            )));
        }
        Ok(())
    }

    fn oversized(&self, doc: &Document) -> bool {
        doc.size_bytes() > self.config.history_obj_max_kb * 1024
    }

    fn keeps_history(&self, collection: &str, doc: &Document) -> bool {
        !self.config.skips_history(collection) && !is_history_collection(collection) && !self.oversized(doc)
    }

    fn version_guard(id: &str, version: u64) -> Filter {
        let at_version = if version == 0 {
            Filter::Or(vec![
                Filter::eq(fields::VERSION, version),
                Filter::Exists(fields::VERSION.to_string(), false),
            ])
        } else {
            Filter::eq(fields::VERSION, version)
        };
        Filter::and([Filter::id(id), at_version])
    }

    /// Resolve the document a write applies to. Callers that cannot see the
    /// target get `AccessDenied` whether or not it exists.
    async fn target(&self, subject: &Subject, collection: &str, filter: Filter, right: Right) -> Result<Document> {
        let scoped = Filter::and([filter, access_filter_for(subject, right)]);
        if let Some(doc) = self.db.find_one(collection, &scoped).await? {
            return Ok(doc);
        }
        if subject.is_admin() {
            Err(StoreError::NotFound(format!("no matching document in {collection}")))
        } else {
            Err(StoreError::denied(format!("{right} on {collection}")))
        }
    }

    // ---- reads ----

    pub async fn query(
        &self,
        subject: &Subject,
        collection: &str,
        filter: Filter,
        mut options: FindOptions,
    ) -> Result<Vec<Document>> {
        if !options.projection.is_empty() && !options.projection.iter().any(|p| p == fields::ENCRYPT) {
            options.projection.push(fields::ENCRYPT.to_string());
        }
        let docs = self
            .db
            .find(collection, &Self::read_scope(subject, filter), &options)
            .await?;
        self.check_capacity(docs.iter().map(Document::size_bytes))?;
        Ok(self.reveal_all(docs, subject).await)
    }

    pub async fn get_one(&self, subject: &Subject, collection: &str, filter: Filter) -> Result<Document> {
        let doc = self
            .db
            .find_one(collection, &Self::read_scope(subject, filter))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("no matching document in {collection}")))?;
        Ok(self.reveal(doc, subject).await)
    }

    pub async fn count(&self, subject: &Subject, collection: &str, filter: Filter) -> Result<u64> {
        Ok(self.db.count(collection, &Self::read_scope(subject, filter)).await?)
    }

    pub async fn distinct(&self, subject: &Subject, collection: &str, field: &str, filter: Filter) -> Result<Vec<Value>> {
        let values = self
            .db
            .distinct(collection, field, &Self::read_scope(subject, filter))
            .await?;
        self.check_capacity(values.iter().map(|v| v.to_string().len()))?;
        Ok(values)
    }

    pub async fn aggregate(&self, subject: &Subject, collection: &str, pipeline: Vec<Stage>) -> Result<Vec<Document>> {
        let mut stages = Vec::with_capacity(pipeline.len() + 1);
        if !subject.is_admin() {
            stages.push(Stage::Match(access_filter_for(subject, Right::Read)));
        }
        stages.extend(pipeline);
        let docs = self.db.aggregate(collection, &stages).await?;
        self.check_capacity(docs.iter().map(Document::size_bytes))?;
        Ok(self.reveal_all(docs, subject).await)
    }

    // ---- inserts ----

    pub async fn insert_one(&self, subject: &Subject, collection: &str, mut doc: Document) -> Result<Document> {
        match doc.get(fields::ID) {
            None | Some(Value::Null) => {}
            Some(Value::String(id)) if !id.is_empty() => {}
            Some(other) => return Err(StoreError::invalid(format!("_id must be a non-empty string, got {other}"))),
        }
        if doc.id().is_none() {
            doc.set_id(Uuid::new_v4().simple().to_string());
        }
        if let Some(id) = doc.id().filter(|id| RESERVED_IDS.contains(id)) {
            if !subject.is_admin() {
                return Err(StoreError::denied(format!("{id} is a reserved id")));
            }
        }
        let now = Self::now();
        stamp_created(&mut doc, subject, &now);
        stamp_modified(&mut doc, subject, &now);
        doc.set_version(0);

        authz::ensure_resource(&mut doc, &self.config, self.cache.is_text_indexed(collection));
        if collection == self.config.subject_collection
            && matches!(doc.doc_type(), Some("user" | "role"))
            && !subject.is_admin()
        {
            return Err(StoreError::denied(format!("creating subjects in {collection}")));
        }
        self.subject_rules(collection, &mut doc, subject, None).await?;
        authz::normalize_acl(&mut doc, subject, &self.config, Some(self.directory.as_ref())).await?;

        let sealed = self.seal(doc.clone()).await?;
        let stored = self.db.insert_one(collection, sealed).await?;
        if self.keeps_history(collection, &stored) {
            if let Err(e) = self.history.baseline(collection, &stored, subject).await {
                warn!(collection, id = ?stored.id(), error = %e, "failed to write history baseline");
            }
        }
        info!(collection, id = ?doc.id(), subject = %subject.name, "document inserted");
        Ok(self.reveal(doc, subject).await)
    }

    pub async fn insert_many(&self, subject: &Subject, collection: &str, docs: Vec<Document>) -> Result<Vec<Document>> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(self.insert_one(subject, collection, doc).await?);
        }
        Ok(out)
    }

    // ---- updates ----

    /// Replace a whole document. The replacement is reconciled against the
    /// stored original; a replacement that changes nothing is not written.
    pub async fn replace_one(&self, subject: &Subject, collection: &str, doc: Document) -> Result<Document> {
        let id = doc
            .id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::invalid("replacement must carry an _id"))?;
        let stored = self.target(subject, collection, Filter::id(id.clone()), Right::Update).await?;
        let original = decrypt_document(self.cipher.as_ref(), stored.clone()).await;

        let mut next = doc;
        reconcile_replace(&mut next, &original, subject, &self.config, collection, &Self::now());
        authz::ensure_resource(&mut next, &self.config, self.cache.is_text_indexed(collection));
        self.guard_subject_type(collection, subject, &original, &next)?;
        self.subject_rules(collection, &mut next, subject, Some(&original)).await?;
        authz::normalize_acl(&mut next, subject, &self.config, Some(self.directory.as_ref())).await?;

        if self.oversized(&next) {
            let sealed = self.seal(next.clone()).await?;
            self.persist_replace(collection, &id, original.version(), sealed).await?;
            warn!(collection, id = %id, bytes = next.size_bytes(), "oversized document stored without history");
            return Ok(self.reveal(next, subject).await);
        }

        if unchanged(&original, &next) {
            debug!(collection, id = %id, "replace changes nothing");
            return Ok(self.reveal(original, subject).await);
        }

        next.set_version(original.version() + 1);
        let sealed = self.seal(next.clone()).await?;
        self.persist_replace(collection, &id, original.version(), sealed.clone()).await?;
        if self.keeps_history(collection, &sealed) {
            if let Err(e) = self.history.delta(collection, &stored, &sealed, subject).await {
                warn!(collection, id = %id, error = %e, "failed to write history delta");
            }
        }
        info!(collection, id = %id, version = next.version(), subject = %subject.name, "document replaced");
        Ok(self.reveal(next, subject).await)
    }

    async fn persist_replace(&self, collection: &str, id: &str, version: u64, sealed: Document) -> Result<()> {
        let matched = self
            .db
            .replace_one(collection, &Self::version_guard(id, version), sealed)
            .await?;
        if matched != 1 {
            return Err(StoreError::Concurrency(format!(
                "{collection}/{id} changed while it was being replaced"
            )));
        }
        Ok(())
    }

    /// Apply field operators to the first document `filter` selects.
    pub async fn update_one(
        &self,
        subject: &Subject,
        collection: &str,
        filter: Filter,
        mut spec: UpdateSpec,
    ) -> Result<Document> {
        if collection == self.config.subject_collection {
            authz::strip_protected_operators(&mut spec, &self.config);
        }
        if let Some(field) = IMMUTABLE.iter().find(|f| spec.touches(f)) {
            return Err(StoreError::invalid(format!("{field} cannot be updated")));
        }
        if spec.is_empty() {
            return Err(StoreError::invalid("update has no operators"));
        }
        if let Some(Value::String(kind)) = spec.set.get_mut(fields::TYPE) {
            *kind = kind.to_lowercase();
        }

        let target = self.target(subject, collection, filter, Right::Update).await?;
        let id = target.id().unwrap_or_default().to_string();

        if collection == self.config.subject_collection
            && id == subject.id
            && spec.set.get("disabled") == Some(&Value::Bool(true))
        {
            return Err(StoreError::invalid("a user cannot disable itself"));
        }

        if collection == self.config.subject_collection && SUBJECT_SHAPE.iter().any(|f| spec.touches(f)) {
            let mut preview = target.clone();
            spec.apply(&mut preview)?;
            self.guard_subject_type(collection, subject, &target, &preview)?;
            let applied = preview.clone();
            self.subject_rules(collection, &mut preview, subject, Some(&target)).await?;
            for field in ["username", "name"] {
                if let Some(value) = preview.get(field).filter(|v| applied.get(field) != Some(*v)) {
                    spec.set.insert(field.to_string(), value.clone());
                }
            }
        }

        self.encrypt_operators(&mut spec, &target).await?;

        if spec.touches(fields::ACL) {
            let mut preview = target.clone();
            spec.apply(&mut preview)?;
            authz::normalize_acl(&mut preview, subject, &self.config, Some(self.directory.as_ref())).await?;
            spec.strip(fields::ACL);
            let acl = preview.get(fields::ACL).cloned().unwrap_or(Value::Array(Vec::new()));
            spec.set.insert(fields::ACL.to_string(), acl);
        }

        let now = Self::now();
        spec.set.insert(fields::MODIFIED.to_string(), Value::String(now));
        spec.set.insert(fields::MODIFIED_BY.to_string(), Value::String(subject.name.clone()));
        spec.set.insert(fields::MODIFIED_BY_ID.to_string(), Value::String(subject.id.clone()));
        spec.inc.insert(fields::VERSION.to_string(), Value::from(1));

        let after = self
            .db
            .update_one(collection, &Self::version_guard(&id, target.version()), &spec)
            .await?
            .ok_or_else(|| StoreError::Concurrency(format!("{collection}/{id} changed while it was being updated")))?;

        if self.keeps_history(collection, &after) {
            if let Err(e) = self.history.operation(collection, &after, &spec, subject).await {
                warn!(collection, id = %id, error = %e, "failed to write history operation");
            }
        }
        info!(collection, id = %id, version = after.version(), subject = %subject.name, "document updated");
        Ok(self.reveal(after, subject).await)
    }

    /// `$set` values for encrypted fields are stored encrypted. Writing
    /// below an encrypted field is rejected because the stored value is opaque.
    async fn encrypt_operators(&self, spec: &mut UpdateSpec, target: &Document) -> Result<()> {
        let encrypted: Vec<String> = match spec.set.get(fields::ENCRYPT) {
            Some(Value::Array(list)) => list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            _ => target.encrypted_fields(),
        };
        if encrypted.is_empty() {
            return Ok(());
        }
        for path in spec.touched_fields() {
            let top = path.split('.').next().unwrap_or_default();
            if path != top && encrypted.iter().any(|f| f == top) {
                return Err(StoreError::invalid(format!("{path} is inside encrypted field {top}")));
            }
        }
        for field in &encrypted {
            if field == fields::ID || field == fields::ENCRYPT {
                continue;
            }
            if spec.inc.contains_key(field) || spec.mul.contains_key(field) {
                return Err(StoreError::invalid(format!("arithmetic on encrypted field {field}")));
            }
            let Some(value) = spec.set.get(field).filter(|v| !v.is_null()).cloned() else {
                continue;
            };
            let sealed = encrypt_value(self.cipher.as_ref(), &value)
                .await
                .map_err(|e| StoreError::Encryption(e.to_string()))?;
            spec.set.insert(field.clone(), sealed);
        }
        Ok(())
    }

    pub async fn update_many(
        &self,
        subject: &Subject,
        collection: &str,
        filter: Filter,
        spec: UpdateSpec,
    ) -> Result<Vec<Document>> {
        let ids = self.matching_ids(subject, collection, filter, Right::Update).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.update_one(subject, collection, Filter::id(id), spec.clone()).await?);
        }
        Ok(out)
    }

    async fn matching_ids(&self, subject: &Subject, collection: &str, filter: Filter, right: Right) -> Result<Vec<String>> {
        let scoped = Filter::and([filter, access_filter_for(subject, right)]);
        let options = FindOptions {
            projection: vec![fields::ID.to_string()],
            ..Default::default()
        };
        Ok(self
            .db
            .find(collection, &scoped, &options)
            .await?
            .iter()
            .filter_map(|d| d.id().map(str::to_string))
            .collect())
    }

    /// Update the document matching `unique_keys` (default `_id`) or insert
    /// it when nothing matches. Calls are serialized process-wide so two
    /// concurrent upserts for the same key cannot both insert.
    pub async fn insert_or_update(
        &self,
        subject: &Subject,
        collection: &str,
        mut doc: Document,
        unique_keys: &[String],
    ) -> Result<Document> {
        let _permit = self
            .upsert_gate
            .acquire()
            .await
            .map_err(|_| StoreError::Concurrency("upsert gate closed".to_string()))?;

        let keys: Vec<String> = if unique_keys.is_empty() {
            vec![fields::ID.to_string()]
        } else {
            unique_keys.to_vec()
        };
        if keys == [fields::ID] && doc.id().is_none() {
            return self.insert_one(subject, collection, doc).await;
        }

        let mut parts = Vec::with_capacity(keys.len());
        for key in &keys {
            let value = doc
                .first_at(key)
                .cloned()
                .ok_or_else(|| StoreError::invalid(format!("unique key {key} is missing")))?;
            parts.push(Filter::Eq(key.clone(), value));
        }
        let found = self
            .db
            .find(collection, &Filter::and(parts), &FindOptions::limit(2))
            .await?;
        match found.as_slice() {
            [] => self.insert_one(subject, collection, doc).await,
            [existing] => {
                let id = existing.id().unwrap_or_default().to_string();
                doc.set_id(id);
                self.replace_one(subject, collection, doc).await
            }
            _ => Err(StoreError::invalid(format!(
                "{} is not unique in {collection}",
                keys.join(", ")
            ))),
        }
    }

    // ---- deletes ----

    /// Delete one document. Customers with dependent subjects need
    /// `recursive`, which deletes the dependents first. Returns the number
    /// of documents removed.
    pub async fn delete_one(&self, subject: &Subject, collection: &str, id: &str, recursive: bool) -> Result<u64> {
        Ok(self.delete_with_dependents(subject, collection, id, recursive).await?.len() as u64)
    }

    pub async fn delete_many(&self, subject: &Subject, collection: &str, filter: Filter, recursive: bool) -> Result<u64> {
        let ids = self.matching_ids(subject, collection, filter, Right::Delete).await?;
        let mut removed: HashSet<String> = HashSet::new();
        for id in ids {
            if removed.contains(&id) {
                continue;
            }
            removed.extend(self.delete_with_dependents(subject, collection, &id, recursive).await?);
        }
        Ok(removed.len() as u64)
    }

    async fn delete_with_dependents(
        &self,
        subject: &Subject,
        collection: &str,
        id: &str,
        recursive: bool,
    ) -> Result<Vec<String>> {
        let root = self.target(subject, collection, Filter::id(id), Right::Delete).await?;
        let plan = self.plan_delete(subject, collection, root, recursive).await?;
        let mut removed = Vec::with_capacity(plan.len());
        for doc in plan {
            removed.push(self.remove(subject, collection, doc, recursive).await?);
        }
        Ok(removed)
    }

    /// Order the documents a delete removes so dependents come before the
    /// customers they belong to.
    async fn plan_delete(
        &self,
        subject: &Subject,
        collection: &str,
        root: Document,
        recursive: bool,
    ) -> Result<Vec<Document>> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((doc, expanded)) = stack.pop() {
            if expanded {
                order.push(doc);
                continue;
            }
            let id = doc.id().unwrap_or_default().to_string();
            if !seen.insert(id.clone()) {
                continue;
            }
            let dependents = if collection == self.config.subject_collection && doc.doc_type() == Some("customer") {
                self.db
                    .find(collection, &Filter::eq("customerid", id.as_str()), &FindOptions::default())
                    .await?
            } else {
                Vec::new()
            };
            if !dependents.is_empty() && !recursive {
                return Err(StoreError::invalid(format!(
                    "customer {id} has {} dependent subjects, delete recursively",
                    dependents.len()
                )));
            }
            stack.push((doc, true));
            for dependent in dependents {
                if !authz::has_authorization(subject, &dependent, Right::Delete) {
                    return Err(StoreError::denied(format!("delete on dependents of {id}")));
                }
                if !dependent.id().is_some_and(|d| seen.contains(d)) {
                    stack.push((dependent, false));
                }
            }
        }
        Ok(order)
    }

    async fn remove(&self, subject: &Subject, collection: &str, doc: Document, recursive: bool) -> Result<String> {
        let id = doc.id().unwrap_or_default().to_string();
        if recursive && collection == self.config.subject_collection && doc.doc_type() == Some("user") {
            self.remove_from_roles(collection, &id).await?;
        }
        let removed = self
            .db
            .delete_one(collection, &Self::version_guard(&id, doc.version()))
            .await?
            .ok_or_else(|| StoreError::Concurrency(format!("{collection}/{id} changed while it was being deleted")))?;
        if self.keeps_history(collection, &removed) {
            if let Err(e) = self.history.deletion(collection, &removed, subject).await {
                warn!(collection, id = %id, error = %e, "failed to write deletion history");
            }
        }
        info!(collection, id = %id, subject = %subject.name, "document deleted");
        Ok(id)
    }

    async fn remove_from_roles(&self, collection: &str, user_id: &str) -> Result<()> {
        let filter = Filter::and([Filter::eq(fields::TYPE, "role"), Filter::eq("members._id", user_id)]);
        let roles = self.db.find(collection, &filter, &FindOptions::default()).await?;
        for role in roles {
            let mut role = decrypt_document(self.cipher.as_ref(), role).await;
            if let Some(Value::Array(members)) = role.get_mut("members") {
                members.retain(|m| m.get(fields::ID).and_then(Value::as_str) != Some(user_id));
            }
            debug!(role = ?role.id(), user = user_id, "removing member from role");
            self.replace_one(&Subject::root(), collection, role).await?;
        }
        Ok(())
    }

    // ---- history ----

    /// The document as it was at `version`, rebuilt from history when the
    /// live copy has moved on. Subjects that cannot read the document get
    /// `NotFound`.
    pub async fn get_document_version(
        &self,
        subject: &Subject,
        collection: &str,
        id: &str,
        version: u64,
    ) -> Result<Document> {
        let missing = || StoreError::NotFound(format!("{collection}/{id} at version {version}"));
        let live = self.db.find_one(collection, &Filter::id(id)).await?;
        if let Some(live) = &live {
            if !authz::has_authorization(subject, live, Right::Read) {
                return Err(missing());
            }
            if live.version() == version {
                return Ok(self.reveal(live.clone(), subject).await);
            }
            if live.version() < version {
                return Err(missing());
            }
        }
        let doc = self
            .history
            .reconstruct(collection, id, version)
            .await?
            .ok_or_else(missing)?;
        if live.is_none() && !authz::has_authorization(subject, &doc, Right::Read) {
            return Err(missing());
        }
        Ok(self.reveal(doc, subject).await)
    }

    /// The live document, or for a deleted one the newest version history
    /// can rebuild.
    pub async fn get_latest_document_version(&self, subject: &Subject, collection: &str, id: &str) -> Result<Document> {
        let missing = || StoreError::NotFound(format!("{collection}/{id}"));
        if let Some(live) = self.db.find_one(collection, &Filter::id(id)).await? {
            if !authz::has_authorization(subject, &live, Right::Read) {
                return Err(missing());
            }
            return Ok(self.reveal(live, subject).await);
        }
        let latest = self.history.latest_version(collection, id).await?.ok_or_else(missing)?;
        let doc = self
            .history
            .reconstruct(collection, id, latest)
            .await?
            .ok_or_else(missing)?;
        if !authz::has_authorization(subject, &doc, Right::Read) {
            return Err(missing());
        }
        Ok(self.reveal(doc, subject).await)
    }

    // ---- subject collection ----

    /// Only administrators turn a document of the subject collection into
    /// a user or role.
    fn guard_subject_type(&self, collection: &str, actor: &Subject, before: &Document, after: &Document) -> Result<()> {
        if collection != self.config.subject_collection || actor.is_admin() {
            return Ok(());
        }
        match after.doc_type() {
            Some(kind @ ("user" | "role")) if before.doc_type() != Some(kind) => Err(StoreError::denied(format!(
                "turning {} into a {kind}",
                after.id().unwrap_or_default()
            ))),
            _ => Ok(()),
        }
    }

    async fn subject_rules(
        &self,
        collection: &str,
        doc: &mut Document,
        actor: &Subject,
        original: Option<&Document>,
    ) -> Result<()> {
        if collection != self.config.subject_collection {
            return Ok(());
        }
        let kind = doc.doc_type().map(str::to_string);
        match kind.as_deref() {
            Some("user") => {
                let username = doc
                    .str_field("username")
                    .map(str::to_lowercase)
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| StoreError::invalid("a user needs a username"))?;
                doc.insert("username".to_string(), Value::String(username.clone()));
                if doc.str_field("name").map_or(true, str::is_empty) {
                    doc.insert("name".to_string(), Value::String(username.clone()));
                }
                self.ensure_unique(collection, "user", "username", &username, doc.id()).await?;

                let id = doc.id().unwrap_or_default().to_string();
                match original {
                    Some(original) => {
                        if id == actor.id && doc.bool_field("disabled") && !original.bool_field("disabled") {
                            return Err(StoreError::invalid("a user cannot disable itself"));
                        }
                    }
                    None => {
                        let name = doc.str_field("name").unwrap_or_default().to_string();
                        let mut acl = doc.acl();
                        if !acl.iter().any(|a| !a.deny && a.subject_id == id) {
                            acl.push(Ace::allow(
                                id,
                                name,
                                Rights::of(&[Right::Read, Right::Update, Right::Invoke]),
                            ));
                            doc.set_acl(&acl);
                        }
                    }
                }
            }
            Some("role") => {
                let name = doc
                    .str_field("name")
                    .filter(|n| !n.trim().is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| StoreError::invalid("a role needs a name"))?;
                self.ensure_unique(collection, "role", "name", &name, doc.id()).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn ensure_unique(
        &self,
        collection: &str,
        kind: &str,
        field: &str,
        value: &str,
        own_id: Option<&str>,
    ) -> Result<()> {
        let mut parts = vec![Filter::eq(fields::TYPE, kind), Filter::eq(field, value)];
        if let Some(own) = own_id {
            parts.push(Filter::Ne(fields::ID.to_string(), Value::String(own.to_string())));
        }
        if self.db.find_one(collection, &Filter::and(parts)).await?.is_some() {
            return Err(StoreError::invalid(format!("{kind} {field} {value} already exists")));
        }
        Ok(())
    }
}
