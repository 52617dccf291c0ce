//! Change propagation: one task reads the database change feed, applies
//! system side effects and fans each change out to the subscriptions whose
//! owner may read the document.

mod subscription;


pub use subscription::{Subscription, WatchFilter};

use crate::acl::Right;
use crate::auth::Subject;
use crate::authz;
use crate::db::{ChangeEvent, OperationType};
use crate::document::{fields, Document};
use crate::error::TransportError;
use crate::store::{is_history_collection, DocumentStore};
use crate::transport::{ConnectionRegistry, Message};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Command name of change notifications on the wire.
pub const WATCH_EVENT: &str = "watchevent";

/// Updates touching only these fields of a subject document are not
/// fanned out.
const HEARTBEAT_FIELDS: [&str; 6] = [
    "lastseen",
    fields::HEARTBEAT,
    fields::MODIFIED,
    fields::MODIFIED_BY,
    fields::MODIFIED_BY_ID,
    fields::VERSION,
];

/// Side effects of changes to system collections.
#[async_trait]
pub trait SystemHooks: Send + Sync {
    async fn subject_disabled(&self, _subject_id: &str) {}
    async fn subject_locked(&self, _subject_id: &str) {}
    async fn config_changed(&self, _doc: &Document) {}
    async fn providers_changed(&self, _doc: &Document) {}
}

pub struct NoopHooks;

impl SystemHooks for NoopHooks {}

pub struct ChangeWatcher {
    store: Arc<DocumentStore>,
    registry: Arc<ConnectionRegistry>,
    hooks: Arc<dyn SystemHooks>,
    healthy: AtomicBool,
}

impl ChangeWatcher {
    pub fn new(store: Arc<DocumentStore>, registry: Arc<ConnectionRegistry>, hooks: Arc<dyn SystemHooks>) -> Self {
        Self {
            store,
            registry,
            hooks,
            healthy: AtomicBool::new(false),
        }
    }

    /// False while the feed is down and a resubscribe is pending.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Consume the feed forever. A fault marks the watcher unhealthy and
    /// resubscribes after the configured backoff; changes made in between
    /// are not replayed.
    pub async fn run(&self) {
        let backoff = self.store.config().watch_backoff();
        loop {
            match self.store.db().watch().await {
                Ok(mut feed) => {
                    self.healthy.store(true, Ordering::Release);
                    info!("change feed open");
                    while let Some(item) = feed.next().await {
                        match item {
                            Ok(event) => {
                                self.handle(event).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "change feed fault");
                                break;
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "cannot open change feed"),
            }
            self.healthy.store(false, Ordering::Release);
            warn!(backoff_ms = backoff.as_millis() as u64, "change feed down, resubscribing after backoff");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Process one change. Returns the number of notifications queued.
    pub async fn handle(&self, event: ChangeEvent) -> usize {
        let collection = event.collection.clone();
        if event.operation == OperationType::Drop {
            if let Err(e) = self.store.cache().refresh(self.store.db().as_ref()).await {
                warn!(collection = %collection, error = %e, "metadata refresh after drop failed");
            }
            return 0;
        }
        if is_history_collection(&collection) {
            return 0;
        }

        let config = self.store.config();
        let is_subject_collection = collection == config.subject_collection;
        if is_subject_collection
            && event.operation == OperationType::Update
            && !event.updated_fields.is_empty()
            && event.updated_fields.iter().all(|f| HEARTBEAT_FIELDS.contains(&f.as_str()))
        {
            debug!(id = ?event.document_id, "skipping heartbeat update");
            return 0;
        }

        let Some(doc) = self.resolve(&event).await else {
            return 0;
        };

        if event.operation != OperationType::Delete {
            self.side_effects(&collection, &doc).await;
        }
        self.fan_out(&collection, event.operation, &doc)
    }

    /// The changed document in plaintext, fetched from history when the
    /// feed did not carry it.
    async fn resolve(&self, event: &ChangeEvent) -> Option<Document> {
        let root = Subject::root();
        if let Some(doc) = &event.full_document {
            return Some(self.store.reveal(doc.clone(), &root).await);
        }
        let id = event.document_id.as_deref()?;
        match self
            .store
            .get_latest_document_version(&root, &event.collection, id)
            .await
        {
            Ok(doc) => Some(doc),
            Err(e) => {
                debug!(collection = %event.collection, id, error = %e, "changed document not resolvable");
                None
            }
        }
    }

    async fn side_effects(&self, collection: &str, doc: &Document) {
        let config = self.store.config();
        if collection == config.subject_collection && doc.doc_type() == Some("user") {
            let Some(id) = doc.id() else { return };
            if doc.bool_field("disabled") {
                self.registry.disconnect_subject(id);
                self.hooks.subject_disabled(id).await;
            }
            if doc.bool_field("dblocked") {
                self.registry.disconnect_subject(id);
                self.hooks.subject_locked(id).await;
            }
        } else if collection == config.config_collection {
            match doc.doc_type() {
                Some("config") => self.hooks.config_changed(doc).await,
                Some("provider") => self.hooks.providers_changed(doc).await,
                _ => {}
            }
        }
    }

    fn fan_out(&self, collection: &str, operation: OperationType, doc: &Document) -> usize {
        let mut delivered = 0;
        for conn in self.registry.snapshot() {
            let Some(subject) = conn.subject() else { continue };
            let subscriptions = conn.subscriptions_for(collection);
            if subscriptions.is_empty() || !authz::has_authorization(&subject, doc, Right::Read) {
                continue;
            }
            let mut visible = doc.clone();
            authz::redact(&mut visible, &subject, self.store.config());
            for subscription in subscriptions {
                if !subscription.filter.matches(&visible) {
                    continue;
                }
                let payload = json!({
                    "collection": collection,
                    "operationType": operation,
                    "document": visible,
                    "watchId": subscription.id,
                });
                match conn.try_notify(Message::notification(WATCH_EVENT, payload.to_string())) {
                    Ok(()) => delivered += 1,
                    Err(TransportError::QueueFull) => {
                        warn!(connection = %conn.id(), collection, "outbound queue full, notification shed");
                    }
                    Err(e) => debug!(connection = %conn.id(), error = %e, "notification not delivered"),
                }
            }
        }
        delivered
    }
}
