//! Process-wide index metadata: which collections carry a text index and
//! what indexes each collection has.

use crate::db::{Database, DbError, IndexInfo};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct Snapshot {
    indexes: HashMap<String, Vec<IndexInfo>>,
    text_collections: HashSet<String>,
    refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MetadataCache {
    snapshot: RwLock<Snapshot>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload from the database. Callers that arrive while a refresh is
    /// running wait for it and reuse its result instead of starting another.
    pub async fn refresh(&self, db: &dyn Database) -> Result<(), DbError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            return Ok(());
        }

        let mut next = Snapshot::default();
        for collection in db.list_collections().await? {
            let indexes = db.list_indexes(&collection).await?;
            if indexes.iter().any(|i| i.text) {
                next.text_collections.insert(collection.clone());
            }
            next.indexes.insert(collection, indexes);
        }
        next.refreshed_at = Some(Utc::now());
        let collections = next.indexes.len();
        *self.snapshot.write() = next;
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(collections, "metadata cache refreshed");
        Ok(())
    }

    pub fn is_text_indexed(&self, collection: &str) -> bool {
        self.snapshot.read().text_collections.contains(collection)
    }

    pub fn indexes(&self, collection: &str) -> Vec<IndexInfo> {
        self.snapshot
            .read()
            .indexes
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().refreshed_at
    }

    /// Number of completed refreshes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use std::sync::Arc;

    #[tokio::test]
    async fn text_collections_follow_indexes() {
        let db = MemoryDatabase::new();
        let cache = MetadataCache::new();
        db.create_index(
            "entities",
            IndexInfo {
                name: "text".into(),
                keys: vec!["_searchnames".into()],
                unique: false,
                text: true,
            },
        )
        .await
        .unwrap();
        assert!(!cache.is_text_indexed("entities"));
        cache.refresh(&db).await.unwrap();
        assert!(cache.is_text_indexed("entities"));
        assert_eq!(cache.indexes("entities").len(), 2);
        assert!(cache.refreshed_at().is_some());
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_run() {
        let db = Arc::new(MemoryDatabase::new());
        let cache = Arc::new(MetadataCache::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.refresh(db.as_ref()).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let runs = cache.generation();
        assert!((1..=8).contains(&runs));
        cache.refresh(db.as_ref()).await.unwrap();
        assert_eq!(cache.generation(), runs + 1);
    }
}
