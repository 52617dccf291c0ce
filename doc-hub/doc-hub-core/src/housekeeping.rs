//! Periodic maintenance. Each run starts only after the previous one has
//! finished, so runs never overlap.

use crate::store::DocumentStore;
use crate::transport::ConnectionRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub pruned_connections: usize,
    pub cache_refreshed: bool,
}

/// Prune closed connections and refresh the metadata cache. Running it
/// with nothing to do is harmless.
pub async fn run_once(store: &DocumentStore, registry: &ConnectionRegistry) -> Report {
    let pruned_connections = registry.prune_closed();
    let cache_refreshed = match store.cache().refresh(store.db().as_ref()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "metadata refresh failed");
            false
        }
    };
    debug!(pruned_connections, cache_refreshed, "housekeeping run finished");
    Report {
        pruned_connections,
        cache_refreshed,
    }
}

pub fn spawn(store: Arc<DocumentStore>, registry: Arc<ConnectionRegistry>) -> JoinHandle<()> {
    let interval = store.config().housekeeping_interval();
    tokio::spawn(async move {
        loop {
            run_once(&store, &registry).await;
            tokio::time::sleep(interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::{Database, IndexInfo, MemoryDatabase};
    use crate::transport::Connection;
    use std::time::Duration;

    #[tokio::test]
    async fn prunes_and_refreshes() {
        let db = Arc::new(MemoryDatabase::new());
        let store = DocumentStore::new(db.clone(), StoreConfig::default());
        let registry = ConnectionRegistry::new();
        let (open, _rx1) = Connection::new(store.config());
        let (closed, _rx2) = Connection::new(store.config());
        registry.register(open);
        registry.register(closed.clone());
        closed.close();

        db.create_index(
            "articles",
            IndexInfo {
                name: "text".into(),
                keys: vec!["_searchnames".into()],
                unique: false,
                text: true,
            },
        )
        .await
        .unwrap();

        let report = run_once(&store, &registry).await;
        assert_eq!(report.pruned_connections, 1);
        assert!(report.cache_refreshed);
        assert!(store.cache().is_text_indexed("articles"));

        let idle = run_once(&store, &registry).await;
        assert_eq!(idle.pruned_connections, 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_back_to_back() {
        let db = Arc::new(MemoryDatabase::new());
        let store = Arc::new(DocumentStore::new(
            db,
            StoreConfig {
                housekeeping_interval_ms: 1_000,
                ..Default::default()
            },
        ));
        let task = spawn(store.clone(), Arc::new(ConnectionRegistry::new()));
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let runs = store.cache().generation();
        assert!((3..=5).contains(&runs), "{runs} runs");
        task.abort();
    }
}
