use super::Connection;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Live connections by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.connections.write().insert(conn.id().to_string(), conn);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Forget connections that have already closed.
    pub fn prune_closed(&self) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|_, c| !c.is_closed());
        before - connections.len()
    }

    /// Close and forget every connection signed in as `subject_id`.
    pub fn disconnect_subject(&self, subject_id: &str) -> usize {
        let victims: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write();
            let ids: Vec<String> = connections
                .iter()
                .filter(|(_, c)| c.subject().is_some_and(|s| s.id == subject_id))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };
        for conn in &victims {
            conn.close();
        }
        if !victims.is_empty() {
            info!(subject = subject_id, connections = victims.len(), "disconnected subject");
        }
        victims.len()
    }
}
