use crate::db::ChangeEvent;
use tokio::sync::broadcast;

/// What the change bus carries: a committed change, or a fault that
/// tells every open feed to drop and resubscribe.
#[derive(Clone, Debug)]
pub enum FeedItem {
    Change(ChangeEvent),
    Fault(String),
}

#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<FeedItem>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedItem> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: ChangeEvent) {
        let _ = self.tx.send(FeedItem::Change(event));
    }

    pub fn fault(&self, reason: impl Into<String>) {
        let _ = self.tx.send(FeedItem::Fault(reason.into()));
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
