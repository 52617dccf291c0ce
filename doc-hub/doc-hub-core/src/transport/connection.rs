use super::{Fragment, Message, Reassembler};
use crate::auth::Subject;
use crate::config::StoreConfig;
use crate::error::TransportError;
use crate::watch::{Subscription, WatchFilter};
use futures::{Sink, SinkExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Pending = oneshot::Sender<Result<Message, TransportError>>;

/// One peer. Outbound fragments go through a bounded queue drained by
/// [`run_writer`]; inbound fragments are fed to [`Connection::receive`].
pub struct Connection {
    id: String,
    subject: RwLock<Option<Subject>>,
    outbound: mpsc::Sender<Fragment>,
    package_size: usize,
    pending: Mutex<HashMap<String, Pending>>,
    inbound: Mutex<Reassembler>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    last_ping: Mutex<Option<String>>,
    closed: AtomicBool,
    closing: Notify,
}

impl Connection {
    pub fn new(config: &StoreConfig) -> (Arc<Self>, mpsc::Receiver<Fragment>) {
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let conn = Self {
            id: Uuid::new_v4().to_string(),
            subject: RwLock::new(None),
            outbound: tx,
            package_size: config.package_size,
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(
                Reassembler::new(config.max_package_count).with_max_pending(config.max_pending_messages),
            ),
            subscriptions: Mutex::new(HashMap::new()),
            last_ping: Mutex::new(None),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        };
        (Arc::new(conn), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject(&self) -> Option<Subject> {
        self.subject.read().clone()
    }

    pub fn set_subject(&self, subject: Subject) {
        debug!(connection = %self.id, subject = %subject.name, "connection signed in");
        *self.subject.write() = Some(subject);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Connection::close`] has run.
    pub async fn closed(&self) {
        let notified = self.closing.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Queue every fragment of `msg`, waiting for room.
    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        for fragment in msg.into_fragments(self.package_size) {
            if self.outbound.send(fragment).await.is_err() {
                self.close();
                return Err(TransportError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Queue `msg` only if all of its fragments fit right now. Used by the
    /// change feed, which must never wait on a slow peer.
    pub fn try_notify(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let fragments = msg.into_fragments(self.package_size);
        let permits = self
            .outbound
            .try_reserve_many(fragments.len())
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::QueueFull,
                TrySendError::Closed(_) => TransportError::ConnectionClosed,
            })?;
        for (permit, fragment) in permits.zip(fragments) {
            permit.send(fragment);
        }
        Ok(())
    }

    fn register(&self, id: &str) -> oneshot::Receiver<Result<Message, TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.to_string(), tx);
        rx
    }

    /// Send a request and wait for the peer's reply. A reply carrying an
    /// `error` resolves to [`TransportError::Rejected`].
    pub async fn request(&self, command: &str, data: impl Into<String>) -> Result<Message, TransportError> {
        let msg = Message::request(command, data);
        let id = msg.id.clone();
        let rx = self.register(&id);
        if let Err(e) = self.send(msg).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Feed one inbound fragment. Returns a complete message that is not a
    /// reply to one of our requests, for the caller to dispatch.
    pub fn receive(&self, fragment: Fragment) -> Result<Option<Message>, TransportError> {
        let pushed = self.inbound.lock().push(fragment);
        let msg = match pushed {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(connection = %self.id, error = %e, "dropping inbound fragments");
                return Err(e);
            }
        };
        if let Some(reply_to) = &msg.reply_to {
            let waiter = self.pending.lock().remove(reply_to);
            if let Some(waiter) = waiter {
                let outcome = match msg.error() {
                    Some(err) => Err(TransportError::Rejected(err)),
                    None => Ok(msg),
                };
                let _ = waiter.send(outcome);
                return Ok(None);
            }
        }
        Ok(Some(msg))
    }

    /// Send a ping. Only the latest ping waits for its pong.
    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        let msg = Message::request("ping", "{}");
        let previous = self.last_ping.lock().replace(msg.id.clone());
        if let Some(previous) = previous {
            self.pending.lock().remove(&previous);
        }
        drop(self.register(&msg.id));
        self.send(msg).await
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn buffered_messages(&self) -> usize {
        self.inbound.lock().pending()
    }

    pub fn watch(&self, collection: impl Into<String>, filter: WatchFilter) -> String {
        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            collection: collection.into(),
            filter,
        };
        let id = subscription.id.clone();
        debug!(connection = %self.id, watch = %id, collection = %subscription.collection, "watch added");
        self.subscriptions.lock().insert(id.clone(), Arc::new(subscription));
        id
    }

    pub fn unwatch(&self, id: &str) -> bool {
        self.subscriptions.lock().remove(id).is_some()
    }

    pub fn subscriptions_for(&self, collection: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .values()
            .filter(|s| s.collection == collection)
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Tear down: drop subscriptions and buffers and reject every waiting
    /// request. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscriptions.lock().clear();
        self.inbound.lock().clear();
        let waiters: Vec<Pending> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::ConnectionClosed));
        }
        self.closing.notify_waiters();
        info!(connection = %self.id, "connection closed");
    }
}

/// Drain the outbound queue into `sink` until the connection closes or a
/// write fails. A failed write closes the connection.
pub async fn run_writer<S>(conn: Arc<Connection>, mut rx: mpsc::Receiver<Fragment>, mut sink: S)
where
    S: Sink<String> + Unpin,
    S::Error: Display,
{
    loop {
        let fragment = tokio::select! {
            next = rx.recv() => match next {
                Some(fragment) => fragment,
                None => break,
            },
            _ = conn.closed() => break,
        };
        let text = match fragment.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(connection = %conn.id(), error = %e, "skipping unencodable fragment");
                continue;
            }
        };
        if let Err(e) = sink.send(text).await {
            warn!(connection = %conn.id(), error = %e, "write failed");
            break;
        }
    }
    conn.close();
}

/// Ping every `interval` until the connection closes.
pub async fn run_heartbeat(conn: Arc<Connection>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = conn.heartbeat().await {
                    debug!(connection = %conn.id(), error = %e, "heartbeat stopped");
                    break;
                }
            }
            _ = conn.closed() => break,
        }
    }
}
