use doc_hub::api::{self, AppState};
use doc_hub_core::auth::Hs256Verifier;
use doc_hub_core::db::{Database, MemoryDatabase};
use doc_hub_core::transport::{ConnectionRegistry, Fragment, Message, Reassembler};
use doc_hub_core::watch::{ChangeWatcher, NoopHooks};
use doc_hub_core::{Document, DocumentStore, StoreConfig};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "test-secret";

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Client {
    socket: Socket,
    inbound: Reassembler,
    notifications: Vec<Message>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        Self {
            socket,
            inbound: Reassembler::new(1000),
            notifications: Vec::new(),
        }
    }

    async fn next_message(&mut self) -> Message {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            let WsMessage::Text(text) = frame else { continue };
            let fragment = Fragment::parse(text.as_str()).unwrap();
            if let Some(message) = self.inbound.push(fragment).unwrap() {
                return message;
            }
        }
    }

    /// Send `command` and wait for its reply, keeping notifications that
    /// arrive in between.
    async fn call(&mut self, command: &str, data: Value) -> Value {
        let request = Message::request(command, data.to_string());
        for fragment in request.clone().into_fragments(64) {
            self.socket
                .send(WsMessage::Text(fragment.to_json().unwrap().into()))
                .await
                .unwrap();
        }
        loop {
            let message = self.next_message().await;
            if message.reply_to.as_deref() == Some(request.id.as_str()) && message.id != request.id {
                return serde_json::from_str(&message.data).unwrap();
            }
            if message.command == "watchevent" {
                self.notifications.push(message);
            }
        }
    }

    async fn signin(&mut self, sub: &str) -> Value {
        let token = encode(
            &Header::default(),
            &json!({ "sub": sub }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        self.call("signin", json!({ "jwt": token })).await
    }

    async fn next_notification(&mut self) -> Value {
        if !self.notifications.is_empty() {
            let message = self.notifications.remove(0);
            return serde_json::from_str(&message.data).unwrap();
        }
        loop {
            let message = self.next_message().await;
            if message.command == "watchevent" {
                return serde_json::from_str(&message.data).unwrap();
            }
        }
    }
}

async fn start() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let db = Arc::new(MemoryDatabase::new());
    for (id, name) in [("alice", "Alice"), ("bob", "Bob")] {
        let user = json!({"_id": id, "_type": "user", "name": name, "username": id});
        db.insert_one("users", Document::from_value(user).unwrap())
            .await
            .unwrap();
    }
    let config = StoreConfig {
        heartbeat_interval_ms: 60_000,
        package_size: 256,
        ..Default::default()
    };
    let store = Arc::new(DocumentStore::new(db, config));
    let registry = Arc::new(ConnectionRegistry::new());
    Arc::new(ChangeWatcher::new(store.clone(), registry.clone(), Arc::new(NoopHooks))).spawn();
    let app = api::router(AppState {
        store,
        registry,
        verifier: Arc::new(Hs256Verifier::new(SECRET.to_string())),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).into_future().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, server)
}

#[tokio::test]
async fn signin_then_crud_over_fragments() {
    let (addr, server) = start().await;
    let mut alice = Client::connect(addr).await;

    let denied = alice.call("query", json!({"collectionname": "notes"})).await;
    assert_eq!(denied["kind"], "access_denied");

    let bad = alice.call("signin", json!({"jwt": "not-a-token"})).await;
    assert_eq!(bad["kind"], "access_denied");

    let me = alice.signin("alice").await;
    assert_eq!(me["user"]["_id"], "alice");

    let long_text = "lorem ipsum ".repeat(100);
    let created = alice
        .call(
            "insertone",
            json!({"collectionname": "notes", "item": {"_type": "note", "text": long_text}}),
        )
        .await;
    let id = created["result"]["_id"].as_str().unwrap().to_string();
    assert_eq!(created["result"]["_version"], 0);

    let updated = alice
        .call(
            "updateone",
            json!({"collectionname": "notes", "query": {"_id": id}, "item": {"$set": {"text": "short"}}}),
        )
        .await;
    assert_eq!(updated["result"]["_version"], 1);

    let found = alice
        .call("query", json!({"collectionname": "notes", "query": {"_id": id}}))
        .await;
    assert_eq!(found["result"][0]["text"], "short");

    let old = alice
        .call(
            "getdocumentversion",
            json!({"collectionname": "notes", "id": id, "version": 0}),
        )
        .await;
    assert_eq!(old["result"]["text"], long_text);

    let removed = alice
        .call("deleteone", json!({"collectionname": "notes", "id": id}))
        .await;
    assert_eq!(removed["affectedrows"], 1);
    let count = alice
        .call("count", json!({"collectionname": "notes"}))
        .await;
    assert_eq!(count["result"], 0);

    server.abort();
}

#[tokio::test]
async fn notifications_reach_readers_only() {
    let (addr, server) = start().await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    alice.signin("alice").await;
    bob.signin("bob").await;

    let watch = alice.call("watch", json!({"collectionname": "notes"})).await;
    assert!(watch["id"].is_string());
    bob.call("watch", json!({"collectionname": "notes"})).await;

    alice
        .call(
            "insertone",
            json!({"collectionname": "notes", "item": {"_type": "note", "text": "private"}}),
        )
        .await;
    let note = alice.next_notification().await;
    assert_eq!(note["collection"], "notes");
    assert_eq!(note["operationType"], "insert");
    assert_eq!(note["document"]["text"], "private");
    assert_eq!(note["watchId"], watch["id"]);

    bob.call("ping", json!({})).await;
    assert!(bob.notifications.is_empty());

    let gone = alice.call("unwatch", json!({"id": "missing"})).await;
    assert_eq!(gone["kind"], "not_found");

    server.abort();
}
