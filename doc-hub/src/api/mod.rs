//! Websocket endpoint speaking the fragment protocol.

mod commands;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use doc_hub_core::auth::TokenVerifier;
use doc_hub_core::transport::{run_heartbeat, run_writer, Connection, ConnectionRegistry, Fragment, Message};
use doc_hub_core::DocumentStore;
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use commands::dispatch;

/// Shared state of the websocket endpoint.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn, outbound) = Connection::new(state.store.config());
    state.registry.register(conn.clone());
    info!(connection = %conn.id(), "websocket connected");

    let (sender, mut receiver) = socket.split();
    let sink = sender.with(|text: String| future::ready(Ok::<_, axum::Error>(WsMessage::Text(text.into()))));
    let writer = tokio::spawn(run_writer(conn.clone(), outbound, sink));
    let heartbeat = tokio::spawn(run_heartbeat(
        conn.clone(),
        state.store.config().heartbeat_interval(),
    ));

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = conn.closed() => break,
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(connection = %conn.id(), error = %e, "websocket read failed");
                break;
            }
        };
        let message = match Fragment::parse(text.as_str()).and_then(|f| conn.receive(f)) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                warn!(connection = %conn.id(), error = %e, "dropping inbound frame");
                continue;
            }
        };
        let state = state.clone();
        let conn = conn.clone();
        tokio::spawn(async move { respond(&state, &conn, message).await });
    }

    conn.close();
    state.registry.remove(conn.id());
    let _ = writer.await;
    let _ = heartbeat.await;
    info!(connection = %conn.id(), "websocket disconnected");
}

async fn respond(state: &AppState, conn: &Arc<Connection>, message: Message) {
    let reply = match dispatch(state, conn, &message).await {
        Ok(data) => message.reply(data.to_string()),
        Err(e) => {
            debug!(connection = %conn.id(), command = %message.command, error = %e, "command failed");
            message.error_reply(&e)
        }
    };
    if let Err(e) = conn.send(reply).await {
        debug!(connection = %conn.id(), error = %e, "reply not delivered");
    }
}
