use super::*;
use crate::config::StoreConfig;
use crate::watch::WatchFilter;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

fn config(package_size: usize) -> StoreConfig {
    StoreConfig {
        package_size,
        ..Default::default()
    }
}

fn reassemble(fragments: Vec<Fragment>, limit: usize) -> Vec<Message> {
    let mut r = Reassembler::new(limit);
    fragments
        .into_iter()
        .filter_map(|f| r.push(f).unwrap())
        .collect()
}

#[test]
fn fragments_respect_size_and_utf8() {
    let msg = Message::request("query", "héllo wörld ✓");
    let fragments = msg.clone().into_fragments(4);
    assert!(fragments.len() > 1);
    assert!(fragments.iter().all(|f| f.data.len() <= 4));
    assert!(fragments.iter().all(|f| f.count == fragments.len()));
    let joined: String = fragments.iter().map(|f| f.data.as_str()).collect();
    assert_eq!(joined, msg.data);

    let empty = Message::request("ping", "").into_fragments(16);
    assert_eq!(empty.len(), 1);
    assert_eq!(empty[0].count, 1);
}

#[test]
fn interleaved_out_of_order_arrival_reassembles() {
    let a = Message::request("a", "a".repeat(50));
    let b = Message::notification("b", "0123456789".repeat(3));
    let mut fa = a.clone().into_fragments(7);
    let mut fb = b.clone().into_fragments(4);
    fa.reverse();
    let mut mixed = Vec::new();
    while !fa.is_empty() || !fb.is_empty() {
        if let Some(f) = fb.pop() {
            mixed.push(f);
        }
        if let Some(f) = fa.pop() {
            mixed.push(f);
        }
    }
    let done = reassemble(mixed, 100);
    assert_eq!(done.len(), 2);
    assert!(done.contains(&a));
    assert!(done.contains(&b));
}

#[test]
fn incomplete_messages_never_dispatch() {
    let mut fragments = Message::request("x", "abcdefgh").into_fragments(2);
    fragments.pop();
    let mut r = Reassembler::new(10);
    for f in fragments.iter().cloned().chain(fragments.iter().cloned()) {
        assert!(r.push(f).unwrap().is_none());
    }
    assert_eq!(r.pending(), 1);
}

#[test]
fn bad_frames_are_rejected() {
    let mut r = Reassembler::new(3);
    let base = Fragment {
        message_id: "m".into(),
        reply_to: None,
        command: "c".into(),
        data: String::new(),
        index: 0,
        count: 2,
    };
    assert!(matches!(
        r.push(Fragment { index: 2, ..base.clone() }),
        Err(TransportError::MalformedFrame(_))
    ));
    assert!(matches!(
        r.push(Fragment { count: 0, ..base.clone() }),
        Err(TransportError::MalformedFrame(_))
    ));
    assert!(matches!(
        r.push(Fragment { count: 4, ..base.clone() }),
        Err(TransportError::BufferOverflow { limit: 3, .. })
    ));

    assert!(r.push(base.clone()).unwrap().is_none());
    assert!(matches!(
        r.push(Fragment { index: 1, count: 3, ..base.clone() }),
        Err(TransportError::MalformedFrame(_))
    ));
    assert_eq!(r.pending(), 0);
    assert!(Fragment::parse("{not json").is_err());
}

#[test]
fn oldest_incomplete_message_is_dropped_at_capacity() {
    let mut r = Reassembler::new(10).with_max_pending(2);
    let first_of = |id: &str| Fragment {
        message_id: id.into(),
        reply_to: None,
        command: "c".into(),
        data: id.into(),
        index: 0,
        count: 2,
    };
    assert!(r.push(first_of("a")).unwrap().is_none());
    assert!(r.push(first_of("b")).unwrap().is_none());
    assert!(r.push(first_of("c")).unwrap().is_none());
    assert_eq!(r.pending(), 2);

    let rest = |id: &str| Fragment { index: 1, data: "!".into(), ..first_of(id) };
    assert_eq!(r.push(rest("b")).unwrap().map(|m| m.data), Some("b!".to_string()));
    assert!(r.push(rest("a")).unwrap().is_none(), "a was dropped and starts over");
    assert_eq!(r.pending(), 2);
}

#[test]
fn wire_shape_is_camel_case() {
    let f = Message::request("query", "{}").into_fragments(10).remove(0);
    let v: serde_json::Value = serde_json::from_str(&f.to_json().unwrap()).unwrap();
    assert!(v.get("messageId").is_some());
    assert!(v.get("replyTo").is_none());
    assert_eq!(v["index"], 0);
    assert_eq!(v["count"], 1);
    assert_eq!(Fragment::parse(&f.to_json().unwrap()).unwrap(), f);
}

#[tokio::test]
async fn replies_resolve_pending_requests() {
    let (conn, mut rx) = Connection::new(&config(8));
    let requester = conn.clone();
    let call = tokio::spawn(async move { requester.request("echo", "payload-123").await });

    let mut fragments = Vec::new();
    let mut request = None;
    while request.is_none() {
        let f = rx.recv().await.unwrap();
        let count = f.count;
        fragments.push(f);
        if fragments.len() == count {
            request = reassemble(std::mem::take(&mut fragments), 10).pop();
        }
    }
    let request = request.unwrap();
    assert_eq!(request.data, "payload-123");
    assert_eq!(conn.pending_requests(), 1);

    for f in request.reply("pong-data").into_fragments(3) {
        assert!(conn.receive(f).unwrap().is_none());
    }
    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.data, "pong-data");
    assert_eq!(conn.pending_requests(), 0);
}

#[tokio::test]
async fn error_replies_reject() {
    let (conn, mut rx) = Connection::new(&config(4096));
    let requester = conn.clone();
    let call = tokio::spawn(async move { requester.request("op", "{}").await });
    let f = rx.recv().await.unwrap();
    let request = reassemble(vec![f], 10).pop().unwrap();
    let err = crate::error::StoreError::denied("nope");
    conn.receive(request.error_reply(&err).into_fragments(4096).remove(0))
        .unwrap();
    assert!(matches!(call.await.unwrap(), Err(TransportError::Rejected(_))));
}

#[tokio::test]
async fn inbound_requests_are_dispatched() {
    let (conn, _rx) = Connection::new(&config(4096));
    let msg = Message::request("query", "{}");
    let out = conn.receive(msg.clone().into_fragments(4096).remove(0)).unwrap();
    assert_eq!(out, Some(msg));
    let stray = Message::request("x", "{}").reply("{}");
    assert!(conn.receive(stray.into_fragments(4096).remove(0)).unwrap().is_some());
}

#[tokio::test]
async fn closing_rejects_waiters_and_drops_state() {
    let (conn, _rx) = Connection::new(&config(4096));
    conn.watch("widgets", WatchFilter::All);
    let requester = conn.clone();
    let call = tokio::spawn(async move { requester.request("slow", "{}").await });
    tokio::time::timeout(Duration::from_secs(1), async {
        while conn.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let partial = Message::request("big", "abcdef").into_fragments(2).remove(0);
    conn.receive(partial).unwrap();
    assert_eq!(conn.buffered_messages(), 1);

    conn.close();
    conn.close();
    assert!(matches!(call.await.unwrap(), Err(TransportError::ConnectionClosed)));
    assert_eq!(conn.subscription_count(), 0);
    assert_eq!(conn.buffered_messages(), 0);
    assert!(matches!(
        conn.send(Message::request("x", "")).await,
        Err(TransportError::ConnectionClosed)
    ));
    conn.closed().await;
}

#[tokio::test]
async fn notifications_shed_when_the_queue_is_full() {
    let cfg = StoreConfig {
        outbound_queue: 2,
        package_size: 4,
        ..Default::default()
    };
    let (conn, mut rx) = Connection::new(&cfg);
    assert!(matches!(
        conn.try_notify(Message::notification("n", "123456789")),
        Err(TransportError::QueueFull)
    ));
    conn.try_notify(Message::notification("n", "1234")).unwrap();
    conn.try_notify(Message::notification("n", "5678")).unwrap();
    assert!(matches!(
        conn.try_notify(Message::notification("n", "9")),
        Err(TransportError::QueueFull)
    ));
    assert_eq!(rx.recv().await.unwrap().data, "1234");
}

#[tokio::test]
async fn writer_flushes_in_order_and_closes_on_failure() {
    let (conn, rx) = Connection::new(&config(3));
    let (sink, mut wire) = fmpsc::unbounded::<String>();
    let writer = tokio::spawn(run_writer(conn.clone(), rx, sink));

    conn.send(Message::request("c", "abcdefgh")).await.unwrap();
    let mut data = String::new();
    for expected in 0..3 {
        let text = wire.next().await.unwrap();
        let f = Fragment::parse(&text).unwrap();
        assert_eq!(f.index, expected);
        data.push_str(&f.data);
    }
    assert_eq!(data, "abcdefgh");

    wire.close();
    drop(wire);
    let _ = conn.send(Message::request("c", "x")).await;
    tokio::time::timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
    assert!(conn.is_closed());
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_one_ping_outstanding() {
    let (conn, mut rx) = Connection::new(&StoreConfig {
        heartbeat_interval_ms: 1000,
        ..Default::default()
    });
    let beat = tokio::spawn(run_heartbeat(conn.clone(), Duration::from_millis(1000)));
    for _ in 0..3 {
        let ping = rx.recv().await.unwrap();
        assert_eq!(ping.command, "ping");
    }
    assert_eq!(conn.pending_requests(), 1);
    conn.close();
    tokio::time::timeout(Duration::from_secs(5), beat).await.unwrap().unwrap();
}

#[test]
fn registry_prunes_and_disconnects() {
    let registry = ConnectionRegistry::new();
    let (a, _ra) = Connection::new(&StoreConfig::default());
    let (b, _rb) = Connection::new(&StoreConfig::default());
    let (c, _rc) = Connection::new(&StoreConfig::default());
    a.set_subject(crate::auth::Subject::new("alice", "alice"));
    b.set_subject(crate::auth::Subject::new("alice", "alice"));
    for conn in [&a, &b, &c] {
        registry.register(Arc::clone(conn));
    }
    assert_eq!(registry.disconnect_subject("alice"), 2);
    assert!(a.is_closed() && b.is_closed());
    assert_eq!(registry.len(), 1);

    c.close();
    assert_eq!(registry.prune_closed(), 1);
    assert!(registry.is_empty());
}
