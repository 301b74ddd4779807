//! Integration tests for queued delivery: ordering, offline buffering,
//! resume replay and fan-out across a user's connections.

mod common;

use bytes::Bytes;
use common::server::{ALICE, BOB};
use common::{TestServer, eventually};
use pulse_proto::{ClientFrame, ServerFrame};
use pulsed::telemetry::Event;
use std::time::Duration;

fn event(n: u64) -> Bytes {
    Bytes::from(format!(r#"{{"kind":"step","n":{n}}}"#))
}

fn seq_of(frame: &ServerFrame) -> Option<u64> {
    match frame {
        ServerFrame::Event { seq, .. } => Some(*seq),
        _ => None,
    }
}

#[tokio::test]
async fn events_arrive_in_sequence_order() {
    let server = TestServer::spawn().await.unwrap();
    let mut client = server.connect(ALICE).await.unwrap();

    for n in 1..=5 {
        assert_eq!(server.hub.publish("alice", event(n)), n);
    }

    let frames = client
        .recv_until(|f| seq_of(f) == Some(5))
        .await
        .unwrap();
    let seqs: Vec<u64> = frames.iter().filter_map(seq_of).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    match &frames[0] {
        ServerFrame::Event { payload, .. } => {
            assert_eq!(payload["kind"], "step");
            assert_eq!(payload["n"], 1);
        }
        other => panic!("expected event, got {other:?}"),
    }

    let hub = server.hub.clone();
    assert!(
        eventually(Duration::from_secs(1), || {
            hub.telemetry.get(Event::MessageDelivered) == 5
        })
        .await
    );
    assert_eq!(server.hub.queue.pending_len("alice"), 0);
}

#[tokio::test]
async fn offline_messages_follow_the_welcome() {
    let server = TestServer::spawn().await.unwrap();
    server.hub.publish("bob", event(1));
    server.hub.publish("bob", event(2));
    assert_eq!(server.hub.queue.pending_len("bob"), 2);

    let mut client = server.connect(BOB).await.unwrap();
    let first = client.recv().await.unwrap();
    let second = client.recv().await.unwrap();
    assert_eq!(seq_of(&first), Some(1));
    assert_eq!(seq_of(&second), Some(2));
}

#[tokio::test]
async fn resume_replays_newer_events() {
    let server = TestServer::spawn().await.unwrap();
    let mut client = server.connect(ALICE).await.unwrap();
    for n in 1..=3 {
        server.hub.publish("alice", event(n));
    }
    client.recv_until(|f| seq_of(f) == Some(3)).await.unwrap();
    client.close().await.unwrap();

    let hub = server.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.registry.is_empty()).await);

    let mut again = server.connect(ALICE).await.unwrap();
    again
        .send(&ClientFrame::Resume { after_seq: 1 })
        .await
        .unwrap();
    let first = again.recv().await.unwrap();
    let second = again.recv().await.unwrap();
    assert_eq!(seq_of(&first), Some(2));
    assert_eq!(seq_of(&second), Some(3));
    assert!(
        again
            .recv_timeout(Duration::from_millis(200))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn every_connection_of_a_user_receives_the_event() {
    let server = TestServer::spawn().await.unwrap();
    let mut first = server.connect(ALICE).await.unwrap();
    let mut second = server.connect(ALICE).await.unwrap();
    let mut other = server.connect(BOB).await.unwrap();

    server.hub.publish("alice", event(1));

    assert_eq!(seq_of(&first.recv().await.unwrap()), Some(1));
    assert_eq!(seq_of(&second.recv().await.unwrap()), Some(1));
    assert!(
        other
            .recv_timeout(Duration::from_millis(200))
            .await
            .is_err()
    );
}
