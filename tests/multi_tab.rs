//! Integration tests for multi-tab coordination over real connections:
//! leader election, failover, action dedup and shared state sync.

mod common;

use common::server::ALICE;
use common::{TestClient, TestServer};
use pulse_proto::{ClientFrame, ServerFrame};
use serde_json::{Map, Value, json};

async fn register(client: &mut TestClient, tab_id: &str) -> (bool, usize) {
    client
        .send(&ClientFrame::RegisterTab {
            tab_id: tab_id.to_string(),
        })
        .await
        .unwrap();
    let frames = client
        .recv_until(|f| matches!(f, ServerFrame::TabRegistered { .. }))
        .await
        .unwrap();
    match frames.last() {
        Some(ServerFrame::TabRegistered {
            is_leader,
            total_tabs,
            ..
        }) => (*is_leader, *total_tabs),
        other => panic!("expected tab_registered, got {other:?}"),
    }
}

fn approve(tab_id: &str, leader_only: bool) -> ClientFrame {
    ClientFrame::Action {
        tab_id: tab_id.to_string(),
        kind: "tool".to_string(),
        action: "approve".to_string(),
        target: "req-7".to_string(),
        at_ms: Some(1_700_000_000_000),
        leader_only,
        payload: Value::Null,
    }
}

fn is_action_reply(frame: &ServerFrame) -> bool {
    matches!(
        frame,
        ServerFrame::ActionAccepted { .. } | ServerFrame::Duplicate { .. } | ServerFrame::Error { .. }
    )
}

#[tokio::test]
async fn first_tab_leads() {
    let server = TestServer::spawn().await.unwrap();
    let mut t1 = server.connect(ALICE).await.unwrap();
    let mut t2 = server.connect(ALICE).await.unwrap();

    assert_eq!(register(&mut t1, "T1").await, (true, 1));
    assert_eq!(register(&mut t2, "T2").await, (false, 2));
    assert_eq!(server.hub.tabs.leader("alice").unwrap().tab_id, "T1");
}

#[tokio::test]
async fn leadership_moves_when_leader_disconnects() {
    let server = TestServer::spawn().await.unwrap();
    let mut t1 = server.connect(ALICE).await.unwrap();
    let mut t2 = server.connect(ALICE).await.unwrap();
    register(&mut t1, "T1").await;
    register(&mut t2, "T2").await;

    t1.close().await.unwrap();

    let frames = t2
        .recv_until(|f| {
            matches!(f, ServerFrame::LeadershipChanged { leader_tab_id } if leader_tab_id == "T2")
        })
        .await
        .unwrap();
    assert!(!frames.is_empty());
    assert_eq!(server.hub.tabs.leader("alice").unwrap().tab_id, "T2");
}

#[tokio::test]
async fn same_action_from_two_tabs_is_handled_once() {
    let server = TestServer::spawn().await.unwrap();
    let mut t1 = server.connect(ALICE).await.unwrap();
    let mut t2 = server.connect(ALICE).await.unwrap();
    register(&mut t1, "T1").await;
    register(&mut t2, "T2").await;

    t1.send(&approve("T1", false)).await.unwrap();
    let first = t1.recv_until(is_action_reply).await.unwrap();
    let accepted = match first.last() {
        Some(ServerFrame::ActionAccepted { fingerprint }) => fingerprint.clone(),
        other => panic!("expected action_accepted, got {other:?}"),
    };

    t2.send(&approve("T2", false)).await.unwrap();
    let second = t2.recv_until(is_action_reply).await.unwrap();
    match second.last() {
        Some(ServerFrame::Duplicate { fingerprint }) => assert_eq!(fingerprint, &accepted),
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[tokio::test]
async fn leader_only_action_from_follower_is_refused() {
    let server = TestServer::spawn().await.unwrap();
    let mut t1 = server.connect(ALICE).await.unwrap();
    let mut t2 = server.connect(ALICE).await.unwrap();
    register(&mut t1, "T1").await;
    register(&mut t2, "T2").await;

    t2.send(&approve("T2", true)).await.unwrap();
    let frames = t2.recv_until(is_action_reply).await.unwrap();
    assert!(matches!(
        frames.last(),
        Some(ServerFrame::Error { code, .. }) if code == "not_leader"
    ));
}

#[tokio::test]
async fn state_sync_reaches_sibling_tabs() {
    let server = TestServer::spawn().await.unwrap();
    let mut t1 = server.connect(ALICE).await.unwrap();
    let mut t2 = server.connect(ALICE).await.unwrap();
    register(&mut t1, "T1").await;
    register(&mut t2, "T2").await;

    let mut updates = Map::new();
    updates.insert("theme".to_string(), json!({"value": "dark", "timestamp": 10}));
    t1.send(&ClientFrame::SyncState {
        tab_id: "T1".to_string(),
        updates,
    })
    .await
    .unwrap();

    let reply = t1
        .recv_until(|f| matches!(f, ServerFrame::StateSync { .. }))
        .await
        .unwrap();
    match reply.last() {
        Some(ServerFrame::StateSync {
            version,
            source_tab_id,
            state,
            ..
        }) => {
            assert_eq!(*version, 1);
            assert_eq!(source_tab_id, "T1");
            assert_eq!(state["theme"]["value"], "dark");
        }
        other => panic!("expected state_sync, got {other:?}"),
    }

    let pushed = t2
        .recv_until(|f| matches!(f, ServerFrame::StateSync { .. }))
        .await
        .unwrap();
    assert!(matches!(
        pushed.last(),
        Some(ServerFrame::StateSync { source_tab_id, version: 1, .. }) if source_tab_id == "T1"
    ));
}
