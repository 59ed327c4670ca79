//! Worker death, recovery and capacity as seen through the session layer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use sfu_controller::config::WorkerRecovery;
use sfu_controller::engine::TransportDirection;
use sfu_controller::errors::SfuError;
use sfu_controller::registry::StreamKind;
use sfu_controller::session::messages::{ClientEvent, ServerEvent};
use sfu_controller::session::state::SessionState;
use sfu_controller::workers::WorkerId;
use sfu_test_utils::{TestHarness, TestParticipant};
use std::time::Duration;

/// Poll `check` until it holds or roughly five seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn worker_of(harness: &TestHarness, room_id: &str) -> (WorkerId, u32) {
    let entry = harness.controller.routers().get(room_id).unwrap();
    let pid = harness.controller.pool().get(entry.worker_id).unwrap().pid;
    (entry.worker_id, pid)
}

#[tokio::test]
async fn test_rooms_are_spread_across_workers() {
    let harness = TestHarness::builder().workers(3).build().await;
    let _a = harness.joined("a", "room-a").await;
    let _b = harness.joined("b", "room-b").await;
    let _c = harness.joined("c", "room-c").await;
    let _d = harness.joined("d", "room-d").await;

    let stats = harness.controller.pool().stats();
    assert_eq!(stats.distribution, vec![2, 1, 1]);
    assert!(stats.is_balanced);
    assert_eq!(harness.engine.router_count(), 4);
}

#[tokio::test]
async fn test_fatal_worker_death_evicts_its_rooms() {
    let harness = TestHarness::start().await;
    let _alice = harness.joined("alice", "room-1").await;
    let _bob = harness.joined("bob", "room-2").await;
    let (dead, pid) = worker_of(&harness, "room-1");
    let (survivor, _) = worker_of(&harness, "room-2");
    assert_ne!(dead, survivor);

    assert!(harness.engine.kill_worker(pid));
    let fatal = harness.controller.fatal_token();
    assert!(eventually(|| fatal.is_cancelled()).await);

    assert!(harness.controller.routers().get("room-1").is_none());
    assert!(harness.controller.routers().get("room-2").is_some());
    assert!(!harness.controller.pool().get(dead).unwrap().is_active);
    assert_eq!(harness.controller.pool().least_loaded().unwrap().id, survivor);
}

#[tokio::test]
async fn test_respawned_worker_replaces_dead_one() {
    let harness = TestHarness::builder()
        .recovery(WorkerRecovery::Respawn)
        .respawn_backoff(Duration::from_millis(50))
        .build()
        .await;
    let _alice = harness.joined("alice", "room-1").await;
    let (dead, pid) = worker_of(&harness, "room-1");

    harness.engine.kill_worker(pid);
    let pool = harness.controller.pool();
    assert!(eventually(|| pool.stats().total == 3).await);

    let stats = pool.stats();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.inactive, 1);
    assert!(!pool.get(dead).unwrap().is_active);
    assert!(!harness.controller.fatal_token().is_cancelled());
    assert_eq!(harness.engine.worker_pids().len(), 2);
}

#[tokio::test]
async fn test_room_gets_new_router_after_worker_death() {
    let harness = TestHarness::builder()
        .recovery(WorkerRecovery::Respawn)
        .respawn_backoff(Duration::from_secs(60))
        .build()
        .await;
    let mut alice = harness.ready("alice", "room-1").await;
    alice.produce(StreamKind::Audio).await;
    let (dead, pid) = worker_of(&harness, "room-1");

    harness.engine.kill_worker(pid);
    let routers = harness.controller.routers();
    assert!(eventually(|| routers.get("room-1").is_none()).await);

    // membership survives the eviction
    assert_eq!(
        harness.snapshot("alice").unwrap().state,
        SessionState::Active
    );

    alice.create_transport(TransportDirection::Send).await;
    let (worker, _) = worker_of(&harness, "room-1");
    assert_ne!(worker, dead);
    assert!(harness.snapshot("alice").unwrap().producers.is_empty());

    let mut bob = harness.joined("bob", "room-1").await;
    assert_eq!(worker_of(&harness, "room-1").0, worker);
    assert!(bob.try_recv().is_none());
}

#[tokio::test]
async fn test_worker_death_releases_media_of_its_rooms() {
    let harness = TestHarness::builder()
        .recovery(WorkerRecovery::Respawn)
        .respawn_backoff(Duration::from_secs(60))
        .build()
        .await;
    let mut alice = harness.ready("alice", "room-1").await;
    let audio = alice.produce(StreamKind::Audio).await;
    let mut bob = harness.ready("bob", "room-1").await;
    bob.consume_now(&audio).await;
    bob.drain();
    let (_, pid) = worker_of(&harness, "room-1");

    harness.engine.kill_worker(pid);
    let registry = harness.controller.registry();
    assert!(eventually(|| registry.snapshot("bob").unwrap().consumers.is_empty()).await);

    assert!(registry.streams("room-1", None).is_empty());
    assert_eq!(registry.index_consistency("room-1"), Some((0, 0)));
    let alice_state = harness.snapshot("alice").unwrap();
    assert_eq!(alice_state.state, SessionState::Active);
    assert!(alice_state.producers.is_empty());
    assert!(alice_state.send_transport.is_none());
    assert!(alice_state.recv_transport.is_none());
    assert!(!alice_state.metadata.mic_on);
    assert!(harness.snapshot("bob").unwrap().recv_transport.is_none());

    assert_eq!(
        bob.drain(),
        vec![ServerEvent::StreamClosed {
            stream_id: audio.clone(),
            uid: "alice".to_string(),
        }]
    );
    let err = bob.consume(&audio).await.unwrap_err();
    assert_eq!(err.error_code(), 4);
}

#[tokio::test]
async fn test_join_fails_when_every_worker_is_saturated() {
    let harness = TestHarness::builder()
        .workers(1)
        .max_routers_per_worker(1)
        .build()
        .await;
    let _alice = harness.joined("alice", "room-1").await;

    let mut bob = harness.connect("bob");
    let err = bob
        .request(ClientEvent::Join {
            room_id: "room-2".to_string(),
            metadata: TestParticipant::new("bob").metadata,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::Capacity));
    assert!(harness.snapshot("bob").is_none());

    bob.dispatch(ClientEvent::Join {
        room_id: "room-2".to_string(),
        metadata: Default::default(),
    })
    .await;
    assert_eq!(
        bob.recv().await,
        ServerEvent::Error {
            event: "join".to_string(),
            code: 7,
            message: "Server is at capacity, please try again".to_string(),
        }
    );

    // the existing room still accepts members
    harness.joined("carol", "room-1").await;
}

#[tokio::test]
async fn test_shutdown_releases_every_engine_object() {
    let harness = TestHarness::start().await;
    let mut alice = harness.ready("alice", "room-1").await;
    alice.produce(StreamKind::Video).await;
    let _bob = harness.joined("bob", "room-2").await;

    let TestHarness {
        engine, controller, ..
    } = harness;
    let fatal = controller.fatal_token();
    controller.shutdown().await;

    assert_eq!(engine.router_count(), 0);
    assert!(engine.worker_pids().is_empty());
    // closing workers on shutdown is not a worker death
    assert!(!fatal.is_cancelled());
}
