//! Integration tests for cursor presence between workspaces.

use logos_sync::{
    ClientId, Color, ManualClock, MemoryStore, ObjectStore, PeerInfo, PresenceMap, PresenceStore, SyncConfig, Vec2,
    Workspace,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn config() -> SyncConfig {
    SyncConfig {
        presence_flush_throttle_ms: 33,
        presence_ttl_ms: 10_000,
        ..SyncConfig::default()
    }
}

fn shared_store() -> (Arc<ManualClock>, Arc<MemoryStore>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    (clock, store)
}

async fn join(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>, name: &str) -> Workspace {
    Workspace::start(PeerInfo::new(name), config(), store.clone(), store.clone(), clock.clone())
        .await
        .unwrap()
}

/// Wait until the presence map satisfies `pred`.
async fn wait_for_map<F>(rx: &mut watch::Receiver<PresenceMap>, pred: F) -> PresenceMap
where
    F: Fn(&PresenceMap) -> bool,
{
    let map = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|map| pred(map)))
        .await
        .expect("presence not observed in time")
        .expect("presence channel closed");
    map.clone()
}

fn position_of(map: &PresenceMap, client: ClientId) -> Option<Vec2> {
    map.get(&client).map(|record| record.position)
}

#[tokio::test]
async fn test_cursor_visible_to_other_client() {
    let (clock, store) = shared_store();
    let alice = join(&store, &clock, "Alice").await;
    let bob = join(&store, &clock, "Bob").await;
    let mut bob_view = bob.subscribe_presence();

    alice.publish_presence(Vec2::new(120.0, 80.0), "Alice", Color::rgba(1.0, 0.0, 0.0, 1.0)).await;

    let alice_id = alice.peer().peer_id;
    let map = wait_for_map(&mut bob_view, |map| map.contains_key(&alice_id)).await;
    let record = &map[&alice_id];
    assert_eq!(record.position, Vec2::new(120.0, 80.0));
    assert_eq!(record.label, "Alice");
    assert_eq!(record.color, Color::rgba(1.0, 0.0, 0.0, 1.0));
    assert_eq!(record.updated_at_ms, 1_000);

    // Our own record never shows up in our map.
    assert!(!alice.subscribe_presence().borrow().contains_key(&alice_id));
}

#[tokio::test(start_paused = true)]
async fn test_rapid_cursor_moves_are_coalesced() {
    let (clock, store) = shared_store();
    let alice = join(&store, &clock, "Alice").await;
    let bob = join(&store, &clock, "Bob").await;
    let mut bob_view = bob.subscribe_presence();
    let color = Color::from_uuid(alice.peer().peer_id);

    for i in 0..10 {
        alice.publish_presence(Vec2::new(i as f32, i as f32), "Alice", color).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let writes = store.stats().presence_writes;
    assert!(writes >= 2, "expected a leading and a trailing write, got {writes}");
    assert!(writes < 10, "presence was not throttled: {writes} writes");

    let alice_id = alice.peer().peer_id;
    let map = wait_for_map(&mut bob_view, |map| position_of(map, alice_id) == Some(Vec2::new(9.0, 9.0))).await;
    assert_eq!(map.len(), 1);
}

#[tokio::test]
async fn test_leave_removes_cursor() {
    let (clock, store) = shared_store();
    let alice = join(&store, &clock, "Alice").await;
    let bob = join(&store, &clock, "Bob").await;
    let mut bob_view = bob.subscribe_presence();
    let alice_id = alice.peer().peer_id;

    alice.publish_presence(Vec2::new(1.0, 2.0), "Alice", Color::rgba(0.0, 0.0, 1.0, 1.0)).await;
    wait_for_map(&mut bob_view, |map| map.contains_key(&alice_id)).await;

    alice.leave().await;
    wait_for_map(&mut bob_view, |map| !map.contains_key(&alice_id)).await;
    assert!(store.list_presence().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_cursor_is_pruned_but_fresh_one_survives() {
    let (clock, store) = shared_store();
    let alice = join(&store, &clock, "Alice").await;
    let carol = join(&store, &clock, "Carol").await;
    let bob = join(&store, &clock, "Bob").await;
    let mut bob_view = bob.subscribe_presence();
    let alice_id = alice.peer().peer_id;
    let carol_id = carol.peer().peer_id;

    alice.publish_presence(Vec2::new(5.0, 5.0), "Alice", Color::rgba(1.0, 1.0, 0.0, 1.0)).await;
    clock.advance(6_000);
    carol.publish_presence(Vec2::new(6.0, 6.0), "Carol", Color::rgba(0.0, 1.0, 1.0, 1.0)).await;
    wait_for_map(&mut bob_view, |map| map.contains_key(&alice_id) && map.contains_key(&carol_id)).await;

    // Alice went silent without leaving.
    clock.advance(5_000);
    assert_eq!(bob.presence().prune_stale().await, 1);

    let map = wait_for_map(&mut bob_view, |map| !map.contains_key(&alice_id)).await;
    assert!(map.contains_key(&carol_id));
    let stored: Vec<ClientId> = store.list_presence().await.unwrap().iter().map(|r| r.client_id).collect();
    assert_eq!(stored, vec![carol_id]);

    // A second pruner finds nothing left to do.
    assert_eq!(carol.presence().prune_stale().await, 0);
}

#[tokio::test]
async fn test_presence_never_touches_objects() {
    let (clock, store) = shared_store();
    let alice = join(&store, &clock, "Alice").await;
    let mut feed = store.subscribe();

    for i in 0..5 {
        alice.presence().force_publish(Vec2::new(i as f32, 0.0), "Alice", Color::rgba(1.0, 1.0, 1.0, 1.0)).await;
    }

    assert!(feed.try_recv().is_err());
    assert!(store.list().await.unwrap().is_empty());
    assert_eq!(store.stats().presence_writes, 5);
    assert_eq!(store.stats().commits, 0);
}
