//! End-to-end placement scenarios: single-key placement across two stages,
//! overlap merging, foreign-owner routing, and the fatal conflicting
//! overlap.

mod common;

use std::time::Duration;

use common::{keyed_msg, link, start_stage};
use troupe::kv::MemoryKvStore;
use troupe::{MapperError, ReceiverId, StageId};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn single_key_placement_routes_through_owner() {
    let kv = MemoryKvStore::new();
    let (stage_a, seen_a) = start_stage(1, kv.clone()).await;
    let (stage_b, seen_b) = start_stage(2, kv.clone()).await;
    link(&stage_a, &stage_b);

    // First message lands at A; A claims the key.
    stage_a.emit(keyed_msg("k1:first")).await.unwrap();
    settle().await;

    // Second message for the same key lands at B; B discovers A's claim
    // through the registry and proxies.
    stage_b.emit(keyed_msg("k1:second")).await.unwrap();
    settle().await;

    let seen_a = seen_a.lock().unwrap().clone();
    assert_eq!(
        seen_a.iter().map(|(_, p)| p.as_str()).collect::<Vec<_>>(),
        vec!["k1:first", "k1:second"],
    );
    // One receiver, hosted on A.
    assert_eq!(seen_a[0].0, seen_a[1].0);
    assert_eq!(seen_a[0].0.stage, StageId(1));
    assert!(seen_b.lock().unwrap().is_empty());

    // B holds a proxy under the owner's id.
    let owner = seen_a[0].0.clone();
    let found = stage_b
        .mapper("weather")
        .unwrap()
        .find_receiver(owner.clone())
        .await
        .unwrap();
    assert_eq!(found, owner);

    stage_a.stop().await.unwrap();
    stage_b.stop().await.unwrap();
}

#[tokio::test]
async fn overlapping_map_sets_merge_onto_one_receiver() {
    let kv = MemoryKvStore::new();
    let (stage_a, seen_a) = start_stage(1, kv.clone()).await;

    stage_a.emit(keyed_msg("a:one")).await.unwrap();
    stage_a.emit(keyed_msg("a,b:two")).await.unwrap();
    // After the overlap, key b alone must reach the same receiver.
    stage_a.emit(keyed_msg("b:three")).await.unwrap();
    settle().await;

    let seen = seen_a.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(id, _)| *id == seen[0].0));
    // Delivery order is preserved per receiver.
    assert_eq!(
        seen.iter().map(|(_, p)| p.as_str()).collect::<Vec<_>>(),
        vec!["a:one", "a,b:two", "b:three"],
    );

    stage_a.stop().await.unwrap();
}

#[tokio::test]
async fn foreign_owner_is_routed_not_fatal() {
    let kv = MemoryKvStore::new();
    let (stage_a, seen_a) = start_stage(1, kv.clone()).await;
    let (stage_b, seen_b) = start_stage(2, kv.clone()).await;
    link(&stage_a, &stage_b);

    stage_a.emit(keyed_msg("a:registered-at-a")).await.unwrap();
    settle().await;

    // B arrives after A registered: routed through a proxy, not fatal.
    stage_b.emit(keyed_msg("a:from-b")).await.unwrap();
    settle().await;

    let seen = seen_a.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen_b.lock().unwrap().is_empty());

    // B's mapper is alive and well.
    assert!(stage_b.mapper("weather").unwrap().new_receiver().await.is_ok());

    stage_a.stop().await.unwrap();
    stage_b.stop().await.unwrap();
}

#[tokio::test]
async fn conflicting_overlap_is_fatal_to_the_mapper() {
    let kv = MemoryKvStore::new();
    let (stage_a, seen_a) = start_stage(1, kv.clone()).await;
    let (stage_b, _seen_b) = start_stage(2, kv.clone()).await;
    link(&stage_a, &stage_b);

    // Two distinct receivers on A own keys a and c.
    stage_a.emit(keyed_msg("a:left")).await.unwrap();
    stage_a.emit(keyed_msg("c:right")).await.unwrap();
    settle().await;
    {
        let seen = seen_a.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].0, seen[1].0);
    }

    // A map-set straddling both live claims is a contract violation; B's
    // mapper terminates.
    stage_b.emit(keyed_msg("a,c:straddle")).await.unwrap();
    settle().await;

    let err = stage_b
        .mapper("weather")
        .unwrap()
        .new_receiver()
        .await
        .unwrap_err();
    assert!(matches!(err, MapperError::Stopped { .. }));

    stage_a.stop().await.unwrap();
    stage_b.stop().await.unwrap();
}

#[tokio::test]
async fn messages_to_one_receiver_stay_fifo() {
    let kv = MemoryKvStore::new();
    let (stage_a, seen_a) = start_stage(1, kv.clone()).await;

    for i in 0..20 {
        stage_a.emit(keyed_msg(&format!("k:{i}"))).await.unwrap();
    }
    settle().await;

    let seen = seen_a.lock().unwrap().clone();
    let payloads: Vec<String> = seen.iter().map(|(_, p)| p.clone()).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("k:{i}")).collect();
    assert_eq!(payloads, expected);

    stage_a.stop().await.unwrap();
}

#[tokio::test]
async fn lost_placement_race_rewinds_the_counter() {
    let kv = MemoryKvStore::new();
    let (stage_a, _seen_a) = start_stage(1, kv.clone()).await;
    let (stage_b, seen_b) = start_stage(2, kv.clone()).await;
    link(&stage_a, &stage_b);

    // A owns key a. B loses that placement, then wins a fresh one: the
    // lost race must not burn a receiver number.
    stage_a.emit(keyed_msg("a:owner")).await.unwrap();
    settle().await;
    stage_b.emit(keyed_msg("a:loses")).await.unwrap();
    settle().await;
    stage_b.emit(keyed_msg("b:wins")).await.unwrap();
    settle().await;

    let seen = seen_b.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, ReceiverId::new(StageId(2), "weather", 1));

    stage_a.stop().await.unwrap();
    stage_b.stop().await.unwrap();
}
