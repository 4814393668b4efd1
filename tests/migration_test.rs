//! Live migration of a receiver between stages: ownership transfer,
//! old-id aliasing, and forwarding of traffic addressed to the old id.

mod common;

use std::time::Duration;

use common::{keyed_msg, link, start_stage};
use troupe::kv::{KvStore, MemoryKvStore};
use troupe::registry::RegVal;
use troupe::{Message, StageId};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn migration_moves_ownership_and_forwards_old_id() {
    let kv = MemoryKvStore::new();
    let (stage_a, seen_a) = start_stage(1, kv.clone()).await;
    let (stage_b, seen_b) = start_stage(2, kv.clone()).await;
    link(&stage_a, &stage_b);

    // Place a receiver on A owning keys m and n.
    stage_a.emit(keyed_msg("m,n:before")).await.unwrap();
    settle().await;
    let old_id = seen_a.lock().unwrap()[0].0.clone();
    assert_eq!(old_id.stage, StageId(1));

    // Move it to B.
    let new_id = stage_a.migrate(old_id.clone(), StageId(2)).await.unwrap();
    assert_eq!(new_id.stage, StageId(2));
    assert_ne!(new_id, old_id);

    // Ownership of every key was transferred in the registry.
    for key in ["m", "n"] {
        let entry = kv.get(&format!("/troupe/weather/d/{key}")).await.unwrap();
        let val: RegVal = serde_json::from_str(&entry.value).unwrap();
        assert!(val.is(&new_id), "key {key} still owned by {val}");
    }

    // A aliases the old id to the replacement proxy: looking up the old id
    // resolves to the new remote id.
    let mapper_a = stage_a.mapper("weather").unwrap();
    assert_eq!(mapper_a.find_receiver(old_id.clone()).await.unwrap(), new_id);
    assert_eq!(mapper_a.find_receiver(new_id.clone()).await.unwrap(), new_id);

    // Traffic addressed to the old id is forwarded to B, where the
    // migrated receiver executes it.
    stage_a
        .emit(Message::to_receiver(old_id.clone(), "after-unicast".as_bytes().to_vec()))
        .await
        .unwrap();
    // Keyed traffic for the transferred keys follows the rebind.
    stage_a.emit(keyed_msg("m:after-keyed")).await.unwrap();
    settle().await;

    let seen_b = seen_b.lock().unwrap().clone();
    let payloads: Vec<&str> = seen_b.iter().map(|(_, p)| p.as_str()).collect();
    assert!(payloads.contains(&"after-unicast"), "got {payloads:?}");
    assert!(payloads.contains(&"m:after-keyed"), "got {payloads:?}");
    assert!(seen_b.iter().all(|(id, _)| *id == new_id));

    // Nothing new executed on A after the stop.
    assert_eq!(seen_a.lock().unwrap().len(), 1);

    stage_a.stop().await.unwrap();
    stage_b.stop().await.unwrap();
}

#[tokio::test]
async fn migration_of_missing_receiver_fails_cleanly() {
    let kv = MemoryKvStore::new();
    let (stage_a, _seen_a) = start_stage(1, kv.clone()).await;
    let (stage_b, _seen_b) = start_stage(2, kv.clone()).await;
    link(&stage_a, &stage_b);

    let missing = troupe::ReceiverId::new(StageId(1), "weather", 42);
    let err = stage_a.migrate(missing, StageId(2)).await.unwrap_err();
    assert!(matches!(err, troupe::MapperError::ReceiverNotFound { .. }));

    // The mapper survives a failed migration.
    assert!(stage_a.mapper("weather").unwrap().new_receiver().await.is_ok());

    stage_a.stop().await.unwrap();
    stage_b.stop().await.unwrap();
}
