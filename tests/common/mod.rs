//! Shared fixtures for the integration tests: a recording handler whose
//! key-set is encoded in the message payload, and helpers to start linked
//! stages over one in-memory registry store.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use troupe::actor::{Handler, MapContext, RcvContext};
use troupe::kv::MemoryKvStore;
use troupe::{DictionaryKey, MapSet, Message, ReceiverId, Stage, StageConfig, StageId};

/// What a handler observed: executing receiver and message payload.
pub type Recorder = Arc<Mutex<Vec<(ReceiverId, String)>>>;

/// Handler whose map-set is written in the payload: `"a,b:body"` touches
/// keys `(d, a)` and `(d, b)`. Payloads without `:` map to themselves.
pub struct KeyedRecorder {
    pub seen: Recorder,
}

#[async_trait]
impl Handler for KeyedRecorder {
    fn map(&self, msg: &Message, _ctx: &MapContext) -> MapSet {
        let payload = String::from_utf8_lossy(&msg.payload).to_string();
        let keys = payload
            .split_once(':')
            .map(|(keys, _)| keys.to_string())
            .unwrap_or(payload);
        MapSet::new(
            keys.split(',')
                .map(|key| DictionaryKey::new("d", key.trim().to_string()))
                .collect(),
        )
    }

    async fn rcv(&self, msg: Message, ctx: &mut RcvContext) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((
            ctx.id().clone(),
            String::from_utf8_lossy(&msg.payload).to_string(),
        ));
        Ok(())
    }
}

/// Test-friendly configuration: short TTLs so self-healing scenarios run
/// fast, defaults otherwise.
pub fn test_config() -> StageConfig {
    StageConfig {
        registry_ttl_ms: 5_000,
        lock_acquire_timeout_ms: 5_000,
        reclaim_interval_ms: 2_000,
        ..StageConfig::default()
    }
}

/// Start a stage with the `weather` actor registered on a recording
/// handler.
pub async fn start_stage(id: u64, kv: Arc<MemoryKvStore>) -> (Stage, Recorder) {
    let stage = Stage::start(StageId(id), test_config(), Some(kv), None)
        .await
        .expect("stage start");
    let seen: Recorder = Arc::new(Mutex::new(Vec::new()));
    stage
        .register_actor("weather", KeyedRecorder { seen: seen.clone() })
        .expect("register actor");
    (stage, seen)
}

/// Teach two stages each other's addresses.
pub fn link(a: &Stage, b: &Stage) {
    a.add_peer(b.id(), b.addr());
    b.add_peer(a.id(), a.addr());
}

/// Build a keyed message for the `weather` actor.
pub fn keyed_msg(payload: &str) -> Message {
    Message::to_actor("weather", payload.as_bytes().to_vec())
}
