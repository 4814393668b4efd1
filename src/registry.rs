//! Cluster-wide ownership registry.
//!
//! Wraps the linearizable KV contract with the placement protocol: per-actor
//! advisory locks, the `store_or_get` claim primitive, the forced `set` used
//! by migration, and TTL refresh for live receivers.
//!
//! Key layout (wire contract):
//! - `/<prefix>/<actor>/__lock__` — actor-wide advisory mutex.
//! - `/<prefix>/<actor>/<dict>/<key>` — owner record of a single key.
//!
//! Values are JSON `{"stage_id": <u64>, "rcvr_id": <u32>}`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::kv::{KvError, KvStore};
use crate::types::{ActorName, DictionaryKey, MapSet, ReceiverId, StageId};

const LOCK_FILE_NAME: &str = "__lock__";

/// Upper bound of the jitter applied after a lock watch wakes up.
const LOCK_RETRY_JITTER_MS: u64 = 10;

/// Longest a single lock watch is allowed to sleep. A release notification
/// can slip between a failed create and the watch registration; re-trying
/// the create on this cadence bounds that window.
const LOCK_WATCH_POLL: Duration = Duration::from_millis(250);

/// An ownership record: which receiver owns a key (or holds an actor lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegVal {
    /// Stage hosting the owner.
    pub stage_id: StageId,
    /// Receiver number of the owner on that stage.
    pub rcvr_id: u32,
}

impl RegVal {
    /// The record naming `id` as owner.
    pub fn of(id: &ReceiverId) -> Self {
        Self {
            stage_id: id.stage,
            rcvr_id: id.rcvr,
        }
    }

    /// Whether this record names `id`.
    pub fn is(&self, id: &ReceiverId) -> bool {
        self.stage_id == id.stage && self.rcvr_id == id.rcvr
    }

    /// Expand the record back into a receiver id for `actor`.
    pub fn receiver_id(&self, actor: &ActorName) -> ReceiverId {
        ReceiverId {
            stage: self.stage_id,
            actor: actor.clone(),
            rcvr: self.rcvr_id,
        }
    }
}

impl std::fmt::Display for RegVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stage_id, self.rcvr_id)
    }
}

/// Errors from registry operations.
#[derive(Debug, Snafu)]
pub enum RegistryError {
    /// `unlock_actor` found a lock held by someone else. Never retried.
    #[snafu(display("lock for actor {actor} is held by {held_by}, not {requester}"))]
    ForeignLock {
        /// Actor whose lock was inspected.
        actor: ActorName,
        /// Current holder.
        held_by: RegVal,
        /// The caller.
        requester: RegVal,
    },

    /// The actor lock could not be acquired within the configured budget.
    #[snafu(display("timed out acquiring lock for actor {actor} after {waited:?}"))]
    AcquireTimeout {
        /// Actor whose lock was contended.
        actor: ActorName,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A map-set straddles two distinct live claims. This is a handler
    /// contract violation and is fatal to the caller.
    #[snafu(display(
        "inconsistent ownership for receiver {requester}: {first} vs {second}"
    ))]
    PlacementInconsistency {
        /// The claiming receiver.
        requester: RegVal,
        /// First foreign owner observed.
        first: RegVal,
        /// Conflicting second foreign owner.
        second: RegVal,
    },

    /// The underlying store failed.
    #[snafu(display("registry store failure: {source}"))]
    Store {
        /// The KV error.
        source: KvError,
    },

    /// A stored record could not be decoded.
    #[snafu(display("corrupt registry record at {key}: {source}"))]
    Codec {
        /// The record's key.
        key: String,
        /// The JSON error.
        source: serde_json::Error,
    },
}

/// Client for the cluster-wide ownership registry.
pub struct Registry {
    store: Arc<dyn KvStore>,
    prefix: String,
    ttl: Duration,
    lock_acquire_timeout: Duration,
}

impl Registry {
    /// Wrap a KV store with the registry protocol.
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        ttl: Duration,
        lock_acquire_timeout: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            lock_acquire_timeout,
        }
    }

    fn lock_path(&self, actor: &ActorName) -> String {
        format!("{}/{}/{}", self.prefix, actor, LOCK_FILE_NAME)
    }

    fn key_path(&self, actor: &ActorName, dk: &DictionaryKey) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix,
            actor,
            String::from_utf8_lossy(&dk.dict),
            String::from_utf8_lossy(&dk.key),
        )
    }

    /// Acquire the actor-wide advisory lock for `id`.
    ///
    /// Loops on create / watch until the lock key can be created, the
    /// acquire budget runs out, or the store fails. A crashed holder's lock
    /// self-heals via TTL expiry.
    pub async fn lock_actor(&self, id: &ReceiverId) -> Result<(), RegistryError> {
        let key = self.lock_path(&id.actor);
        let val = encode(&RegVal::of(id));
        let started = Instant::now();

        loop {
            match self.store.create(&key, &val, Some(self.ttl)).await {
                Ok(()) => return Ok(()),
                Err(KvError::AlreadyExists { .. }) => {}
                Err(source) => return Err(RegistryError::Store { source }),
            }

            let waited = started.elapsed();
            let Some(remaining) = self.lock_acquire_timeout.checked_sub(waited) else {
                return AcquireTimeoutSnafu {
                    actor: id.actor.clone(),
                    waited,
                }
                .fail();
            };

            debug!(actor = %id.actor, ?remaining, "actor lock held, watching");
            let wait = remaining.min(LOCK_WATCH_POLL);
            match tokio::time::timeout(wait, self.store.watch(&key, 0)).await {
                Ok(Ok(_)) => {}
                Ok(Err(source)) => return Err(RegistryError::Store { source }),
                // Poll expiry: re-try the create; the acquire budget is
                // enforced at the top of the loop.
                Err(_) => continue,
            }

            // Jitter so contending stages do not stampede the create.
            let jitter = rand::rng().random_range(0..=LOCK_RETRY_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    /// Release the actor-wide lock held by `id`.
    ///
    /// Fails with [`RegistryError::ForeignLock`] if the lock is held by a
    /// different receiver; never steals.
    pub async fn unlock_actor(&self, id: &ReceiverId) -> Result<(), RegistryError> {
        let key = self.lock_path(&id.actor);
        let ours = RegVal::of(id);

        let entry = self.store.get(&key).await.context(StoreSnafu)?;
        let held_by = decode(&key, &entry.value)?;
        if held_by != ours {
            return ForeignLockSnafu {
                actor: id.actor.clone(),
                held_by,
                requester: ours,
            }
            .fail();
        }

        self.store.delete(&key).await.context(StoreSnafu)?;
        Ok(())
    }

    /// The central placement primitive: claim `map_set` for `id`, or learn
    /// who already owns it.
    ///
    /// On return `v`, the caller owns the map-set iff `v` names the caller;
    /// otherwise the set is owned by `v` and the caller must route there.
    /// The whole claim runs under the actor lock, which is released on every
    /// exit path.
    pub async fn store_or_get(
        &self,
        id: &ReceiverId,
        map_set: &MapSet,
    ) -> Result<RegVal, RegistryError> {
        self.lock_actor(id).await?;
        let result = self.store_or_get_locked(id, map_set).await;
        let unlock = self.unlock_actor(id).await;
        let val = result?;
        unlock?;
        Ok(val)
    }

    async fn store_or_get_locked(
        &self,
        id: &ReceiverId,
        map_set: &MapSet,
    ) -> Result<RegVal, RegistryError> {
        let ours = RegVal::of(id);
        let mut result = ours;
        let mut adopted = false;
        let mut missing: Vec<&DictionaryKey> = Vec::new();

        for dk in map_set {
            let key = self.key_path(&id.actor, dk);
            match self.store.get(&key).await {
                Ok(entry) => {
                    let stored = decode(&key, &entry.value)?;
                    if stored == ours {
                        continue;
                    }
                    if adopted && stored != result {
                        return PlacementInconsistencySnafu {
                            requester: ours,
                            first: result,
                            second: stored,
                        }
                        .fail();
                    }
                    result = stored;
                    adopted = true;
                }
                Err(KvError::NotFound { .. }) => missing.push(dk),
                Err(source) => return Err(RegistryError::Store { source }),
            }
        }

        let encoded = encode(&result);
        for dk in missing {
            let key = self.key_path(&id.actor, dk);
            match self.store.create(&key, &encoded, Some(self.ttl)).await {
                Ok(()) | Err(KvError::AlreadyExists { .. }) => {}
                Err(source) => return Err(RegistryError::Store { source }),
            }
        }

        debug!(requester = %ours, owner = %result, keys = map_set.len(), "placement resolved");
        Ok(result)
    }

    /// Force variant of [`Registry::store_or_get`], used only by migration:
    /// writes `id` as owner of every key unconditionally.
    pub async fn set(&self, id: &ReceiverId, map_set: &MapSet) -> Result<RegVal, RegistryError> {
        let ours = RegVal::of(id);
        let encoded = encode(&ours);
        for dk in map_set {
            let key = self.key_path(&id.actor, dk);
            self.store.delete(&key).await.context(StoreSnafu)?;
            self.store
                .create(&key, &encoded, Some(self.ttl))
                .await
                .context(StoreSnafu)?;
        }
        Ok(ours)
    }

    /// Re-assert every record in `map_set` for `id` with a fresh TTL.
    ///
    /// Called periodically by the mapper so live receivers never lose their
    /// records to TTL expiry. Runs under the actor lock so `store_or_get`
    /// callers never observe the transient gap between delete and create.
    pub async fn refresh(&self, id: &ReceiverId, map_set: &MapSet) -> Result<(), RegistryError> {
        self.lock_actor(id).await?;
        let result = self.set(id, map_set).await;
        let unlock = self.unlock_actor(id).await;
        result?;
        unlock?;
        Ok(())
    }
}

fn encode(val: &RegVal) -> String {
    serde_json::to_string(val).expect("RegVal serialization cannot fail")
}

fn decode(key: &str, raw: &str) -> Result<RegVal, RegistryError> {
    match serde_json::from_str(raw) {
        Ok(val) => Ok(val),
        Err(source) => {
            warn!(%key, %raw, "corrupt registry record");
            Err(RegistryError::Codec {
                key: key.to_string(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn registry(store: Arc<MemoryKvStore>) -> Registry {
        Registry::new(
            store,
            "/troupe",
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
    }

    fn rid(stage: u64, rcvr: u32) -> ReceiverId {
        ReceiverId::new(StageId(stage), "weather", rcvr)
    }

    fn ms(keys: &[(&str, &str)]) -> MapSet {
        keys.iter()
            .map(|(d, k)| DictionaryKey::new(d.as_bytes().to_vec(), k.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn reg_val_json_shape() {
        let val = RegVal {
            stage_id: StageId(7),
            rcvr_id: 3,
        };
        assert_eq!(encode(&val), r#"{"stage_id":7,"rcvr_id":3}"#);
        assert_eq!(decode("k", r#"{"stage_id":7,"rcvr_id":3}"#).unwrap(), val);
    }

    #[tokio::test]
    async fn store_or_get_claims_fresh_keys() {
        let reg = registry(MemoryKvStore::new());
        let id = rid(1, 1);
        let owner = reg.store_or_get(&id, &ms(&[("d", "a"), ("d", "b")])).await.unwrap();
        assert!(owner.is(&id));
    }

    #[tokio::test]
    async fn store_or_get_returns_existing_owner() {
        let store = MemoryKvStore::new();
        let reg = registry(store);
        let first = rid(1, 1);
        let second = rid(2, 1);

        let owner = reg.store_or_get(&first, &ms(&[("d", "a")])).await.unwrap();
        assert!(owner.is(&first));

        // Second claimant, overlapping set: adopts the existing owner and
        // binds the new key to it.
        let owner = reg
            .store_or_get(&second, &ms(&[("d", "a"), ("d", "b")]))
            .await
            .unwrap();
        assert!(owner.is(&first));

        // The extra key is now bound to the first owner too.
        let owner = reg.store_or_get(&second, &ms(&[("d", "b")])).await.unwrap();
        assert!(owner.is(&first));
    }

    #[tokio::test]
    async fn store_or_get_rejects_split_ownership() {
        let store = MemoryKvStore::new();
        let reg = registry(store);
        let a = rid(1, 1);
        let b = rid(2, 1);
        let c = rid(3, 1);

        reg.store_or_get(&a, &ms(&[("d", "a")])).await.unwrap();
        reg.store_or_get(&b, &ms(&[("d", "b")])).await.unwrap();

        let err = reg
            .store_or_get(&c, &ms(&[("d", "a"), ("d", "b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::PlacementInconsistency { .. }));

        // The lock must have been released on the error path.
        reg.lock_actor(&c).await.unwrap();
        reg.unlock_actor(&c).await.unwrap();
    }

    #[tokio::test]
    async fn unlock_refuses_foreign_lock() {
        let store = MemoryKvStore::new();
        let reg = registry(store);
        let holder = rid(1, 1);
        let other = rid(2, 1);

        reg.lock_actor(&holder).await.unwrap();
        let err = reg.unlock_actor(&other).await.unwrap_err();
        assert!(matches!(err, RegistryError::ForeignLock { .. }));
        reg.unlock_actor(&holder).await.unwrap();
    }

    #[tokio::test]
    async fn lock_self_heals_after_ttl() {
        let store = MemoryKvStore::new();
        let reg = Registry::new(
            store,
            "/troupe",
            Duration::from_millis(60),
            Duration::from_secs(2),
        );
        let crashed = rid(1, 1);
        let fresh = rid(2, 1);

        reg.lock_actor(&crashed).await.unwrap();
        // The holder "crashes": no unlock. The next claimant rides the watch
        // until TTL expiry releases the lock.
        let started = Instant::now();
        reg.lock_actor(&fresh).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        reg.unlock_actor(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn set_overwrites_unconditionally() {
        let store = MemoryKvStore::new();
        let reg = registry(store);
        let old = rid(1, 1);
        let new = rid(2, 5);
        let keys = ms(&[("d", "a"), ("d", "b")]);

        reg.store_or_get(&old, &keys).await.unwrap();
        let owner = reg.set(&new, &keys).await.unwrap();
        assert!(owner.is(&new));

        let seen = reg.store_or_get(&old, &keys).await.unwrap();
        assert!(seen.is(&new));
    }

    #[tokio::test]
    async fn lock_acquire_times_out() {
        let store = MemoryKvStore::new();
        let reg = Registry::new(
            store,
            "/troupe",
            Duration::from_secs(30),
            Duration::from_millis(80),
        );
        let holder = rid(1, 1);
        let waiter = rid(2, 1);

        reg.lock_actor(&holder).await.unwrap();
        let err = reg.lock_actor(&waiter).await.unwrap_err();
        assert!(matches!(err, RegistryError::AcquireTimeout { .. }));
    }
}
