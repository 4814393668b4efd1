//! Deterministic in-memory implementation of the KV contract.
//!
//! Mirrors the behavior of a consensus-backed store without network or disk
//! I/O: TTL-stamped records, a background sweeper that expires them, and a
//! broadcast-based watch hub. Intended for tests and single-binary
//! deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{KvEntry, KvError, KvEvent, KvEventKind, KvStore};

/// Interval between TTL sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

/// Capacity of the watch event channel. Watchers that fall further behind
/// than this observe a lagged stream and simply keep waiting.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    index: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    index: u64,
}

/// In-memory [`KvStore`] with TTL expiry and watch support.
///
/// Must be created inside a tokio runtime: construction spawns the expiry
/// sweeper task. The sweeper holds only a weak reference and exits once the
/// store is dropped.
pub struct MemoryKvStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<KvEvent>,
}

impl MemoryKvStore {
    /// Create a new store and spawn its expiry sweeper.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        });

        let weak_inner: Weak<Mutex<Inner>> = Arc::downgrade(&store.inner);
        let events = store.events.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let Some(inner) = weak_inner.upgrade() else {
                    break;
                };
                sweep_expired(&inner, &events);
            }
        });

        store
    }

    fn emit(&self, kind: KvEventKind, key: &str, value: Option<String>, index: u64) {
        let _ = self.events.send(KvEvent {
            kind,
            key: key.to_string(),
            value,
            index,
        });
    }
}

fn sweep_expired(inner: &Mutex<Inner>, events: &broadcast::Sender<KvEvent>) {
    let now = Instant::now();
    let mut guard = inner.lock().expect("kv store mutex poisoned");
    let expired: Vec<String> = guard
        .entries
        .iter()
        .filter(|(_, e)| e.is_expired(now))
        .map(|(k, _)| k.clone())
        .collect();
    for key in expired {
        guard.entries.remove(&key);
        guard.index += 1;
        let index = guard.index;
        debug!(%key, "kv record expired");
        let _ = events.send(KvEvent {
            kind: KvEventKind::Expired,
            key,
            value: None,
            index,
        });
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let now = Instant::now();
        let index = {
            let mut guard = self.inner.lock().expect("kv store mutex poisoned");
            match guard.entries.get(key) {
                Some(existing) if !existing.is_expired(now) => {
                    return Err(KvError::AlreadyExists {
                        key: key.to_string(),
                    });
                }
                Some(_) => {
                    // Lazily expire on the way in so the sweeper's cadence
                    // never blocks a re-create.
                    guard.entries.remove(key);
                }
                None => {}
            }
            guard.index += 1;
            let index = guard.index;
            guard.entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    index,
                    expires_at: ttl.map(|d| now + d),
                },
            );
            index
        };
        self.emit(KvEventKind::Created, key, Some(value.to_string()), index);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<KvEntry, KvError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("kv store mutex poisoned");
        match guard.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(KvEntry {
                key: key.to_string(),
                value: entry.value.clone(),
                index: entry.index,
            }),
            Some(_) => {
                guard.entries.remove(key);
                Err(KvError::NotFound {
                    key: key.to_string(),
                })
            }
            None => Err(KvError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let (existed, index) = {
            let mut guard = self.inner.lock().expect("kv store mutex poisoned");
            match guard.entries.remove(key) {
                Some(_) => {
                    guard.index += 1;
                    (true, guard.index)
                }
                None => (false, 0),
            }
        };
        if existed {
            self.emit(KvEventKind::Deleted, key, None, index);
        }
        Ok(existed)
    }

    async fn watch(&self, key: &str, since_index: u64) -> Result<KvEvent, KvError> {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) if event.key == key && event.index > since_index => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(KvError::WatchClosed {
                        key: key.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_delete_roundtrip() {
        let store = MemoryKvStore::new();
        store.create("a", "1", None).await.unwrap();
        let entry = store.get("a").await.unwrap();
        assert_eq!(entry.value, "1");

        assert!(store.delete("a").await.unwrap());
        assert!(matches!(
            store.get("a").await,
            Err(KvError::NotFound { .. })
        ));
        assert!(!store.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn create_refuses_existing_key() {
        let store = MemoryKvStore::new();
        store.create("a", "1", None).await.unwrap();
        assert!(matches!(
            store.create("a", "2", None).await,
            Err(KvError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn ttl_expires_records() {
        let store = MemoryKvStore::new();
        store
            .create("a", "1", Some(Duration::from_millis(40)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            store.get("a").await,
            Err(KvError::NotFound { .. })
        ));
        // Expired records must not block a fresh create.
        store.create("a", "2", None).await.unwrap();
    }

    #[tokio::test]
    async fn watch_observes_delete() {
        let store = MemoryKvStore::new();
        store.create("a", "1", None).await.unwrap();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("a", 0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.delete("a").await.unwrap();

        let event = watcher.await.unwrap().unwrap();
        assert_eq!(event.kind, KvEventKind::Deleted);
        assert_eq!(event.key, "a");
    }

    #[tokio::test]
    async fn watch_observes_expiry() {
        let store = MemoryKvStore::new();
        store
            .create("a", "1", Some(Duration::from_millis(40)))
            .await
            .unwrap();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("a", 0).await })
        };
        let event = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, KvEventKind::Expired);
    }
}
