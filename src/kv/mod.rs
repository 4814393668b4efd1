//! The linearizable key-value contract the registry is built on.
//!
//! The consensus log itself is an external collaborator; the fabric only
//! requires this narrow surface from it: create-if-absent with TTL, point
//! reads, deletes, and a blocking watch for change notifications. The crate
//! ships [`MemoryKvStore`] as a deterministic in-process implementation for
//! tests and single-binary deployments.

mod memory;

pub use memory::MemoryKvStore;

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

/// Errors from the key-value contract.
#[derive(Debug, Snafu)]
pub enum KvError {
    /// The requested key does not exist.
    #[snafu(display("key not found: {key}"))]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// Creation failed because the key already exists.
    #[snafu(display("key already exists: {key}"))]
    AlreadyExists {
        /// The conflicting key.
        key: String,
    },

    /// The store is unreachable or the operation failed in transit.
    #[snafu(display("kv transport failure: {message}"))]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// The watch stream ended before a change was observed.
    #[snafu(display("watch closed for key {key}"))]
    WatchClosed {
        /// The watched key.
        key: String,
    },
}

/// A stored key-value pair with its modification index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The key.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Store-wide index of the mutation that produced this entry.
    pub index: u64,
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    /// The key was created.
    Created,
    /// The key was deleted.
    Deleted,
    /// The key's TTL elapsed.
    Expired,
}

/// A change notification delivered by [`KvStore::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    /// What happened.
    pub kind: KvEventKind,
    /// The key that changed.
    pub key: String,
    /// The value after the change, if any.
    pub value: Option<String>,
    /// Store-wide index of the change.
    pub index: u64,
}

/// The key-value surface required from the consensus-backed store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Create `key` with `value`, failing with [`KvError::AlreadyExists`] if
    /// the key is present. `ttl` bounds the record's lifetime.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Read a key, failing with [`KvError::NotFound`] if absent or expired.
    async fn get(&self, key: &str) -> Result<KvEntry, KvError>;

    /// Delete a key. Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Block until the next change of `key` with index greater than
    /// `since_index`, and return it.
    async fn watch(&self, key: &str, since_index: u64) -> Result<KvEvent, KvError>;
}
