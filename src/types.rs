//! Core identifiers and message types shared across the fabric.
//!
//! Naming follows the cluster model: a *stage* is a process in the cluster,
//! an *actor* is an application type, and a *receiver* is the shard of an
//! actor that owns a disjoint slice of its keyspace.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Cluster-unique identifier of a stage (a node process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl StageId {
    /// Wrap a raw stage number.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<StageId> for u64 {
    fn from(value: StageId) -> Self {
        value.0
    }
}

impl FromStr for StageId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(StageId)
    }
}

/// Name of an application actor type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ActorName(pub String);

impl fmt::Display for ActorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActorName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ActorName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The receiver number reserved for an actor's detached receiver on a stage.
pub const DETACHED_RCVR_NUM: u32 = 0;

/// Fully-qualified identifier of a receiver: the stage hosting it, the actor
/// it shards, and the per-stage receiver number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ReceiverId {
    /// Stage hosting the receiver.
    pub stage: StageId,
    /// Actor the receiver belongs to.
    pub actor: ActorName,
    /// Per-stage receiver number. `0` is reserved for the detached receiver.
    pub rcvr: u32,
}

impl ReceiverId {
    /// Build a receiver id.
    pub fn new(stage: StageId, actor: impl Into<ActorName>, rcvr: u32) -> Self {
        Self {
            stage,
            actor: actor.into(),
            rcvr,
        }
    }

    /// Whether this id names the detached receiver of its actor.
    pub fn is_detached(&self) -> bool {
        self.rcvr == DETACHED_RCVR_NUM
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stage, self.actor, self.rcvr)
    }
}

/// A single dictionary key: the unit of ownership in the registry.
///
/// Both components are opaque byte strings; equality and ordering are
/// lexicographic on the `(dict, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DictionaryKey {
    /// Dictionary (namespace) the key lives in.
    pub dict: Bytes,
    /// Key within the dictionary.
    pub key: Bytes,
}

impl DictionaryKey {
    /// Build a dictionary key from anything byte-like.
    pub fn new(dict: impl Into<Bytes>, key: impl Into<Bytes>) -> Self {
        Self {
            dict: dict.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for DictionaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.dict),
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// A canonical, deduplicated, sorted set of dictionary keys.
///
/// This is the unit of an ownership claim: a handler declares the map-set a
/// message touches, and the fabric guarantees the whole set is owned by a
/// single receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSet(Vec<DictionaryKey>);

impl MapSet {
    /// Build a map-set, sorting into canonical order and dropping duplicates.
    pub fn new(mut keys: Vec<DictionaryKey>) -> Self {
        keys.sort();
        keys.dedup();
        Self(keys)
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the keys in canonical order.
    pub fn iter(&self) -> std::slice::Iter<'_, DictionaryKey> {
        self.0.iter()
    }
}

impl FromIterator<DictionaryKey> for MapSet {
    fn from_iter<T: IntoIterator<Item = DictionaryKey>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a MapSet {
    type Item = &'a DictionaryKey;
    type IntoIter = std::slice::Iter<'a, DictionaryKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A message travelling through the fabric.
///
/// A message either names a concrete destination receiver (unicast) or
/// carries application payload that the actor's handler maps to a key-set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Actor the message is addressed to.
    pub actor: ActorName,
    /// Concrete destination receiver, if unicast.
    pub to: Option<ReceiverId>,
    /// Receiver that emitted the message, if any.
    pub from: Option<ReceiverId>,
    /// Opaque application payload.
    pub payload: Bytes,
}

impl Message {
    /// Build a keyed (non-unicast) message for an actor.
    pub fn to_actor(actor: impl Into<ActorName>, payload: impl Into<Bytes>) -> Self {
        Self {
            actor: actor.into(),
            to: None,
            from: None,
            payload: payload.into(),
        }
    }

    /// Build a unicast message for a concrete receiver.
    pub fn to_receiver(to: ReceiverId, payload: impl Into<Bytes>) -> Self {
        Self {
            actor: to.actor.clone(),
            to: Some(to),
            from: None,
            payload: payload.into(),
        }
    }

    /// Whether the message names a concrete destination receiver.
    pub fn is_unicast(&self) -> bool {
        self.to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_set_is_canonical() {
        let ms = MapSet::new(vec![
            DictionaryKey::new("d", "b"),
            DictionaryKey::new("d", "a"),
            DictionaryKey::new("c", "z"),
            DictionaryKey::new("d", "a"),
        ]);
        let keys: Vec<_> = ms.iter().cloned().collect();
        assert_eq!(
            keys,
            vec![
                DictionaryKey::new("c", "z"),
                DictionaryKey::new("d", "a"),
                DictionaryKey::new("d", "b"),
            ]
        );
    }

    #[test]
    fn detached_id_is_zero() {
        let id = ReceiverId::new(StageId(3), "weather", DETACHED_RCVR_NUM);
        assert!(id.is_detached());
        assert!(!ReceiverId::new(StageId(3), "weather", 1).is_detached());
    }

    #[test]
    fn unicast_detection() {
        let keyed = Message::to_actor("weather", "payload");
        assert!(!keyed.is_unicast());
        let uni = Message::to_receiver(ReceiverId::new(StageId(1), "weather", 4), "payload");
        assert!(uni.is_unicast());
    }
}
