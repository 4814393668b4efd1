//! Application-facing handler traits and per-receiver state.
//!
//! An actor registers a [`Handler`] that does two things per message: `map`
//! declares the set of dictionary keys the message will touch, and `rcv`
//! executes against the receiver's private state. Actors may additionally
//! register a single [`DetachedHandler`] per stage for their non-keyed input
//! stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{ActorName, MapSet, Message, ReceiverId, StageId};

/// A single named dictionary of a receiver's private state.
#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    entries: HashMap<Bytes, Bytes>,
}

impl Dictionary {
    /// Look up a value.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&Bytes> {
        self.entries.get(key.as_ref())
    }

    /// Store a value, returning the previous one if present.
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Option<Bytes> {
        self.entries.insert(key.into(), value.into())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: impl AsRef<[u8]>) -> Option<Bytes> {
        self.entries.remove(key.as_ref())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Private state of a single receiver, a set of named dictionaries.
///
/// State lives and dies with the receiver; durable storage is the
/// application's concern.
#[derive(Debug, Default, Clone)]
pub struct ReceiverState {
    dicts: HashMap<String, Dictionary>,
}

impl ReceiverState {
    /// Fresh, empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Access a dictionary by name, creating it on first use.
    pub fn dict(&mut self, name: impl Into<String>) -> &mut Dictionary {
        self.dicts.entry(name.into()).or_default()
    }
}

/// Read-only context passed to [`Handler::map`].
#[derive(Debug, Clone)]
pub struct MapContext {
    /// Stage evaluating the mapping.
    pub stage: StageId,
    /// Actor the handler belongs to.
    pub actor: ActorName,
}

/// Execution context passed to [`Handler::rcv`] and [`DetachedHandler`]
/// callbacks. Owns the receiver's private state and lets handlers emit
/// messages back into the fabric.
pub struct RcvContext {
    id: ReceiverId,
    state: ReceiverState,
    outbox: mpsc::Sender<Message>,
}

impl RcvContext {
    pub(crate) fn new(id: ReceiverId, state: ReceiverState, outbox: mpsc::Sender<Message>) -> Self {
        Self { id, state, outbox }
    }

    /// Identifier of the executing receiver.
    pub fn id(&self) -> &ReceiverId {
        &self.id
    }

    /// The receiver's private state.
    pub fn state(&mut self) -> &mut ReceiverState {
        &mut self.state
    }

    /// Emit a message into the fabric, stamped with this receiver as sender.
    pub async fn emit(&self, mut msg: Message) {
        msg.from = Some(self.id.clone());
        if self.outbox.send(msg).await.is_err() {
            warn!(rcvr = %self.id, "dropping emitted message: stage outbox closed");
        }
    }

    pub(crate) fn into_state(self) -> ReceiverState {
        self.state
    }
}

/// A keyed message handler for an actor.
///
/// `map` must be deterministic for a given message: the fabric uses it to
/// claim ownership of the returned key-set, and delivers every message whose
/// set overlaps to the same receiver.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Declare the set of dictionary keys `msg` will read or write.
    fn map(&self, msg: &Message, ctx: &MapContext) -> MapSet;

    /// Execute the message against the receiver's state.
    async fn rcv(&self, msg: Message, ctx: &mut RcvContext) -> anyhow::Result<()>;
}

/// Handler driving an actor's detached receiver: the single per-stage
/// receiver that consumes the actor's non-keyed input stream.
#[async_trait]
pub trait DetachedHandler: Send + 'static {
    /// Called once when the detached receiver starts.
    async fn started(&mut self, ctx: &mut RcvContext);

    /// Called for every message enqueued on the detached receiver.
    async fn rcv(&mut self, msg: Message, ctx: &mut RcvContext) -> anyhow::Result<()>;

    /// Called once when the detached receiver stops.
    async fn stopped(&mut self, ctx: &mut RcvContext);
}

/// A message paired with the handler that will process it. The handler is
/// absent only for unicast messages addressed to a detached receiver.
#[derive(Clone)]
pub struct MsgAndHandler {
    /// The message in flight.
    pub msg: Message,
    /// Handler of the destination actor, if any.
    pub handler: Option<Arc<dyn Handler>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionaries_are_lazily_created() {
        let mut state = ReceiverState::new();
        assert!(state.dict("counts").is_empty());
        state.dict("counts").put("k", "1");
        assert_eq!(state.dict("counts").get("k"), Some(&Bytes::from("1")));
        assert_eq!(state.dict("counts").len(), 1);
    }
}
