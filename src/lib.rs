//! Troupe: a sharded actor fabric.
//!
//! Application handlers declare, per message, the set of dictionary keys
//! they will read or write; the fabric guarantees that all messages
//! touching an overlapping key-set are delivered in order to a single
//! receiver somewhere in the cluster. Placement is arbitrated by a
//! consensus-backed registry; each stage (node) runs one mapper per actor
//! that routes messages, creates receivers lazily, and coordinates live
//! migration; a pooled multi-stream RPC layer carries messages, commands,
//! and consensus traffic between stages.
//!
//! The consensus log itself is an external collaborator: the fabric
//! consumes it through the [`kv::KvStore`] contract and the
//! [`consensus::ConsensusStep`]/[`consensus::Reporter`] hooks.

#![warn(missing_docs)]

/// Application-facing handler traits and per-receiver state.
pub mod actor;
/// Stage configuration.
pub mod config;
/// Contracts coupling the fabric to an external consensus module.
pub mod consensus;
/// The linearizable key-value contract behind the registry.
pub mod kv;
/// Cluster-wide ownership registry.
pub mod registry;
/// Inter-stage RPC: wire protocol, clients, pool, server.
pub mod rpc;

mod mapper;
mod receiver;
mod stage;
mod types;

pub use actor::{DetachedHandler, Dictionary, Handler, MapContext, RcvContext, ReceiverState};
pub use config::StageConfig;
pub use mapper::{MapperError, MapperHandle};
pub use stage::Stage;
pub use types::{
    ActorName, DictionaryKey, MapSet, Message, ReceiverId, StageId, DETACHED_RCVR_NUM,
};
