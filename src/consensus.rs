//! Contracts coupling the fabric to an external consensus module.
//!
//! The consensus log is not implemented here; the fabric only carries its
//! traffic. [`Batch`] is the unit of transport, [`ConsensusStep`] is how a
//! stage hands an incoming batch to its local consensus module, and
//! [`Reporter`] receives delivery outcomes. The reporter callbacks are a
//! hard contract: they fire for every send attempt, including attempts the
//! RPC pool refuses during backoff.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::StageId;

/// Identifier of a consensus group within a batch.
pub type GroupId = u64;

/// Delivery priority of a batch. High-priority batches ride the dedicated
/// priority stream so heartbeats are not stuck behind bulk replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPriority {
    /// Ordinary replication traffic.
    Normal,
    /// Heartbeats and other latency-sensitive traffic.
    High,
}

/// A single opaque consensus message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusMessage {
    /// Encoded consensus payload.
    pub data: Bytes,
    /// Whether this message carries a snapshot, which obliges a
    /// [`Reporter::report_snapshot`] call on delivery outcome.
    pub snapshot: bool,
}

/// A batch of consensus messages between two stages, grouped by consensus
/// group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Sending stage.
    pub from: StageId,
    /// Destination stage.
    pub to: StageId,
    /// Stream selection hint.
    pub priority: BatchPriority,
    /// Messages per consensus group.
    pub messages: HashMap<GroupId, Vec<ConsensusMessage>>,
}

/// Outcome of a snapshot transfer, reported back to the consensus module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// The snapshot reached the peer.
    Finish,
    /// The snapshot did not reach the peer.
    Failure,
}

/// Delivery feedback consumed by the consensus module.
pub trait Reporter: Send + Sync {
    /// A group's messages could not be delivered to `stage`.
    fn report_unreachable(&self, stage: StageId, group: GroupId);

    /// A snapshot transfer to `stage` finished or failed.
    fn report_snapshot(&self, stage: StageId, group: GroupId, status: SnapshotStatus);
}

/// Entry point for handing an incoming batch to the local consensus module.
#[async_trait]
pub trait ConsensusStep: Send + Sync {
    /// Step the local consensus state machine with `batch`, bounded by
    /// `timeout` (the configured heartbeat timeout).
    async fn step_batch(&self, batch: Batch, timeout: Duration) -> anyhow::Result<()>;
}

/// Report the outcome of one delivery attempt for every group and snapshot
/// in `batch`.
///
/// `delivered` is false for any failure, including a send the pool skipped
/// outright (backoff, unknown peer).
pub fn report_delivery(delivered: bool, batch: &Batch, reporter: &dyn Reporter) {
    for (group, msgs) in &batch.messages {
        if !delivered {
            reporter.report_unreachable(batch.to, *group);
        }
        for msg in msgs {
            if msg.snapshot {
                let status = if delivered {
                    SnapshotStatus::Finish
                } else {
                    SnapshotStatus::Failure
                };
                reporter.report_snapshot(batch.to, *group, status);
            }
        }
    }
}
