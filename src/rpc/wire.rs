//! Wire protocol for inter-stage RPC.
//!
//! Frames are length-delimited with postcard payloads. Every connection
//! opens with a [`StreamHandshake`] naming its stream kind; cmd, msg, raft
//! and prio streams then carry [`Request`]/[`Response`] pairs in lockstep,
//! while a ctrl stream carries the migration handshake (one
//! [`RemoteCommand`], answered with the assigned [`ReceiverId`]).
//!
//! The method names (`HiveState`, `ProcessCmd`, `ProcessRaft`, `EnqueMsg`)
//! are wire contracts and must not be renamed.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::consensus::Batch;
use crate::types::{ActorName, Message, ReceiverId, StageId};

use super::RpcError;

/// Maximum size of a single frame (10 MB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// A framed TCP stream carrying postcard payloads.
pub type WireStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Wrap a TCP stream with the wire framing.
pub fn frame(stream: TcpStream) -> WireStream {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(stream)
}

/// Encode `value` and send it as one frame.
pub async fn send_frame<T: Serialize>(stream: &mut WireStream, value: &T) -> Result<(), RpcError> {
    let buf = postcard::to_stdvec(value).map_err(|source| RpcError::Codec { source })?;
    stream
        .send(buf.into())
        .await
        .map_err(|source| RpcError::Io { source })
}

/// Receive one frame and decode it. A cleanly closed stream surfaces as
/// [`RpcError::Shutdown`].
pub async fn recv_frame<T: DeserializeOwned>(stream: &mut WireStream) -> Result<T, RpcError> {
    match stream.next().await {
        Some(Ok(buf)) => postcard::from_bytes(&buf).map_err(|source| RpcError::Codec { source }),
        Some(Err(source)) => Err(RpcError::Io { source }),
        None => Err(RpcError::Shutdown),
    }
}

/// The four multiplexed stream kinds, plus the transient control stream
/// used by migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Request/response commands.
    Cmd,
    /// Bulk application messages.
    Msg,
    /// Ordinary consensus traffic.
    Raft,
    /// Latency-sensitive consensus traffic.
    Prio,
    /// Transient control connection (migration handshake).
    Ctrl,
}

/// First frame on every connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamHandshake {
    /// Declared stream kind.
    pub kind: StreamKind,
}

/// A request frame. Variant names are the wire method names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Query the peer's identity and peer list.
    HiveState,
    /// Execute commands, one result per command.
    ProcessCmd(Vec<Cmd>),
    /// Hand a consensus batch to the peer's consensus module.
    ProcessRaft(Batch),
    /// Dispatch messages to their addressed receivers.
    EnqueMsg(Vec<Message>),
}

/// A response frame, mirroring [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Answer to [`Request::HiveState`].
    HiveState(HiveState),
    /// Answers to [`Request::ProcessCmd`], in request order.
    ProcessCmd(Vec<CmdResult>),
    /// Acknowledgement of [`Request::ProcessRaft`].
    ProcessRaft,
    /// Acknowledgement of [`Request::EnqueMsg`].
    EnqueMsg,
    /// Request-level failure.
    Error(String),
}

/// A stage's identity and view of its peers (wire contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveState {
    /// The stage's id.
    pub id: StageId,
    /// The stage's RPC address.
    pub addr: String,
    /// Peers the stage knows about.
    pub peers: Vec<PeerInfo>,
}

/// One known peer of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer stage id.
    pub id: StageId,
    /// Peer RPC address.
    pub addr: String,
}

/// A command addressed to a stage, an actor's mapper, or a single receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cmd {
    /// Destination stage; a mismatch is refused by the server.
    pub stage: Option<StageId>,
    /// Destination actor; absent for stage-level commands.
    pub actor: Option<ActorName>,
    /// Destination receiver number; set to address a single receiver.
    pub rcvr: Option<u32>,
    /// The operation.
    pub kind: CmdKind,
}

/// Command operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CmdKind {
    /// Stop the addressed stage, mapper, or receiver.
    Stop,
    /// Look up a receiver by id.
    FindRcvr(ReceiverId),
    /// Allocate a fresh local receiver. The template carries the target
    /// stage and actor; the receiver number is assigned by the mapper.
    NewRcvr {
        /// Template id: stage and actor of the receiver to create.
        template: ReceiverId,
    },
    /// Migrate a receiver to another stage.
    MigrateRcvr {
        /// The receiver to move.
        from: ReceiverId,
        /// The destination stage.
        to: StageId,
    },
}

/// Per-command result: data or an error, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdResult {
    /// Payload of a successful command.
    pub data: Option<CmdData>,
    /// Error text of a failed command.
    pub err: Option<String>,
}

impl CmdResult {
    /// A successful result carrying `data`.
    pub fn ok(data: Option<CmdData>) -> Self {
        Self { data, err: None }
    }

    /// A failed result.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: None,
            err: Some(message.into()),
        }
    }
}

/// Typed payloads carried in command results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CmdData {
    /// A receiver id (find-receiver, new-receiver, migrate-receiver).
    Rcvr(ReceiverId),
}

/// Command sent on a ctrl stream during migration, after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommand {
    /// The operation; only new-receiver is defined.
    pub cmd: RemoteCommandKind,
    /// Template id: the target stage and actor.
    pub id: ReceiverId,
}

/// Operations valid on a ctrl stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCommandKind {
    /// Create a receiver on the target stage and report its id.
    NewRcvr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = Request::ProcessCmd(vec![Cmd {
            stage: Some(StageId(2)),
            actor: Some(ActorName::from("weather")),
            rcvr: None,
            kind: CmdKind::FindRcvr(ReceiverId::new(StageId(2), "weather", 7)),
        }]);
        let bytes = postcard::to_stdvec(&req).unwrap();
        let decoded: Request = postcard::from_bytes(&bytes).unwrap();
        match decoded {
            Request::ProcessCmd(cmds) => {
                assert_eq!(cmds.len(), 1);
                assert_eq!(cmds[0].stage, Some(StageId(2)));
                assert!(matches!(cmds[0].kind, CmdKind::FindRcvr(ref id) if id.rcvr == 7));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn remote_command_roundtrip() {
        let cmd = RemoteCommand {
            cmd: RemoteCommandKind::NewRcvr,
            id: ReceiverId::new(StageId(3), "weather", 0),
        };
        let bytes = postcard::to_stdvec(&cmd).unwrap();
        let decoded: RemoteCommand = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.cmd, RemoteCommandKind::NewRcvr);
        assert_eq!(decoded.id.stage, StageId(3));
    }
}
