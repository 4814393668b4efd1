//! Multi-stream RPC client for a single peer stage.
//!
//! A client holds up to four TCP connections to the same peer, one per
//! stream kind, so heartbeats, bulk messages, and control commands do not
//! share a head-of-line. When a secondary dial fails the stream degrades
//! onto an already-open connection: raft falls back to cmd, prio to raft,
//! msg to cmd.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::consensus::{report_delivery, Batch, BatchPriority, Reporter};
use crate::types::Message;

use super::wire::{
    self, Cmd, CmdData, HiveState, Request, Response, StreamHandshake, StreamKind, WireStream,
};
use super::RpcError;

type SharedStream = Arc<Mutex<WireStream>>;

/// RPC client to one peer stage.
#[derive(Debug)]
pub struct RpcClient {
    addr: SocketAddr,
    cmd: SharedStream,
    msg: SharedStream,
    raft: SharedStream,
    prio: SharedStream,
}

impl std::fmt::Display for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc client to {}", self.addr)
    }
}

impl RpcClient {
    /// Dial a peer. The cmd connection is mandatory; the other streams
    /// degrade onto open connections if their dial fails.
    pub async fn connect(addr: SocketAddr, dial_timeout: Duration) -> Result<Self, RpcError> {
        let cmd = Arc::new(Mutex::new(
            dial_stream(addr, dial_timeout, StreamKind::Cmd).await?,
        ));

        let raft = match dial_stream(addr, dial_timeout, StreamKind::Raft).await {
            Ok(stream) => Arc::new(Mutex::new(stream)),
            Err(err) => {
                debug!(%addr, error = %err, "raft stream dial failed, sharing cmd");
                Arc::clone(&cmd)
            }
        };
        let prio = match dial_stream(addr, dial_timeout, StreamKind::Prio).await {
            Ok(stream) => Arc::new(Mutex::new(stream)),
            Err(err) => {
                debug!(%addr, error = %err, "prio stream dial failed, sharing raft");
                Arc::clone(&raft)
            }
        };
        let msg = match dial_stream(addr, dial_timeout, StreamKind::Msg).await {
            Ok(stream) => Arc::new(Mutex::new(stream)),
            Err(err) => {
                debug!(%addr, error = %err, "msg stream dial failed, sharing cmd");
                Arc::clone(&cmd)
            }
        };

        Ok(Self {
            addr,
            cmd,
            msg,
            raft,
            prio,
        })
    }

    /// Peer address this client is connected to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn call(stream: &SharedStream, request: &Request) -> Result<Response, RpcError> {
        let mut guard = stream.lock().await;
        wire::send_frame(&mut guard, request).await?;
        wire::recv_frame(&mut guard).await
    }

    /// Relay messages on the msg stream. The caller is expected to have
    /// grouped them by destination receiver.
    pub async fn send_msg(&self, msgs: Vec<Message>) -> Result<(), RpcError> {
        debug!(client = %self, count = msgs.len(), "relaying messages");
        match Self::call(&self.msg, &Request::EnqueMsg(msgs)).await? {
            Response::EnqueMsg => Ok(()),
            Response::Error(message) => Err(RpcError::Remote { message }),
            _ => Err(RpcError::UnexpectedResponse { method: "EnqueMsg" }),
        }
    }

    /// Execute one command on the cmd stream and return its payload.
    pub async fn send_cmd(&self, cmd: Cmd) -> Result<Option<CmdData>, RpcError> {
        debug!(client = %self, ?cmd, "sending command");
        match Self::call(&self.cmd, &Request::ProcessCmd(vec![cmd])).await? {
            Response::ProcessCmd(mut results) => match results.pop() {
                Some(result) => match result.err {
                    Some(message) => Err(RpcError::Remote { message }),
                    None => Ok(result.data),
                },
                None => Err(RpcError::UnexpectedResponse {
                    method: "ProcessCmd",
                }),
            },
            Response::Error(message) => Err(RpcError::Remote { message }),
            _ => Err(RpcError::UnexpectedResponse {
                method: "ProcessCmd",
            }),
        }
    }

    /// Send a consensus batch, on the prio stream when the batch is
    /// high-priority. Delivery outcome is reported to `reporter` for every
    /// group and snapshot in the batch.
    pub async fn send_raft(&self, batch: &Batch, reporter: &dyn Reporter) -> Result<(), RpcError> {
        debug!(client = %self, to = %batch.to, "sending raft batch");
        let stream = match batch.priority {
            BatchPriority::High => &self.prio,
            BatchPriority::Normal => &self.raft,
        };
        let result = match Self::call(stream, &Request::ProcessRaft(batch.clone())).await {
            Ok(Response::ProcessRaft) => Ok(()),
            Ok(Response::Error(message)) => Err(RpcError::Remote { message }),
            Ok(_) => Err(RpcError::UnexpectedResponse {
                method: "ProcessRaft",
            }),
            Err(err) => Err(err),
        };
        report_delivery(result.is_ok(), batch, reporter);
        result
    }

    /// Query the peer's identity and peer list.
    pub async fn hive_state(&self) -> Result<HiveState, RpcError> {
        match Self::call(&self.cmd, &Request::HiveState).await? {
            Response::HiveState(state) => Ok(state),
            Response::Error(message) => Err(RpcError::Remote { message }),
            _ => Err(RpcError::UnexpectedResponse { method: "HiveState" }),
        }
    }

    /// Close every stream. Shared fallback streams tolerate the repeat
    /// close.
    pub async fn stop(&self) {
        for stream in [&self.cmd, &self.msg, &self.raft, &self.prio] {
            let mut guard = stream.lock().await;
            let _ = guard.close().await;
        }
    }
}

async fn dial_stream(
    addr: SocketAddr,
    dial_timeout: Duration,
    kind: StreamKind,
) -> Result<WireStream, RpcError> {
    let socket = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RpcError::Dial {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
        })?
        .map_err(|source| RpcError::Dial { addr, source })?;
    socket.set_nodelay(true).ok();

    let mut stream = wire::frame(socket);
    wire::send_frame(&mut stream, &StreamHandshake { kind }).await?;
    Ok(stream)
}

/// Dial `addr`, query its `HiveState`, and close the transient client.
pub async fn fetch_stage_state(
    addr: SocketAddr,
    dial_timeout: Duration,
) -> Result<HiveState, RpcError> {
    let client = RpcClient::connect(addr, dial_timeout).await?;
    let state = client.hive_state().await;
    client.stop().await;
    state
}
