//! RPC server: accepts framed connections and dispatches wire requests.
//!
//! Each connection declares its stream kind in a handshake frame. Cmd, msg,
//! raft and prio streams then carry request/response pairs in lockstep;
//! ctrl streams carry the one-shot migration handshake. Commands are routed
//! to the stage's local control channels; while a local handler is slow the
//! server logs a stall warning on every watchdog period but never aborts
//! the wait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stage::StageInner;

use super::wire::{
    self, CmdResult, RemoteCommand, RemoteCommandKind, Request, Response, StreamHandshake,
    StreamKind, WireStream,
};
use super::RpcError;

/// Handle to the listening RPC server task.
pub(crate) struct RpcServer {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl RpcServer {
    /// Spawn the server on an already-bound listener.
    pub(crate) fn spawn(
        listener: TcpListener,
        stage: Arc<StageInner>,
        watchdog: Duration,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let cancel_clone = cancel_token.clone();

        let join_handle = tokio::spawn(async move {
            if let Err(err) = run_server(listener, stage, watchdog, cancel_clone).await {
                error!(error = %err, "rpc server task failed");
            }
        });

        Self {
            join_handle,
            cancel_token,
        }
    }

    /// Shut the server down gracefully.
    pub(crate) async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();
        self.join_handle.await.context("rpc server task panicked")?;
        Ok(())
    }
}

async fn run_server(
    listener: TcpListener,
    stage: Arc<StageInner>,
    watchdog: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr().context("listener address")?, "rpc server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("rpc server received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };

                let stage = Arc::clone(&stage);
                let conn_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = conn_cancel.cancelled() => {}
                        result = handle_connection(socket, stage, watchdog) => {
                            if let Err(err) = result {
                                debug!(%peer, error = %err, "connection ended with error");
                            }
                        }
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    stage: Arc<StageInner>,
    watchdog: Duration,
) -> Result<()> {
    socket.set_nodelay(true).ok();
    let mut stream = wire::frame(socket);

    let handshake: StreamHandshake = wire::recv_frame(&mut stream)
        .await
        .context("reading stream handshake")?;
    debug!(kind = ?handshake.kind, "accepted stream");

    match handshake.kind {
        StreamKind::Ctrl => handle_ctrl_stream(stream, stage).await,
        _ => handle_rpc_stream(stream, stage, watchdog).await,
    }
}

/// Request/response loop for a cmd, msg, raft or prio stream. Requests on
/// one stream are handled in order, which preserves per-sender FIFO for
/// messages sharing a destination.
async fn handle_rpc_stream(
    mut stream: WireStream,
    stage: Arc<StageInner>,
    watchdog: Duration,
) -> Result<()> {
    loop {
        let request: Request = match wire::recv_frame(&mut stream).await {
            Ok(request) => request,
            Err(RpcError::Shutdown) => return Ok(()),
            Err(err) => return Err(err).context("reading request frame"),
        };

        let response = handle_request(request, &stage, watchdog).await;
        wire::send_frame(&mut stream, &response)
            .await
            .context("writing response frame")?;
    }
}

async fn handle_request(
    request: Request,
    stage: &Arc<StageInner>,
    watchdog: Duration,
) -> Response {
    match request {
        Request::HiveState => Response::HiveState(stage.hive_state()),

        Request::EnqueMsg(msgs) => {
            for msg in msgs {
                if let Err(err) = stage.enque_msg(msg).await {
                    warn!(error = %err, "failed to dispatch incoming message");
                }
            }
            Response::EnqueMsg
        }

        Request::ProcessRaft(batch) => {
            if batch.to != stage.id() {
                error!(to = %batch.to, "received a raft batch for another stage");
                return Response::Error(format!(
                    "stage {} received a raft batch for {}",
                    stage.id(),
                    batch.to
                ));
            }
            match stage.step_batch(batch).await {
                Ok(()) => Response::ProcessRaft,
                Err(err) => Response::Error(err.to_string()),
            }
        }

        Request::ProcessCmd(cmds) => {
            let mut results = Vec::with_capacity(cmds.len());
            for cmd in cmds {
                let desc = format!("{:?}", cmd.kind);
                match stage.route_cmd(cmd).await {
                    Err(result) => results.push(result),
                    Ok(rx) => results.push(await_with_watchdog(rx, &desc, watchdog).await),
                }
            }
            Response::ProcessCmd(results)
        }
    }
}

/// Wait for a local handler's reply, logging a stall warning every watchdog
/// period. Never aborts: the handler may be legitimately slow.
async fn await_with_watchdog(
    mut rx: tokio::sync::oneshot::Receiver<CmdResult>,
    desc: &str,
    period: Duration,
) -> CmdResult {
    let mut tick = tokio::time::interval(period);
    tick.tick().await;
    loop {
        tokio::select! {
            result = &mut rx => {
                return result.unwrap_or_else(|_| CmdResult::err("command handler dropped"));
            }
            _ = tick.tick() => {
                warn!(command = %desc, "still waiting on local handler");
            }
        }
    }
}

/// One-shot migration handshake: create a receiver for the named actor and
/// answer with its assigned id. On failure the stream is closed without an
/// answer; the migration source observes the truncated read and aborts.
async fn handle_ctrl_stream(mut stream: WireStream, stage: Arc<StageInner>) -> Result<()> {
    let remote: RemoteCommand = wire::recv_frame(&mut stream)
        .await
        .context("reading remote command")?;

    match remote.cmd {
        RemoteCommandKind::NewRcvr => match stage.new_receiver(&remote.id.actor).await {
            Ok(id) => {
                debug!(%id, "assigned receiver for remote command");
                wire::send_frame(&mut stream, &id)
                    .await
                    .context("writing assigned receiver id")?;
                Ok(())
            }
            Err(err) => {
                warn!(actor = %remote.id.actor, error = %err, "remote new-receiver failed");
                Ok(())
            }
        },
    }
}
