//! Receiver execution: the per-shard tasks messages are delivered to.
//!
//! Three variants share one structure (bounded data queue, control queue,
//! execution task): a *local* receiver executes handlers against its private
//! state, a *proxy* receiver relays to a remote receiver through the RPC
//! pool, and the *detached* receiver drives an application-supplied handler
//! for the actor's non-keyed stream.
//!
//! On stop, a receiver hands its un-drained data queue (and state) back to
//! the caller; migration relies on this to convert a stopped local receiver
//! into a proxy without dropping queued messages.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::actor::{DetachedHandler, MsgAndHandler, RcvContext, ReceiverState};
use crate::rpc::pool::RpcClientPool;
use crate::types::{Message, ReceiverId};

/// Upper bound on messages coalesced into one proxy relay.
const MAX_FORWARD_BATCH: usize = 64;

/// Control commands understood by every receiver variant.
pub(crate) enum RcvrCmd {
    /// Stop the receiver. If `reply` is set, the receiver hands back its
    /// queue and state before terminating.
    Stop {
        reply: Option<oneshot::Sender<StoppedReceiver>>,
    },
}

/// What a stopped receiver hands back: the un-drained data queue and the
/// private state it was executing against.
pub(crate) struct StoppedReceiver {
    pub data_rx: mpsc::Receiver<MsgAndHandler>,
    pub state: ReceiverState,
}

/// Which variant a receiver is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiverKind {
    Local,
    Proxy,
    Detached,
}

/// Shared handle to a running receiver task. Cloned into the mapper's
/// indices; during migration the same handle is installed under both the
/// old and new ids.
pub(crate) struct ReceiverHandle {
    id: ReceiverId,
    kind: ReceiverKind,
    data_tx: mpsc::Sender<MsgAndHandler>,
    ctrl_tx: mpsc::Sender<RcvrCmd>,
}

impl ReceiverHandle {
    pub(crate) fn id(&self) -> &ReceiverId {
        &self.id
    }

    pub(crate) fn is_local(&self) -> bool {
        self.kind == ReceiverKind::Local
    }

    /// The sender feeding this receiver's data queue. Migration reuses it
    /// when rebuilding the handle around the same queue.
    pub(crate) fn data_tx(&self) -> mpsc::Sender<MsgAndHandler> {
        self.data_tx.clone()
    }

    /// Enqueue a message; blocks when the data queue is full.
    pub(crate) async fn enque_msg(&self, mh: MsgAndHandler) {
        if self.data_tx.send(mh).await.is_err() {
            warn!(rcvr = %self.id, "dropping message for stopped receiver");
        }
    }

    /// Send a stop without waiting for the receiver to wind down.
    pub(crate) async fn stop(&self) {
        let _ = self.ctrl_tx.send(RcvrCmd::Stop { reply: None }).await;
    }

    /// Stop the receiver and wait for it to hand back its queue and state.
    /// Returns `None` if the receiver was already gone.
    pub(crate) async fn stop_and_wait(&self) -> Option<StoppedReceiver> {
        let (tx, rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(RcvrCmd::Stop { reply: Some(tx) })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }
}

/// Spawn a local receiver executing handlers against fresh private state.
pub(crate) fn spawn_local(
    id: ReceiverId,
    capacity: usize,
    outbox: mpsc::Sender<Message>,
) -> Arc<ReceiverHandle> {
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
    let ctx = RcvContext::new(id.clone(), ReceiverState::new(), outbox);

    let handle = Arc::new(ReceiverHandle {
        id: id.clone(),
        kind: ReceiverKind::Local,
        data_tx,
        ctrl_tx,
    });
    tokio::spawn(run_local(id, data_rx, ctrl_rx, ctx));
    handle
}

async fn run_local(
    id: ReceiverId,
    mut data_rx: mpsc::Receiver<MsgAndHandler>,
    mut ctrl_rx: mpsc::Receiver<RcvrCmd>,
    mut ctx: RcvContext,
) {
    let mut stop_reply = None;
    loop {
        tokio::select! {
            cmd = ctrl_rx.recv() => match cmd {
                Some(RcvrCmd::Stop { reply }) => {
                    stop_reply = reply;
                    break;
                }
                None => break,
            },
            mh = data_rx.recv() => match mh {
                Some(mh) => {
                    let Some(handler) = mh.handler.clone() else {
                        warn!(rcvr = %id, "local receiver got a message without a handler");
                        continue;
                    };
                    if let Err(err) = handler.rcv(mh.msg, &mut ctx).await {
                        warn!(rcvr = %id, error = %err, "handler failed");
                    }
                }
                None => break,
            },
        }
    }

    debug!(rcvr = %id, "local receiver stopped");
    if let Some(reply) = stop_reply {
        let _ = reply.send(StoppedReceiver {
            data_rx,
            state: ctx.into_state(),
        });
    }
}

/// Spawn a proxy receiver forwarding to `remote` with a fresh queue.
pub(crate) fn spawn_proxy(
    remote: ReceiverId,
    capacity: usize,
    pool: Arc<RpcClientPool>,
) -> Arc<ReceiverHandle> {
    let (data_tx, data_rx) = mpsc::channel(capacity);
    spawn_proxy_task(remote, data_tx, data_rx, pool)
}

/// Rebuild a stopped receiver as a proxy to `remote`, reusing its data
/// queue so in-flight messages are forwarded rather than dropped.
pub(crate) fn proxy_from_stopped(
    remote: ReceiverId,
    data_tx: mpsc::Sender<MsgAndHandler>,
    stopped: StoppedReceiver,
    pool: Arc<RpcClientPool>,
) -> Arc<ReceiverHandle> {
    spawn_proxy_task(remote, data_tx, stopped.data_rx, pool)
}

fn spawn_proxy_task(
    remote: ReceiverId,
    data_tx: mpsc::Sender<MsgAndHandler>,
    data_rx: mpsc::Receiver<MsgAndHandler>,
    pool: Arc<RpcClientPool>,
) -> Arc<ReceiverHandle> {
    let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
    let handle = Arc::new(ReceiverHandle {
        id: remote.clone(),
        kind: ReceiverKind::Proxy,
        data_tx,
        ctrl_tx,
    });
    tokio::spawn(run_proxy(remote, data_rx, ctrl_rx, pool));
    handle
}

async fn run_proxy(
    remote: ReceiverId,
    mut data_rx: mpsc::Receiver<MsgAndHandler>,
    mut ctrl_rx: mpsc::Receiver<RcvrCmd>,
    pool: Arc<RpcClientPool>,
) {
    let mut stop_reply = None;
    loop {
        tokio::select! {
            cmd = ctrl_rx.recv() => match cmd {
                Some(RcvrCmd::Stop { reply }) => {
                    stop_reply = reply;
                    break;
                }
                None => break,
            },
            mh = data_rx.recv() => match mh {
                Some(first) => {
                    let mut batch = vec![first];
                    while batch.len() < MAX_FORWARD_BATCH {
                        match data_rx.try_recv() {
                            Ok(mh) => batch.push(mh),
                            Err(_) => break,
                        }
                    }
                    let msgs: Vec<Message> = batch
                        .into_iter()
                        .map(|mh| {
                            let mut msg = mh.msg;
                            msg.to = Some(remote.clone());
                            msg
                        })
                        .collect();
                    if let Err(err) = pool.send_msg(msgs).await {
                        warn!(remote = %remote, error = %err, "proxy relay failed");
                    }
                }
                None => break,
            },
        }
    }

    debug!(remote = %remote, "proxy receiver stopped");
    if let Some(reply) = stop_reply {
        let _ = reply.send(StoppedReceiver {
            data_rx,
            state: ReceiverState::new(),
        });
    }
}

/// Spawn the detached receiver for an actor, driving `handler` over the
/// actor's non-keyed input stream.
pub(crate) fn spawn_detached(
    id: ReceiverId,
    capacity: usize,
    mut handler: Box<dyn DetachedHandler>,
    outbox: mpsc::Sender<Message>,
) -> Arc<ReceiverHandle> {
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
    let ctx = RcvContext::new(id.clone(), ReceiverState::new(), outbox);

    let handle = Arc::new(ReceiverHandle {
        id: id.clone(),
        kind: ReceiverKind::Detached,
        data_tx,
        ctrl_tx,
    });
    tokio::spawn(async move {
        run_detached(id, data_rx, ctrl_rx, handler.as_mut(), ctx).await;
    });
    handle
}

async fn run_detached(
    id: ReceiverId,
    mut data_rx: mpsc::Receiver<MsgAndHandler>,
    mut ctrl_rx: mpsc::Receiver<RcvrCmd>,
    handler: &mut dyn DetachedHandler,
    mut ctx: RcvContext,
) {
    handler.started(&mut ctx).await;

    let mut stop_reply = None;
    loop {
        tokio::select! {
            cmd = ctrl_rx.recv() => match cmd {
                Some(RcvrCmd::Stop { reply }) => {
                    stop_reply = reply;
                    break;
                }
                None => break,
            },
            mh = data_rx.recv() => match mh {
                Some(mh) => {
                    if let Err(err) = handler.rcv(mh.msg, &mut ctx).await {
                        warn!(rcvr = %id, error = %err, "detached handler failed");
                    }
                }
                None => break,
            },
        }
    }

    handler.stopped(&mut ctx).await;
    debug!(rcvr = %id, "detached receiver stopped");
    if let Some(reply) = stop_reply {
        let _ = reply.send(StoppedReceiver {
            data_rx,
            state: ctx.into_state(),
        });
    }
}
