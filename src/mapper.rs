//! The per-(stage, actor) mapper: routing, placement, and migration.
//!
//! A mapper is a single-threaded cooperative task reading from two queues:
//! a bounded data queue of messages and a control queue of commands. It is
//! the sole owner and mutator of the local `id -> receiver` and
//! `key -> receiver` indices and of the receiver-number counter, so none of
//! that state needs locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::actor::{DetachedHandler, MapContext, MsgAndHandler};
use crate::receiver::{self, ReceiverHandle};
use crate::registry::{Registry, RegistryError};
use crate::rpc::pool::{PeerDirectory, RpcClientPool};
use crate::rpc::wire::{self, RemoteCommand, RemoteCommandKind, StreamHandshake, StreamKind};
use crate::rpc::RpcError;
use crate::types::{
    ActorName, DictionaryKey, MapSet, Message, ReceiverId, StageId, DETACHED_RCVR_NUM,
};

/// Errors from mapper operations.
///
/// Fatal variants indicate a violated routing or handler contract; the
/// mapper stops its receivers and terminates when it hits one.
#[derive(Debug, Snafu)]
pub enum MapperError {
    /// Lookup miss: no receiver with that id on this mapper.
    #[snafu(display("no receiver found: {id}"))]
    ReceiverNotFound {
        /// The queried id.
        id: ReceiverId,
    },

    /// A unicast message named a local receiver that does not exist. This
    /// violates the routing invariant and is fatal.
    #[snafu(display("unicast to unknown local receiver {id}"))]
    LocalReceiverMissing {
        /// The addressed id.
        id: ReceiverId,
    },

    /// A keyed message arrived without a handler. Fatal.
    #[snafu(display("keyed message for actor {actor} carries no handler"))]
    MissingHandler {
        /// The destination actor.
        actor: ActorName,
    },

    /// A handler's map-set straddles two local receivers. Fatal.
    #[snafu(display("map-set splits at {key}: bound to {bound}, claimed for {claimed}"))]
    MapSetSplit {
        /// The key bound elsewhere.
        key: DictionaryKey,
        /// Receiver the key is bound to.
        bound: ReceiverId,
        /// Receiver the map-set resolved to.
        claimed: ReceiverId,
    },

    /// The actor already has a detached handler on this stage.
    #[snafu(display("actor {actor} already has a detached handler"))]
    DetachedExists {
        /// The actor.
        actor: ActorName,
    },

    /// The detached receiver cannot be migrated.
    #[snafu(display("cannot migrate the detached receiver {id}"))]
    MigrateDetached {
        /// The detached id.
        id: ReceiverId,
    },

    /// Migration source must be a local receiver.
    #[snafu(display("receiver {id} is not local to this stage"))]
    NotLocal {
        /// The non-local id.
        id: ReceiverId,
    },

    /// The migration target handed back an id already present here.
    #[snafu(display("receiver {id} already exists"))]
    ReceiverExists {
        /// The clashing id.
        id: ReceiverId,
    },

    /// The migration target handed back an id on this stage.
    #[snafu(display("migration target assigned a local id {id}"))]
    UnexpectedLocalId {
        /// The bogus id.
        id: ReceiverId,
    },

    /// A receiver died before acknowledging its stop.
    #[snafu(display("receiver {id} stopped before acknowledging"))]
    StopFailed {
        /// The receiver.
        id: ReceiverId,
    },

    /// The mapper itself is no longer running.
    #[snafu(display("mapper for actor {actor} is stopped"))]
    Stopped {
        /// The actor.
        actor: ActorName,
    },

    /// A registry operation failed.
    #[snafu(display("registry failure: {source}"))]
    Registry {
        /// The registry error.
        source: RegistryError,
    },

    /// An RPC step failed.
    #[snafu(display("rpc failure: {source}"))]
    Rpc {
        /// The RPC error.
        source: RpcError,
    },
}

impl MapperError {
    /// Whether this error terminates the mapper.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MapperError::LocalReceiverMissing { .. }
                | MapperError::MissingHandler { .. }
                | MapperError::MapSetSplit { .. }
                | MapperError::Registry {
                    source: RegistryError::PlacementInconsistency { .. }
                }
        )
    }
}

/// Control commands understood by a mapper.
pub(crate) enum MapperCmd {
    Stop {
        reply: Option<oneshot::Sender<()>>,
    },
    FindRcvr {
        id: ReceiverId,
        reply: oneshot::Sender<Result<ReceiverId, MapperError>>,
    },
    NewRcvr {
        reply: oneshot::Sender<ReceiverId>,
    },
    MigrateRcvr {
        from: ReceiverId,
        to: StageId,
        reply: oneshot::Sender<Result<ReceiverId, MapperError>>,
    },
    StopRcvr {
        id: ReceiverId,
        reply: oneshot::Sender<Result<(), MapperError>>,
    },
    RegisterDetached {
        handler: Box<dyn DetachedHandler>,
        reply: oneshot::Sender<Result<(), MapperError>>,
    },
}

/// Handle to a running mapper task.
#[derive(Clone)]
pub struct MapperHandle {
    actor: ActorName,
    data_tx: mpsc::Sender<MsgAndHandler>,
    ctrl_tx: mpsc::Sender<MapperCmd>,
}

impl MapperHandle {
    /// The actor this mapper serves.
    pub fn actor(&self) -> &ActorName {
        &self.actor
    }

    pub(crate) async fn deliver(&self, mh: MsgAndHandler) -> Result<(), MapperError> {
        self.data_tx.send(mh).await.map_err(|_| MapperError::Stopped {
            actor: self.actor.clone(),
        })
    }

    async fn ctrl(&self, cmd: MapperCmd) -> Result<(), MapperError> {
        self.ctrl_tx
            .send(cmd)
            .await
            .map_err(|_| MapperError::Stopped {
                actor: self.actor.clone(),
            })
    }

    /// Stop the mapper and all its receivers, waiting for the ack.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ctrl(MapperCmd::Stop { reply: Some(tx) }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Synchronous lookup of a receiver by id.
    pub async fn find_receiver(&self, id: ReceiverId) -> Result<ReceiverId, MapperError> {
        let (tx, rx) = oneshot::channel();
        self.ctrl(MapperCmd::FindRcvr { id, reply: tx }).await?;
        rx.await.map_err(|_| MapperError::Stopped {
            actor: self.actor.clone(),
        })?
    }

    /// Allocate a fresh local receiver and return its id. The receiver owns
    /// no keys yet, so no registry claim is made.
    pub async fn new_receiver(&self) -> Result<ReceiverId, MapperError> {
        let (tx, rx) = oneshot::channel();
        self.ctrl(MapperCmd::NewRcvr { reply: tx }).await?;
        rx.await.map_err(|_| MapperError::Stopped {
            actor: self.actor.clone(),
        })
    }

    /// Migrate receiver `from` to stage `to`; returns the new remote id.
    pub async fn migrate(&self, from: ReceiverId, to: StageId) -> Result<ReceiverId, MapperError> {
        let (tx, rx) = oneshot::channel();
        self.ctrl(MapperCmd::MigrateRcvr {
            from,
            to,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| MapperError::Stopped {
            actor: self.actor.clone(),
        })?
    }

    /// Stop a single receiver by id.
    pub async fn stop_receiver(&self, id: ReceiverId) -> Result<(), MapperError> {
        let (tx, rx) = oneshot::channel();
        self.ctrl(MapperCmd::StopRcvr { id, reply: tx }).await?;
        rx.await.map_err(|_| MapperError::Stopped {
            actor: self.actor.clone(),
        })?
    }

    /// Install the actor's detached handler on this stage. Fails if one is
    /// already registered.
    pub async fn register_detached(
        &self,
        handler: Box<dyn DetachedHandler>,
    ) -> Result<(), MapperError> {
        let (tx, rx) = oneshot::channel();
        self.ctrl(MapperCmd::RegisterDetached { handler, reply: tx })
            .await?;
        rx.await.map_err(|_| MapperError::Stopped {
            actor: self.actor.clone(),
        })?
    }
}

/// Everything a mapper needs from its stage.
pub(crate) struct MapperSpec {
    pub stage: StageId,
    pub actor: ActorName,
    pub registry: Option<Arc<Registry>>,
    pub isolated: bool,
    pub pool: Arc<RpcClientPool>,
    pub directory: Arc<dyn PeerDirectory>,
    pub outbox: mpsc::Sender<Message>,
    pub capacity: usize,
    pub dial_timeout: Duration,
    pub reclaim_interval: Duration,
}

/// Spawn a mapper task and return its handle.
pub(crate) fn spawn_mapper(spec: MapperSpec) -> MapperHandle {
    let (data_tx, data_rx) = mpsc::channel(spec.capacity);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(spec.capacity);
    let handle = MapperHandle {
        actor: spec.actor.clone(),
        data_tx,
        ctrl_tx,
    };

    let mapper = Mapper {
        stage: spec.stage,
        actor: spec.actor,
        registry: spec.registry,
        isolated: spec.isolated,
        pool: spec.pool,
        directory: spec.directory,
        outbox: spec.outbox,
        capacity: spec.capacity,
        dial_timeout: spec.dial_timeout,
        reclaim_interval: spec.reclaim_interval,
        last_rid: 0,
        id_to_rcvrs: HashMap::new(),
        key_to_rcvrs: HashMap::new(),
    };
    tokio::spawn(mapper.run(data_rx, ctrl_rx));
    handle
}

enum Flow {
    Continue,
    Stop,
}

struct Mapper {
    stage: StageId,
    actor: ActorName,
    registry: Option<Arc<Registry>>,
    isolated: bool,
    pool: Arc<RpcClientPool>,
    directory: Arc<dyn PeerDirectory>,
    outbox: mpsc::Sender<Message>,
    capacity: usize,
    dial_timeout: Duration,
    reclaim_interval: Duration,
    last_rid: u32,
    id_to_rcvrs: HashMap<ReceiverId, Arc<ReceiverHandle>>,
    key_to_rcvrs: HashMap<DictionaryKey, Arc<ReceiverHandle>>,
}

impl Mapper {
    async fn run(
        mut self,
        mut data_rx: mpsc::Receiver<MsgAndHandler>,
        mut ctrl_rx: mpsc::Receiver<MapperCmd>,
    ) {
        let mut reclaim = tokio::time::interval(self.reclaim_interval);
        reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        reclaim.tick().await;

        loop {
            tokio::select! {
                mh = data_rx.recv() => match mh {
                    Some(mh) => {
                        if let Err(err) = self.handle_msg(mh).await {
                            if err.is_fatal() {
                                error!(actor = %self.actor, error = %err, "fatal routing failure, stopping mapper");
                                self.stop_receivers().await;
                                return;
                            }
                            warn!(actor = %self.actor, error = %err, "message dropped");
                        }
                    }
                    None => break,
                },
                cmd = ctrl_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Flow::Stop = self.handle_cmd(cmd).await {
                            return;
                        }
                    }
                    None => break,
                },
                _ = reclaim.tick() => self.reclaim().await,
            }
        }

        self.stop_receivers().await;
    }

    fn is_isolated(&self) -> bool {
        self.isolated || self.registry.is_none()
    }

    fn detached_rcvr_id(&self) -> ReceiverId {
        ReceiverId {
            stage: self.stage,
            actor: self.actor.clone(),
            rcvr: DETACHED_RCVR_NUM,
        }
    }

    fn next_rcvr_id(&mut self) -> ReceiverId {
        self.last_rid += 1;
        ReceiverId {
            stage: self.stage,
            actor: self.actor.clone(),
            rcvr: self.last_rid,
        }
    }

    async fn handle_msg(&mut self, mh: MsgAndHandler) -> Result<(), MapperError> {
        if let Some(to) = mh.msg.to.clone() {
            debug!(actor = %self.actor, %to, "unicast message");
            let rcvr = match self.id_to_rcvrs.get(&to) {
                Some(rcvr) => Arc::clone(rcvr),
                None => {
                    if to.stage == self.stage {
                        return LocalReceiverMissingSnafu { id: to }.fail();
                    }
                    self.find_or_create_receiver(to.clone())
                }
            };

            if mh.handler.is_none() && !to.is_detached() {
                return MissingHandlerSnafu {
                    actor: self.actor.clone(),
                }
                .fail();
            }

            rcvr.enque_msg(mh).await;
            return Ok(());
        }

        let handler = mh.handler.clone().ok_or_else(|| MapperError::MissingHandler {
            actor: self.actor.clone(),
        })?;
        let map_ctx = MapContext {
            stage: self.stage,
            actor: self.actor.clone(),
        };
        let map_set = handler.map(&mh.msg, &map_ctx);
        if map_set.is_empty() {
            warn!(actor = %self.actor, "handler mapped a message to an empty key-set, dropping");
            return Ok(());
        }

        let rcvr = match self.any_receiver(&map_set) {
            Some(rcvr) => {
                self.sync_receivers(&map_set, &rcvr).await?;
                rcvr
            }
            None => self.new_receiver_for_map_set(&map_set).await?,
        };
        rcvr.enque_msg(mh).await;
        Ok(())
    }

    /// First receiver already bound to any key of `map_set`.
    fn any_receiver(&self, map_set: &MapSet) -> Option<Arc<ReceiverHandle>> {
        map_set
            .iter()
            .find_map(|dk| self.key_to_rcvrs.get(dk).cloned())
    }

    /// Bind every unbound key of `map_set` to `rcvr`; a key bound to a
    /// different receiver is a fatal split.
    async fn sync_receivers(
        &mut self,
        map_set: &MapSet,
        rcvr: &Arc<ReceiverHandle>,
    ) -> Result<(), MapperError> {
        for dk in map_set {
            match self.key_to_rcvrs.get(dk) {
                None => self.lock_key(dk, rcvr).await?,
                Some(bound) if Arc::ptr_eq(bound, rcvr) => {}
                Some(bound) => {
                    return MapSetSplitSnafu {
                        key: dk.clone(),
                        bound: bound.id().clone(),
                        claimed: rcvr.id().clone(),
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    /// Bind a single key to `rcvr`, registering the claim cluster-wide.
    async fn lock_key(
        &mut self,
        dk: &DictionaryKey,
        rcvr: &Arc<ReceiverHandle>,
    ) -> Result<(), MapperError> {
        self.key_to_rcvrs.insert(dk.clone(), Arc::clone(rcvr));
        if self.is_isolated() {
            return Ok(());
        }
        let single = MapSet::new(vec![dk.clone()]);
        self.registry
            .as_ref()
            .expect("registry present when not isolated")
            .store_or_get(rcvr.id(), &single)
            .await
            .context(RegistrySnafu)?;
        Ok(())
    }

    /// Claim `map_set` and return the owning receiver id: a fresh local id
    /// if we won the placement, otherwise the current owner. A lost race
    /// rewinds the tentative receiver number.
    async fn lock(&mut self, map_set: &MapSet, force: bool) -> Result<ReceiverId, MapperError> {
        let tentative = self.next_rcvr_id();
        if self.is_isolated() {
            return Ok(tentative);
        }

        let registry = self
            .registry
            .as_ref()
            .expect("registry present when not isolated");
        let val = if force {
            registry.set(&tentative, map_set).await
        } else {
            registry.store_or_get(&tentative, map_set).await
        }
        .context(RegistrySnafu)?;

        if val.is(&tentative) {
            return Ok(tentative);
        }

        // The tentative id was never used; rewind so allocation stays dense.
        self.last_rid -= 1;
        Ok(val.receiver_id(&self.actor))
    }

    async fn new_receiver_for_map_set(
        &mut self,
        map_set: &MapSet,
    ) -> Result<Arc<ReceiverHandle>, MapperError> {
        let id = self.lock(map_set, false).await?;
        let rcvr = self.find_or_create_receiver(id);
        for dk in map_set {
            self.key_to_rcvrs.insert(dk.clone(), Arc::clone(&rcvr));
        }
        Ok(rcvr)
    }

    /// Return the receiver with `id`, creating it if unknown: a local
    /// receiver when the id is ours, otherwise a proxy to its stage.
    fn find_or_create_receiver(&mut self, id: ReceiverId) -> Arc<ReceiverHandle> {
        if let Some(rcvr) = self.id_to_rcvrs.get(&id) {
            return Arc::clone(rcvr);
        }

        let rcvr = if id.stage == self.stage {
            debug!(actor = %self.actor, %id, "creating local receiver");
            receiver::spawn_local(id.clone(), self.capacity, self.outbox.clone())
        } else {
            debug!(actor = %self.actor, %id, "creating proxy receiver");
            receiver::spawn_proxy(id.clone(), self.capacity, Arc::clone(&self.pool))
        };
        self.id_to_rcvrs.insert(id, Arc::clone(&rcvr));
        rcvr
    }

    async fn handle_cmd(&mut self, cmd: MapperCmd) -> Flow {
        match cmd {
            MapperCmd::Stop { reply } => {
                self.stop_receivers().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                Flow::Stop
            }
            MapperCmd::FindRcvr { id, reply } => {
                let result = self
                    .id_to_rcvrs
                    .get(&id)
                    .map(|rcvr| rcvr.id().clone())
                    .ok_or(MapperError::ReceiverNotFound { id });
                let _ = reply.send(result);
                Flow::Continue
            }
            MapperCmd::NewRcvr { reply } => {
                let id = self.next_rcvr_id();
                let rcvr = self.find_or_create_receiver(id);
                debug!(actor = %self.actor, id = %rcvr.id(), "created new local receiver");
                let _ = reply.send(rcvr.id().clone());
                Flow::Continue
            }
            MapperCmd::MigrateRcvr { from, to, reply } => {
                let result = self.migrate(from, to).await;
                let _ = reply.send(result);
                Flow::Continue
            }
            MapperCmd::StopRcvr { id, reply } => {
                let result = match self.id_to_rcvrs.get(&id) {
                    Some(rcvr) => {
                        rcvr.stop().await;
                        Ok(())
                    }
                    None => Err(MapperError::ReceiverNotFound { id }),
                };
                let _ = reply.send(result);
                Flow::Continue
            }
            MapperCmd::RegisterDetached { handler, reply } => {
                let _ = reply.send(self.register_detached(handler));
                Flow::Continue
            }
        }
    }

    fn register_detached(&mut self, handler: Box<dyn DetachedHandler>) -> Result<(), MapperError> {
        let id = self.detached_rcvr_id();
        if self.id_to_rcvrs.contains_key(&id) {
            return DetachedExistsSnafu {
                actor: self.actor.clone(),
            }
            .fail();
        }
        let rcvr =
            receiver::spawn_detached(id.clone(), self.capacity, handler, self.outbox.clone());
        self.id_to_rcvrs.insert(id, rcvr);
        Ok(())
    }

    /// Every key currently bound to receiver `id`.
    fn map_set_of_rcvr(&self, id: &ReceiverId) -> MapSet {
        self.key_to_rcvrs
            .iter()
            .filter(|(_, rcvr)| rcvr.id() == id)
            .map(|(dk, _)| dk.clone())
            .collect()
    }

    /// Re-assert registry records for every local receiver's keys so TTL
    /// expiry never takes a live claim.
    async fn reclaim(&self) {
        if self.is_isolated() {
            return;
        }
        let registry = self
            .registry
            .as_ref()
            .expect("registry present when not isolated");

        let mut per_rcvr: HashMap<ReceiverId, Vec<DictionaryKey>> = HashMap::new();
        for (dk, rcvr) in &self.key_to_rcvrs {
            if rcvr.is_local() {
                per_rcvr
                    .entry(rcvr.id().clone())
                    .or_default()
                    .push(dk.clone());
            }
        }

        for (id, keys) in per_rcvr {
            let map_set = MapSet::new(keys);
            if let Err(err) = registry.refresh(&id, &map_set).await {
                warn!(actor = %self.actor, rcvr = %id, error = %err, "registry refresh failed");
            }
        }
    }

    async fn stop_receivers(&mut self) {
        let mut seen: HashSet<usize> = HashSet::new();
        for rcvr in self.id_to_rcvrs.values() {
            if seen.insert(Arc::as_ptr(rcvr) as usize) {
                rcvr.stop().await;
            }
        }
        self.id_to_rcvrs.clear();
        self.key_to_rcvrs.clear();
    }

    /// Migrate a local receiver to stage `to`.
    ///
    /// The old receiver is stopped before the target-side receiver starts
    /// executing; its queue is reused by the replacement proxy, and both the
    /// old local id and the new remote id resolve to that proxy so in-flight
    /// messages are forwarded rather than dropped. No step is rolled back on
    /// failure; a later placement re-converges through the registry.
    async fn migrate(&mut self, from: ReceiverId, to: StageId) -> Result<ReceiverId, MapperError> {
        if from.is_detached() {
            return MigrateDetachedSnafu { id: from }.fail();
        }

        let old = self
            .id_to_rcvrs
            .get(&from)
            .cloned()
            .ok_or_else(|| MapperError::ReceiverNotFound { id: from.clone() })?;
        if !old.is_local() {
            return NotLocalSnafu { id: from }.fail();
        }

        let stopped = old
            .stop_and_wait()
            .await
            .ok_or_else(|| MapperError::StopFailed { id: from.clone() })?;
        debug!(actor = %self.actor, %from, "receiver stopped for migration");

        let new_id = self.remote_new_receiver(to).await?;
        debug!(actor = %self.actor, %new_id, "target assigned the migrated receiver");

        if new_id.stage == self.stage {
            return UnexpectedLocalIdSnafu { id: new_id }.fail();
        }
        if self.id_to_rcvrs.contains_key(&new_id) {
            return ReceiverExistsSnafu { id: new_id }.fail();
        }

        let proxy = receiver::proxy_from_stopped(
            new_id.clone(),
            old.data_tx(),
            stopped,
            Arc::clone(&self.pool),
        );
        // Alias both ids to the proxy: traffic still addressed to the old
        // local id must be forwarded, not dropped.
        self.id_to_rcvrs.insert(new_id.clone(), Arc::clone(&proxy));
        self.id_to_rcvrs.insert(from.clone(), Arc::clone(&proxy));

        let map_set = self.map_set_of_rcvr(&from);
        if !self.is_isolated() {
            self.registry
                .as_ref()
                .expect("registry present when not isolated")
                .set(&new_id, &map_set)
                .await
                .context(RegistrySnafu)?;
        }
        debug!(actor = %self.actor, %new_id, keys = map_set.len(), "ownership transferred");

        for dk in &map_set {
            self.key_to_rcvrs.insert(dk.clone(), Arc::clone(&proxy));
        }

        Ok(new_id)
    }

    /// Ask stage `to` to create a receiver for this actor over a transient
    /// control connection, and read back the assigned id.
    async fn remote_new_receiver(&self, to: StageId) -> Result<ReceiverId, MapperError> {
        let addr = self
            .directory
            .addr_of(to)
            .ok_or(RpcError::UnknownPeer { stage: to })
            .context(RpcSnafu)?;

        let socket = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Dial {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
            })
            .and_then(|r| r.map_err(|source| RpcError::Dial { addr, source }))
            .context(RpcSnafu)?;

        let mut stream = wire::frame(socket);
        wire::send_frame(
            &mut stream,
            &StreamHandshake {
                kind: StreamKind::Ctrl,
            },
        )
        .await
        .context(RpcSnafu)?;
        wire::send_frame(
            &mut stream,
            &RemoteCommand {
                cmd: RemoteCommandKind::NewRcvr,
                id: ReceiverId {
                    stage: to,
                    actor: self.actor.clone(),
                    rcvr: DETACHED_RCVR_NUM,
                },
            },
        )
        .await
        .context(RpcSnafu)?;

        let id: ReceiverId = wire::recv_frame(&mut stream).await.context(RpcSnafu)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::actor::{Handler, RcvContext};

    struct EmptyDirectory;

    impl PeerDirectory for EmptyDirectory {
        fn addr_of(&self, _stage: StageId) -> Option<SocketAddr> {
            None
        }
    }

    struct Recording {
        seen: Arc<Mutex<Vec<(ReceiverId, Vec<u8>)>>>,
    }

    #[async_trait]
    impl Handler for Recording {
        fn map(&self, msg: &Message, _ctx: &MapContext) -> MapSet {
            // First payload byte names the key.
            MapSet::new(vec![DictionaryKey::new("d", msg.payload.slice(0..1))])
        }

        async fn rcv(&self, msg: Message, ctx: &mut RcvContext) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((ctx.id().clone(), msg.payload.to_vec()));
            Ok(())
        }
    }

    fn isolated_mapper() -> (MapperHandle, mpsc::Receiver<Message>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(64);
        let directory: Arc<dyn PeerDirectory> = Arc::new(EmptyDirectory);
        let pool = Arc::new(RpcClientPool::new(
            Arc::clone(&directory),
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_secs(8),
        ));
        let handle = spawn_mapper(MapperSpec {
            stage: StageId(1),
            actor: ActorName::from("weather"),
            registry: None,
            isolated: true,
            pool,
            directory,
            outbox: outbox_tx,
            capacity: 64,
            dial_timeout: Duration::from_millis(100),
            reclaim_interval: Duration::from_secs(60),
        });
        (handle, outbox_rx)
    }

    #[tokio::test]
    async fn overlapping_keys_share_one_receiver() {
        let (mapper, _outbox) = isolated_mapper();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn Handler> = Arc::new(Recording { seen: seen.clone() });

        for payload in [b"a-first".as_slice(), b"a-second".as_slice()] {
            mapper
                .deliver(MsgAndHandler {
                    msg: Message::to_actor("weather", payload.to_vec()),
                    handler: Some(Arc::clone(&handler)),
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, seen[1].0);
        assert_eq!(seen[0].0.rcvr, 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_receivers() {
        let (mapper, _outbox) = isolated_mapper();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn Handler> = Arc::new(Recording { seen: seen.clone() });

        for payload in [b"a".as_slice(), b"b".as_slice()] {
            mapper
                .deliver(MsgAndHandler {
                    msg: Message::to_actor("weather", payload.to_vec()),
                    handler: Some(Arc::clone(&handler)),
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].0, seen[1].0);
    }

    #[tokio::test]
    async fn new_receiver_allocates_dense_ids() {
        let (mapper, _outbox) = isolated_mapper();
        let first = mapper.new_receiver().await.unwrap();
        let second = mapper.new_receiver().await.unwrap();
        assert_eq!(first.rcvr, 1);
        assert_eq!(second.rcvr, 2);

        let found = mapper.find_receiver(first.clone()).await.unwrap();
        assert_eq!(found, first);
        let missing = mapper
            .find_receiver(ReceiverId::new(StageId(1), "weather", 99))
            .await;
        assert!(matches!(missing, Err(MapperError::ReceiverNotFound { .. })));
    }

    #[tokio::test]
    async fn detached_registration_is_single() {
        struct Idle;

        #[async_trait]
        impl DetachedHandler for Idle {
            async fn started(&mut self, _ctx: &mut RcvContext) {}
            async fn rcv(&mut self, _msg: Message, _ctx: &mut RcvContext) -> anyhow::Result<()> {
                Ok(())
            }
            async fn stopped(&mut self, _ctx: &mut RcvContext) {}
        }

        let (mapper, _outbox) = isolated_mapper();
        mapper.register_detached(Box::new(Idle)).await.unwrap();
        let err = mapper.register_detached(Box::new(Idle)).await.unwrap_err();
        assert!(matches!(err, MapperError::DetachedExists { .. }));
    }

    #[tokio::test]
    async fn detached_receiver_cannot_migrate() {
        let (mapper, _outbox) = isolated_mapper();
        let err = mapper
            .migrate(
                ReceiverId::new(StageId(1), "weather", DETACHED_RCVR_NUM),
                StageId(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::MigrateDetached { .. }));
    }
}
