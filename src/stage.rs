//! Stage orchestration: one running node of the fabric.
//!
//! A stage wires together the registry client, the RPC client pool, the RPC
//! server, and one mapper per registered actor. It also owns the outbox
//! through which receivers emit messages back into the fabric, and the
//! trivial in-memory peer directory (discovery is out of scope).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::actor::{DetachedHandler, Handler, MsgAndHandler};
use crate::config::StageConfig;
use crate::consensus::{Batch, ConsensusStep};
use crate::kv::KvStore;
use crate::mapper::{spawn_mapper, MapperError, MapperHandle, MapperSpec};
use crate::registry::Registry;
use crate::rpc::pool::{PeerDirectory, RpcClientPool};
use crate::rpc::server::RpcServer;
use crate::rpc::wire::{Cmd, CmdData, CmdKind, CmdResult, HiveState, PeerInfo};
use crate::types::{ActorName, Message, ReceiverId, StageId};

/// In-memory peer directory maintained by the stage.
#[derive(Default)]
pub(crate) struct StageDirectory {
    peers: RwLock<HashMap<StageId, SocketAddr>>,
}

impl StageDirectory {
    fn add(&self, stage: StageId, addr: SocketAddr) {
        self.peers
            .write()
            .expect("peer directory lock poisoned")
            .insert(stage, addr);
    }

    fn list(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .expect("peer directory lock poisoned")
            .iter()
            .map(|(id, addr)| PeerInfo {
                id: *id,
                addr: addr.to_string(),
            })
            .collect()
    }
}

impl PeerDirectory for StageDirectory {
    fn addr_of(&self, stage: StageId) -> Option<SocketAddr> {
        self.peers
            .read()
            .expect("peer directory lock poisoned")
            .get(&stage)
            .copied()
    }
}

struct ActorEntry {
    handler: Option<Arc<dyn Handler>>,
    mapper: MapperHandle,
}

/// Shared core of a running stage; the RPC server dispatches into it.
pub(crate) struct StageInner {
    id: StageId,
    config: StageConfig,
    listen_addr: SocketAddr,
    registry: Option<Arc<Registry>>,
    pool: Arc<RpcClientPool>,
    directory: Arc<StageDirectory>,
    consensus: Option<Arc<dyn ConsensusStep>>,
    actors: RwLock<HashMap<ActorName, ActorEntry>>,
    outbox_tx: mpsc::Sender<Message>,
}

impl StageInner {
    pub(crate) fn id(&self) -> StageId {
        self.id
    }

    pub(crate) fn hive_state(&self) -> HiveState {
        HiveState {
            id: self.id,
            addr: self.listen_addr.to_string(),
            peers: self.directory.list(),
        }
    }

    fn actor_entry(&self, name: &ActorName) -> Option<(MapperHandle, Option<Arc<dyn Handler>>)> {
        self.actors
            .read()
            .expect("actor map lock poisoned")
            .get(name)
            .map(|entry| (entry.mapper.clone(), entry.handler.clone()))
    }

    /// Dispatch a message to its actor's mapper, pairing it with the
    /// actor's handler.
    pub(crate) async fn enque_msg(&self, msg: Message) -> Result<()> {
        let Some((mapper, handler)) = self.actor_entry(&msg.actor) else {
            bail!("no actor {} on stage {}", msg.actor, self.id);
        };

        if !msg.is_unicast() && handler.is_none() {
            warn!(actor = %msg.actor, "dropping keyed message: actor has no keyed handler");
            return Ok(());
        }

        mapper
            .deliver(MsgAndHandler { msg, handler })
            .await
            .context("mapper rejected message")
    }

    /// Route a wire command to the stage, an actor's mapper, or a single
    /// receiver. The returned channel resolves with the command's result;
    /// lookup misses resolve immediately.
    pub(crate) async fn route_cmd(
        &self,
        cmd: Cmd,
    ) -> std::result::Result<oneshot::Receiver<CmdResult>, CmdResult> {
        if let Some(stage) = cmd.stage {
            if stage != self.id {
                return Err(CmdResult::err(format!(
                    "stage {} received a command for {stage}",
                    self.id
                )));
            }
        }

        let (tx, rx) = oneshot::channel();

        let Some(actor) = cmd.actor.clone() else {
            // Stage-level command.
            match cmd.kind {
                CmdKind::Stop => {
                    let mappers = self.mappers();
                    tokio::spawn(async move {
                        for mapper in mappers {
                            mapper.stop().await;
                        }
                        let _ = tx.send(CmdResult::ok(None));
                    });
                    return Ok(rx);
                }
                _ => return Err(CmdResult::err("command requires an actor")),
            }
        };

        let Some((mapper, _)) = self.actor_entry(&actor) else {
            return Err(CmdResult::err(format!(
                "no actor {actor} on stage {}",
                self.id
            )));
        };

        match (cmd.kind, cmd.rcvr) {
            (CmdKind::Stop, Some(rcvr)) => {
                let id = ReceiverId {
                    stage: self.id,
                    actor,
                    rcvr,
                };
                tokio::spawn(async move {
                    let _ = tx.send(to_cmd_result(
                        mapper.stop_receiver(id).await.map(|()| None),
                    ));
                });
            }
            (CmdKind::Stop, None) => {
                tokio::spawn(async move {
                    mapper.stop().await;
                    let _ = tx.send(CmdResult::ok(None));
                });
            }
            (CmdKind::FindRcvr(id), _) => {
                tokio::spawn(async move {
                    let result = mapper.find_receiver(id).await;
                    let _ = tx.send(to_cmd_result(
                        result.map(|id| Some(CmdData::Rcvr(id))),
                    ));
                });
            }
            (CmdKind::NewRcvr { .. }, _) => {
                tokio::spawn(async move {
                    let result = mapper.new_receiver().await;
                    let _ = tx.send(to_cmd_result(
                        result.map(|id| Some(CmdData::Rcvr(id))),
                    ));
                });
            }
            (CmdKind::MigrateRcvr { from, to }, _) => {
                tokio::spawn(async move {
                    let result = mapper.migrate(from, to).await;
                    let _ = tx.send(to_cmd_result(
                        result.map(|id| Some(CmdData::Rcvr(id))),
                    ));
                });
            }
        }

        Ok(rx)
    }

    /// Create a fresh local receiver for `actor` (migration target side).
    pub(crate) async fn new_receiver(&self, actor: &ActorName) -> Result<ReceiverId, MapperError> {
        let Some((mapper, _)) = self.actor_entry(actor) else {
            return Err(MapperError::Stopped {
                actor: actor.clone(),
            });
        };
        mapper.new_receiver().await
    }

    /// Hand a consensus batch to the local consensus module, bounded by the
    /// heartbeat timeout.
    pub(crate) async fn step_batch(&self, batch: Batch) -> Result<()> {
        let Some(consensus) = self.consensus.clone() else {
            bail!("stage {} has no consensus module", self.id);
        };
        let heartbeat = self.config.heartbeat_timeout();
        tokio::time::timeout(2 * heartbeat, consensus.step_batch(batch, heartbeat))
            .await
            .context("consensus step timed out")?
    }

    fn mappers(&self) -> Vec<MapperHandle> {
        self.actors
            .read()
            .expect("actor map lock poisoned")
            .values()
            .map(|entry| entry.mapper.clone())
            .collect()
    }

    fn spawn_actor_mapper(&self, actor: ActorName) -> MapperHandle {
        spawn_mapper(MapperSpec {
            stage: self.id,
            actor,
            registry: self.registry.clone(),
            isolated: self.config.isolated,
            pool: Arc::clone(&self.pool),
            directory: Arc::clone(&self.directory) as Arc<dyn PeerDirectory>,
            outbox: self.outbox_tx.clone(),
            capacity: self.config.queue_capacity,
            dial_timeout: self.config.dial_timeout(),
            reclaim_interval: self.config.reclaim_interval(),
        })
    }
}

fn to_cmd_result(result: std::result::Result<Option<CmdData>, MapperError>) -> CmdResult {
    match result {
        Ok(data) => CmdResult::ok(data),
        Err(err) => CmdResult::err(err.to_string()),
    }
}

/// A running stage.
pub struct Stage {
    inner: Arc<StageInner>,
    server: Mutex<Option<RpcServer>>,
}

impl Stage {
    /// Start a stage: bind the RPC listener, wire the registry and client
    /// pool, and spawn the outbox dispatcher.
    ///
    /// `kv` is the consensus-backed store behind the registry; passing
    /// `None` runs the stage in isolated mode. `consensus` receives
    /// incoming `ProcessRaft` batches, if present.
    pub async fn start(
        id: StageId,
        config: StageConfig,
        kv: Option<Arc<dyn KvStore>>,
        consensus: Option<Arc<dyn ConsensusStep>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .with_context(|| format!("binding rpc listener on {}", config.addr))?;
        let listen_addr = listener.local_addr().context("resolving listen address")?;

        let directory = Arc::new(StageDirectory::default());
        let pool = Arc::new(RpcClientPool::new(
            Arc::clone(&directory) as Arc<dyn PeerDirectory>,
            config.dial_timeout(),
            config.min_backoff(),
            config.max_backoff(),
        ));
        let registry = kv.map(|store| {
            Arc::new(Registry::new(
                store,
                config.registry_prefix.clone(),
                config.registry_ttl(),
                config.lock_acquire_timeout(),
            ))
        });

        let (outbox_tx, outbox_rx) = mpsc::channel(config.queue_capacity);
        let inner = Arc::new(StageInner {
            id,
            config,
            listen_addr,
            registry,
            pool,
            directory,
            consensus,
            actors: RwLock::new(HashMap::new()),
            outbox_tx,
        });

        tokio::spawn(run_outbox(Arc::downgrade(&inner), outbox_rx));

        let watchdog = inner.config.watchdog();
        let server = RpcServer::spawn(listener, Arc::clone(&inner), watchdog);

        info!(stage = %id, addr = %listen_addr, "stage started");
        Ok(Self {
            inner,
            server: Mutex::new(Some(server)),
        })
    }

    /// This stage's id.
    pub fn id(&self) -> StageId {
        self.inner.id
    }

    /// The bound RPC address.
    pub fn addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Identity and peer list, as served to `HiveState` queries.
    pub fn hive_state(&self) -> HiveState {
        self.inner.hive_state()
    }

    /// Teach this stage the address of a peer.
    pub fn add_peer(&self, stage: StageId, addr: SocketAddr) {
        self.inner.directory.add(stage, addr);
    }

    /// Register an actor and its keyed handler; spawns the actor's mapper.
    pub fn register_actor(
        &self,
        name: impl Into<ActorName>,
        handler: impl Handler,
    ) -> Result<()> {
        let name = name.into();
        let mut actors = self.inner.actors.write().expect("actor map lock poisoned");
        if actors.contains_key(&name) {
            bail!("actor {name} is already registered");
        }
        let mapper = self.inner.spawn_actor_mapper(name.clone());
        actors.insert(
            name,
            ActorEntry {
                handler: Some(Arc::new(handler)),
                mapper,
            },
        );
        Ok(())
    }

    /// Register an actor's detached handler, creating the actor's mapper if
    /// the actor has no keyed handler here. Fails if a detached handler is
    /// already installed.
    pub async fn register_detached(
        &self,
        name: impl Into<ActorName>,
        handler: impl DetachedHandler,
    ) -> Result<()> {
        let name = name.into();
        let mapper = {
            let mut actors = self.inner.actors.write().expect("actor map lock poisoned");
            match actors.get(&name) {
                Some(entry) => entry.mapper.clone(),
                None => {
                    let mapper = self.inner.spawn_actor_mapper(name.clone());
                    actors.insert(
                        name.clone(),
                        ActorEntry {
                            handler: None,
                            mapper: mapper.clone(),
                        },
                    );
                    mapper
                }
            }
        };
        mapper
            .register_detached(Box::new(handler))
            .await
            .with_context(|| format!("registering detached handler for {name}"))
    }

    /// Inject a message into the fabric at this stage.
    pub async fn emit(&self, msg: Message) -> Result<()> {
        self.inner.enque_msg(msg).await
    }

    /// The mapper handle for a registered actor.
    pub fn mapper(&self, name: impl Into<ActorName>) -> Option<MapperHandle> {
        self.inner.actor_entry(&name.into()).map(|(mapper, _)| mapper)
    }

    /// Migrate a receiver of `actor` to stage `to`; returns the new remote
    /// id.
    pub async fn migrate(
        &self,
        from: ReceiverId,
        to: StageId,
    ) -> std::result::Result<ReceiverId, MapperError> {
        let Some((mapper, _)) = self.inner.actor_entry(&from.actor) else {
            return Err(MapperError::Stopped {
                actor: from.actor.clone(),
            });
        };
        mapper.migrate(from, to).await
    }

    /// The RPC client pool of this stage.
    pub fn pool(&self) -> Arc<RpcClientPool> {
        Arc::clone(&self.inner.pool)
    }

    /// Stop the stage: mappers and their receivers first, then the client
    /// pool and the RPC server.
    pub async fn stop(&self) -> Result<()> {
        let mappers: Vec<MapperHandle> = {
            let mut actors = self.inner.actors.write().expect("actor map lock poisoned");
            actors.drain().map(|(_, entry)| entry.mapper).collect()
        };
        for mapper in mappers {
            mapper.stop().await;
        }

        self.inner.pool.stop().await;

        if let Some(server) = self.server.lock().await.take() {
            server.shutdown().await?;
        }
        info!(stage = %self.inner.id, "stage stopped");
        Ok(())
    }
}

/// Dispatch messages emitted by receivers back into the fabric. Holds only
/// a weak reference so a dropped stage winds the task down.
async fn run_outbox(inner: Weak<StageInner>, mut outbox_rx: mpsc::Receiver<Message>) {
    while let Some(msg) = outbox_rx.recv().await {
        let Some(stage) = inner.upgrade() else {
            break;
        };
        debug!(actor = %msg.actor, "dispatching emitted message");
        if let Err(err) = stage.enque_msg(msg).await {
            warn!(error = %err, "dropping emitted message");
        }
    }
}
