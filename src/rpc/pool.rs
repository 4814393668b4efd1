//! Pooled RPC clients with per-peer dial backoff.
//!
//! The pool vends clients keyed by peer stage (`stage_client`) or by remote
//! receiver (`bee_client`, resolved to its hosting stage). One
//! reader-writer lock guards the three maps; each per-peer `DialTry` record
//! carries its own mutex so dial bookkeeping for one peer never serializes
//! the others.
//!
//! Backoff: the first dial is free; each failed dial doubles the wait (up
//! to the configured maximum) and pushes the next permitted dial out by the
//! new wait. A successful dial resets the wait to one second. Calls inside
//! the window are refused with [`RpcError::Backoff`], which classifies as
//! temporary and timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::consensus::{report_delivery, Batch, Reporter};
use crate::types::{Message, ReceiverId, StageId};

use super::client::RpcClient;
use super::wire::{Cmd, CmdData};
use super::RpcError;

/// Wait assigned after a successful dial.
const WAIT_AFTER_SUCCESS: Duration = Duration::from_secs(1);

/// Resolves a stage id to its RPC address. Discovery is out of scope; the
/// stage maintains a trivial in-memory directory.
pub trait PeerDirectory: Send + Sync {
    /// Address of `stage`, if known.
    fn addr_of(&self, stage: StageId) -> Option<SocketAddr>;
}

struct DialTryState {
    next: Instant,
    wait: Duration,
    tries: u64,
}

/// Per-peer dial bookkeeping; its own mutex serializes dials to one peer.
struct DialTry {
    inner: AsyncMutex<DialTryState>,
}

#[derive(Default)]
struct PoolMaps {
    stage_clients: HashMap<StageId, Arc<RpcClient>>,
    bee_clients: HashMap<ReceiverId, Arc<RpcClient>>,
    retries: HashMap<StageId, Arc<DialTry>>,
}

/// Per-stage singleton pool of RPC clients.
pub struct RpcClientPool {
    directory: Arc<dyn PeerDirectory>,
    dial_timeout: Duration,
    min_wait: Duration,
    max_wait: Duration,
    maps: RwLock<PoolMaps>,
}

impl RpcClientPool {
    /// Create a pool resolving peers through `directory`.
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        dial_timeout: Duration,
        min_wait: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            directory,
            dial_timeout,
            min_wait,
            max_wait,
            maps: RwLock::new(PoolMaps::default()),
        }
    }

    fn lookup_stage(&self, stage: StageId) -> Option<Arc<RpcClient>> {
        self.maps
            .read()
            .expect("rpc pool lock poisoned")
            .stage_clients
            .get(&stage)
            .cloned()
    }

    fn lookup_retry(&self, stage: StageId) -> Arc<DialTry> {
        let mut maps = self.maps.write().expect("rpc pool lock poisoned");
        let min_wait = self.min_wait;
        maps.retries
            .entry(stage)
            .or_insert_with(|| {
                Arc::new(DialTry {
                    inner: AsyncMutex::new(DialTryState {
                        next: Instant::now(),
                        wait: min_wait,
                        tries: 0,
                    }),
                })
            })
            .clone()
    }

    /// Get or dial the client for `stage`.
    pub async fn stage_client(&self, stage: StageId) -> Result<Arc<RpcClient>, RpcError> {
        if let Some(client) = self.lookup_stage(stage) {
            return Ok(client);
        }
        self.reset_stage_client(stage, None).await
    }

    /// Replace the cached client for `stage`, unless another caller already
    /// replaced the instance `prev` refers to.
    pub async fn reset_stage_client(
        &self,
        stage: StageId,
        prev: Option<&Arc<RpcClient>>,
    ) -> Result<Arc<RpcClient>, RpcError> {
        if let Some(existing) = self.lookup_stage(stage) {
            match prev {
                // The cached instance is the one the caller saw fail:
                // proceed with the reset.
                Some(prev) if Arc::ptr_eq(&existing, prev) => {}
                // Someone else already swapped it, or no failing instance
                // was named: hand back the cached client.
                _ => return Ok(existing),
            }
        }

        {
            let mut maps = self.maps.write().expect("rpc pool lock poisoned");
            maps.stage_clients.remove(&stage);
            // Bee entries resolved through the dead client are stale too.
            maps.bee_clients.retain(|id, _| id.stage != stage);
        }
        self.new_client(stage).await
    }

    async fn new_client(&self, stage: StageId) -> Result<Arc<RpcClient>, RpcError> {
        let retry = self.lookup_retry(stage);
        let mut state = retry.inner.lock().await;

        // A concurrent dial may have won while we waited for the peer's
        // dial lock.
        if let Some(client) = self.lookup_stage(stage) {
            return Ok(client);
        }

        let now = Instant::now();
        if now < state.next {
            return Err(RpcError::Backoff { until: state.next });
        }

        let addr = self
            .directory
            .addr_of(stage)
            .ok_or(RpcError::UnknownPeer { stage })?;

        match RpcClient::connect(addr, self.dial_timeout).await {
            Ok(client) => {
                state.wait = WAIT_AFTER_SUCCESS;
                state.next = now;
                let client = Arc::new(client);
                self.maps
                    .write()
                    .expect("rpc pool lock poisoned")
                    .stage_clients
                    .insert(stage, Arc::clone(&client));
                debug!(%stage, %addr, "dialed peer");
                Ok(client)
            }
            Err(err) => {
                state.tries += 1;
                state.wait = (state.wait * 2).min(self.max_wait);
                state.next = now + state.wait;
                warn!(
                    %stage,
                    %addr,
                    tries = state.tries,
                    wait_ms = state.wait.as_millis() as u64,
                    error = %err,
                    "dial failed, backing off"
                );
                Err(err)
            }
        }
    }

    /// Get or dial the client for the stage hosting receiver `id`, caching
    /// the resolution per receiver.
    pub async fn bee_client(&self, id: &ReceiverId) -> Result<Arc<RpcClient>, RpcError> {
        if let Some(client) = self
            .maps
            .read()
            .expect("rpc pool lock poisoned")
            .bee_clients
            .get(id)
            .cloned()
        {
            return Ok(client);
        }

        let client = self.stage_client(id.stage).await?;
        self.maps
            .write()
            .expect("rpc pool lock poisoned")
            .bee_clients
            .insert(id.clone(), Arc::clone(&client));
        Ok(client)
    }

    async fn reset_bee_client(
        &self,
        id: &ReceiverId,
        prev: Option<&Arc<RpcClient>>,
    ) -> Result<Arc<RpcClient>, RpcError> {
        let client = self.reset_stage_client(id.stage, prev).await?;
        self.maps
            .write()
            .expect("rpc pool lock poisoned")
            .bee_clients
            .insert(id.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Send messages to their destination receivers, grouped per receiver so
    /// each group rides its peer's msg stream. Returns the last error, if
    /// any; delivery to other destinations still proceeds.
    pub async fn send_msg(&self, msgs: Vec<Message>) -> Result<(), RpcError> {
        let mut groups: HashMap<ReceiverId, Vec<Message>> = HashMap::new();
        for msg in msgs {
            let Some(to) = msg.to.clone() else {
                warn!(actor = %msg.actor, "dropping non-unicast message at the rpc pool");
                continue;
            };
            groups.entry(to).or_default().push(msg);
        }

        let mut last_err = None;
        for (to, group) in groups {
            let client = match self.bee_client(&to).await {
                Ok(client) => client,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            if let Err(err) = client.send_msg(group).await {
                if err.should_reset() {
                    let _ = self.reset_bee_client(&to, Some(&client)).await;
                }
                last_err = Some(err);
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Execute a command on stage `to`.
    pub async fn send_cmd(&self, to: StageId, cmd: Cmd) -> Result<Option<CmdData>, RpcError> {
        let client = self.stage_client(to).await?;
        match client.send_cmd(cmd).await {
            Ok(data) => Ok(data),
            Err(err) => {
                if err.should_reset() {
                    let _ = self.reset_stage_client(to, Some(&client)).await;
                }
                Err(err)
            }
        }
    }

    /// Send a consensus batch to its destination stage.
    ///
    /// Reporter callbacks fire on every outcome, including a send skipped
    /// because the client could not be obtained (backoff, unknown peer).
    pub async fn send_raft(&self, batch: Batch, reporter: &dyn Reporter) -> Result<(), RpcError> {
        let client = match self.stage_client(batch.to).await {
            Ok(client) => client,
            Err(err) => {
                report_delivery(false, &batch, reporter);
                return Err(err);
            }
        };

        let result = client.send_raft(&batch, reporter).await;
        if let Err(err) = &result {
            if err.should_reset() {
                let _ = self.reset_stage_client(batch.to, Some(&client)).await;
            }
        }
        result
    }

    /// Close every pooled client.
    pub async fn stop(&self) {
        let clients: Vec<Arc<RpcClient>> = {
            let mut maps = self.maps.write().expect("rpc pool lock poisoned");
            maps.bee_clients.clear();
            maps.stage_clients.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDirectory(HashMap<StageId, SocketAddr>);

    impl PeerDirectory for StaticDirectory {
        fn addr_of(&self, stage: StageId) -> Option<SocketAddr> {
            self.0.get(&stage).copied()
        }
    }

    fn pool_with(directory: HashMap<StageId, SocketAddr>) -> RpcClientPool {
        RpcClientPool::new(
            Arc::new(StaticDirectory(directory)),
            Duration::from_millis(500),
            Duration::from_millis(50),
            Duration::from_secs(8),
        )
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let pool = pool_with(HashMap::new());
        let err = pool.stage_client(StageId(9)).await.unwrap_err();
        assert!(matches!(err, RpcError::UnknownPeer { .. }));
    }

    #[tokio::test]
    async fn failed_dial_opens_backoff_window() {
        // A bound-then-dropped listener yields a connection-refused port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool_with(HashMap::from([(StageId(2), addr)]));

        let err = pool.stage_client(StageId(2)).await.unwrap_err();
        assert!(matches!(err, RpcError::Dial { .. }));

        // Immediately after the failure we are inside the window.
        let err = pool.stage_client(StageId(2)).await.unwrap_err();
        assert!(matches!(err, RpcError::Backoff { .. }));
        assert!(err.is_temporary());
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn successful_dial_resets_backoff() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _socket = socket;
                    std::future::pending::<()>().await
                });
            }
        });

        let pool = pool_with(HashMap::from([(StageId(2), addr)]));
        pool.stage_client(StageId(2)).await.unwrap();

        let retry = pool.lookup_retry(StageId(2));
        let state = retry.inner.lock().await;
        assert_eq!(state.wait, WAIT_AFTER_SUCCESS);
        assert_eq!(state.tries, 0);
    }

    #[tokio::test]
    async fn backoff_doubles_per_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool_with(HashMap::from([(StageId(2), addr)]));

        // First failure: wait doubles from 50ms to 100ms.
        pool.stage_client(StageId(2)).await.unwrap_err();
        {
            let retry = pool.lookup_retry(StageId(2));
            let state = retry.inner.lock().await;
            assert_eq!(state.tries, 1);
            assert_eq!(state.wait, Duration::from_millis(100));
        }

        // Ride past the window and fail again: 200ms.
        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.stage_client(StageId(2)).await.unwrap_err();
        {
            let retry = pool.lookup_retry(StageId(2));
            let state = retry.inner.lock().await;
            assert_eq!(state.tries, 2);
            assert_eq!(state.wait, Duration::from_millis(200));
        }
    }
}
