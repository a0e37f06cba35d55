//! The cluster controller.
//!
//! A controller owns the ordered server list of one cluster on behalf of
//! one vdisk. It resolves block indices to servers with a fixed modulo
//! mapping (`servers[index % n]`), tracks per-server liveness, and follows
//! configuration changes emitted by the config source.
//!
//! # Reconfiguration
//!
//! A single reconciler task consumes snapshots from the config source and
//! applies them under the writer half of the server-list lock. Snapshots
//! that would change the cluster length are rejected: the mapping never
//! rebalances, so the server count is fixed for the lifetime of the vdisk.
//!
//! # Hot swap
//!
//! Replacing the address of an online server is a three-step dance: close
//! the server's write gate (waiting out in-flight writes), copy the vdisk's
//! keys from the old server to the new one, then flip the handle. Writers
//! pass through the gate on every call, so no write can land on the old
//! address once the swap returns.

use crate::{
    pool::{Pool, Pools},
    resp::{Command, Reply},
    Error,
};
use commonware_runtime::{Handle, Metrics, Network, RwLock, Spawner};
use futures::{channel::mpsc, StreamExt};
use prometheus_client::metrics::counter::Counter;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, warn};
use vdisk_config::{Key, ServerState, Source, StorageClusterConfig, StorageServerConfig};

/// Consecutive transient failures before a server is marked offline.
const OFFLINE_THRESHOLD: u32 = 3;

/// The kind of backend failure reported in a [StatusEvent].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Timeout,
    TempError,
    Disconnect,
    UnknownError,
}

/// A backend health observation, broadcast to whoever subscribes via
/// [Controller::events].
#[derive(Clone, Debug)]
pub struct StatusEvent {
    pub address: SocketAddr,
    pub kind: StatusKind,
}

struct Slot<E: Network + Metrics> {
    config: StorageServerConfig,
    pool: Arc<Pool<E>>,
}

struct Shared<E: Network + Metrics> {
    index: usize,
    /// Writers hold the read half per call; a hot swap holds the write
    /// half for the whole copy window.
    gate: RwLock<()>,
    slot: Mutex<Slot<E>>,
    failures: AtomicU32,
    events: mpsc::UnboundedSender<StatusEvent>,
}

/// A handle to one server of a cluster.
///
/// Handles are cheap clones of shared state: a handle obtained before a hot
/// swap observes the new address after it, never the old one.
pub struct Server<E: Network + Metrics> {
    shared: Arc<Shared<E>>,
}

impl<E: Network + Metrics> Clone for Server<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Network + Metrics> Server<E> {
    fn new(
        index: usize,
        config: StorageServerConfig,
        pools: &Pools<E>,
        events: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        let pool = pools.get(&config);
        Self {
            shared: Arc::new(Shared {
                index,
                gate: RwLock::new(()),
                slot: Mutex::new(Slot { config, pool }),
                failures: AtomicU32::new(0),
                events,
            }),
        }
    }

    /// The position of this server in the cluster list.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// The current liveness state.
    pub fn state(&self) -> ServerState {
        self.shared.slot.lock().unwrap().config.state
    }

    /// The current address.
    pub fn address(&self) -> SocketAddr {
        self.shared.slot.lock().unwrap().config.address
    }

    fn snapshot(&self) -> (Arc<Pool<E>>, StorageServerConfig) {
        let slot = self.shared.slot.lock().unwrap();
        (slot.pool.clone(), slot.config)
    }

    /// Sends a read command.
    ///
    /// Offline servers fail fast with [Error::ServerUnavailable] (the
    /// caller may fall back to a template); retired servers fail with
    /// [Error::ServerRetired] (the caller treats the data as gone).
    pub async fn read(&self, command: Command) -> Result<Reply, Error> {
        let (pool, config) = self.snapshot();
        match config.state {
            ServerState::Online | ServerState::Respread => {}
            ServerState::Offline => return Err(Error::ServerUnavailable),
            ServerState::Rip => return Err(Error::ServerRetired),
        }
        let reply = self.observe(config.address, pool.call(command).await)?;
        self.note_reply(config.address, &reply);
        Ok(reply)
    }

    /// Sends a write command, passing through the write gate.
    ///
    /// Writes require an online server: any other state fails with
    /// [Error::ServerUnavailable].
    pub async fn write(&self, command: Command) -> Result<Reply, Error> {
        let _pass = self.shared.gate.read().await;
        // Snapshot under the gate: a swap completed while we were waiting
        // must redirect this write to the new server.
        let (pool, config) = self.snapshot();
        match config.state {
            ServerState::Online | ServerState::Respread => {}
            ServerState::Offline | ServerState::Rip => return Err(Error::ServerUnavailable),
        }
        let reply = self.observe(config.address, pool.call(command).await)?;
        self.note_reply(config.address, &reply);
        Ok(reply)
    }

    /// Checks the server is reachable, feeding the same health tracking
    /// as regular traffic.
    pub async fn probe(&self) -> Result<(), Error> {
        let (pool, config) = self.snapshot();
        self.observe(config.address, pool.probe().await)
    }

    /// Sends a batch of write commands in one pipelined write.
    pub async fn write_pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, Error> {
        let _pass = self.shared.gate.read().await;
        let (pool, config) = self.snapshot();
        match config.state {
            ServerState::Online | ServerState::Respread => {}
            ServerState::Offline | ServerState::Rip => return Err(Error::ServerUnavailable),
        }
        self.observe(config.address, pool.pipeline(commands).await)
    }

    /// Tracks consecutive transient failures, broadcasting health events
    /// and flipping the server offline past the threshold.
    fn observe<T>(&self, address: SocketAddr, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Ok(value) => {
                self.shared.failures.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Err(Error::Runtime(err)) => {
                let kind = match err {
                    commonware_runtime::Error::Timeout => StatusKind::Timeout,
                    commonware_runtime::Error::ConnectionFailed => StatusKind::Disconnect,
                    commonware_runtime::Error::Closed => StatusKind::Disconnect,
                    _ => StatusKind::UnknownError,
                };
                let _ = self
                    .shared
                    .events
                    .unbounded_send(StatusEvent { address, kind });
                let failures = self.shared.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= OFFLINE_THRESHOLD {
                    let mut slot = self.shared.slot.lock().unwrap();
                    if slot.config.state == ServerState::Online {
                        warn!(%address, failures, "marking server offline");
                        slot.config.state = ServerState::Offline;
                    }
                }
                Err(Error::ServerUnavailable)
            }
            Err(err) => Err(err),
        }
    }

    /// Reports error replies (the server answered, but refused the
    /// command) as temporary trouble.
    fn note_reply(&self, address: SocketAddr, reply: &Reply) {
        if let Reply::Error(message) = reply {
            debug!(%address, message, "server rejected command");
            let _ = self.shared.events.unbounded_send(StatusEvent {
                address,
                kind: StatusKind::TempError,
            });
        }
    }

    /// Applies a config snapshot to this server. Returns a pending hot swap
    /// when the address of an online server changed.
    fn reconcile(&self, new: StorageServerConfig, pools: &Pools<E>) -> Option<StorageServerConfig> {
        let mut slot = self.shared.slot.lock().unwrap();
        let old = slot.config;
        if (old.address, old.database) != (new.address, new.database)
            && old.state == ServerState::Online
            && new.state == ServerState::Online
        {
            // Data must move before the handle flips; deferred to the
            // reconciler so the list lock is not held across the copy.
            return Some(new);
        }
        if old.state != new.state {
            info!(
                index = self.shared.index,
                old = ?old.state,
                new = ?new.state,
                "server state changed"
            );
            self.shared.failures.store(0, Ordering::Relaxed);
        }
        if (old.address, old.database) != (new.address, new.database) {
            // Not a live swap (one side is not online): no data to move.
            slot.pool = pools.get(&new);
        }
        slot.config = new;
        None
    }

    /// Copies this vdisk's keys from the current server to `new`, then
    /// flips the handle. Writers are held at the gate for the duration.
    async fn hot_swap(
        &self,
        vdisk: &str,
        new: StorageServerConfig,
        pools: &Pools<E>,
        swaps: &Counter,
    ) -> Result<(), Error> {
        let _closed = self.shared.gate.write().await;
        let (old_pool, old_config) = self.snapshot();
        let new_pool = pools.get(&new);

        // Copy every key belonging to this vdisk. Content-addressed data is
        // shared between vdisks and repopulates from the template instead.
        let keys = old_pool
            .call(Command::new("KEYS").arg(format!("{vdisk}*")))
            .await?
            .into_array()?;
        for key in keys {
            let Reply::Bulk(Some(key)) = key else {
                return Err(Error::UnexpectedReply);
            };
            let fields = old_pool
                .call(Command::new("HGETALL").arg(key.clone()))
                .await?
                .into_array()?;
            let mut batch = Vec::with_capacity(fields.len() / 2);
            let mut fields = fields.into_iter();
            while let (Some(field), Some(value)) = (fields.next(), fields.next()) {
                let (Reply::Bulk(Some(field)), Reply::Bulk(Some(value))) = (field, value) else {
                    return Err(Error::UnexpectedReply);
                };
                batch.push(Command::new("HSET").arg(key.clone()).arg(field).arg(value));
            }
            if !batch.is_empty() {
                new_pool.pipeline(&batch).await?;
            }
        }

        let mut slot = self.shared.slot.lock().unwrap();
        slot.config = new;
        slot.pool = new_pool;
        self.shared.failures.store(0, Ordering::Relaxed);
        swaps.inc();
        info!(
            index = self.shared.index,
            old = %old_config.address,
            new = %new.address,
            "hot-swapped server"
        );
        Ok(())
    }
}

/// Maps block indices of one vdisk to the servers of one cluster.
pub struct Controller<E: Spawner + Network + Metrics> {
    vdisk: String,
    servers: Arc<RwLock<Vec<Server<E>>>>,
    reconciler: Handle<()>,
    events: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
}

impl<E: Spawner + Network + Metrics> Controller<E> {
    /// Builds the controller for the primary cluster of `vdisk`.
    pub async fn primary<S: Source>(
        context: E,
        pools: Pools<E>,
        source: S,
        vdisk: &str,
    ) -> Result<Self, Error> {
        let nbd = vdisk_config::source::read_vdisk_nbd(&source, vdisk)?;
        Self::init(
            context.with_label("primary"),
            pools,
            source,
            vdisk,
            Key::ClusterStorage(nbd.storage_cluster_id),
        )
        .await
    }

    /// Builds the controller for the template cluster of `vdisk`, if one is
    /// configured.
    pub async fn template<S: Source>(
        context: E,
        pools: Pools<E>,
        source: S,
        vdisk: &str,
    ) -> Result<Option<Self>, Error> {
        let nbd = vdisk_config::source::read_vdisk_nbd(&source, vdisk)?;
        let Some(cluster) = nbd.template_cluster_id else {
            return Ok(None);
        };
        Ok(Some(
            Self::init(
                context.with_label("template"),
                pools,
                source,
                vdisk,
                Key::ClusterStorage(cluster),
            )
            .await?,
        ))
    }

    /// Builds the controller for the tlog storage cluster of `vdisk`.
    pub async fn tlog<S: Source>(
        context: E,
        pools: Pools<E>,
        source: S,
        vdisk: &str,
    ) -> Result<Self, Error> {
        let tlog = vdisk_config::source::read_vdisk_tlog(&source, vdisk)?;
        Self::init(
            context.with_label("tlog"),
            pools,
            source,
            vdisk,
            Key::ClusterTlog(tlog.storage_cluster_id),
        )
        .await
    }

    /// Builds a controller from an explicit cluster key and starts its
    /// reconciler.
    pub async fn init<S: Source>(
        context: E,
        pools: Pools<E>,
        source: S,
        vdisk: &str,
        key: Key,
    ) -> Result<Self, Error> {
        let config = read_cluster(&source, &key)?;

        let updates = Counter::default();
        context.register(
            "cluster_updates",
            "number of cluster config snapshots applied",
            updates.clone(),
        );
        let rejected = Counter::default();
        context.register(
            "cluster_updates_rejected",
            "number of cluster config snapshots rejected",
            rejected.clone(),
        );
        let swaps = Counter::default();
        context.register(
            "cluster_swaps",
            "number of hot server swaps performed",
            swaps.clone(),
        );

        let (events_tx, events_rx) = mpsc::unbounded();
        let servers: Vec<Server<E>> = config
            .servers
            .into_iter()
            .enumerate()
            .map(|(index, server)| Server::new(index, server, &pools, events_tx.clone()))
            .collect();
        let servers = Arc::new(RwLock::new(servers));

        let watch = source.watch(&key);
        let reconciler = context.with_label("reconciler").spawn({
            let servers = servers.clone();
            let vdisk = vdisk.to_string();
            move |_| {
                Self::reconcile(
                    servers, pools, watch, vdisk, updates, rejected, swaps,
                )
            }
        });

        Ok(Self {
            vdisk: vdisk.to_string(),
            servers,
            reconciler,
            events: Mutex::new(Some(events_rx)),
        })
    }

    async fn reconcile(
        servers: Arc<RwLock<Vec<Server<E>>>>,
        pools: Pools<E>,
        mut watch: mpsc::UnboundedReceiver<bytes::Bytes>,
        vdisk: String,
        updates: Counter,
        rejected: Counter,
        swaps: Counter,
    ) {
        while let Some(raw) = watch.next().await {
            let config = match vdisk_config::source::parse_storage_cluster(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!(?err, "ignoring invalid cluster snapshot");
                    rejected.inc();
                    continue;
                }
            };

            // Apply per-server updates under the list lock; collect swaps
            // to run after it is released (the copy can be slow).
            let mut pending = Vec::new();
            {
                let guard = servers.write().await;
                if config.servers.len() != guard.len() {
                    warn!(
                        current = guard.len(),
                        proposed = config.servers.len(),
                        "rejecting cluster snapshot: size must not change"
                    );
                    rejected.inc();
                    continue;
                }
                for (server, new) in guard.iter().zip(config.servers.iter()) {
                    if let Some(swap) = server.reconcile(*new, &pools) {
                        pending.push((server.clone(), swap));
                    }
                }
            }
            for (server, new) in pending {
                if let Err(err) = server.hot_swap(&vdisk, new, &pools, &swaps).await {
                    warn!(index = server.index(), ?err, "hot swap failed");
                }
            }
            updates.inc();
            debug!("applied cluster snapshot");
        }
    }

    /// Returns the canonical server for a block index.
    pub async fn server_for(&self, index: u64) -> Server<E> {
        let servers = self.servers.read().await;
        servers[(index % servers.len() as u64) as usize].clone()
    }

    /// Returns the server at a cluster position.
    pub async fn server_at(&self, index: usize) -> Result<Server<E>, Error> {
        let servers = self.servers.read().await;
        servers
            .get(index)
            .cloned()
            .ok_or(Error::InvalidServerIndex(index))
    }

    /// Returns the state of the server at a cluster position.
    pub async fn server_state_at(&self, index: usize) -> Result<ServerState, Error> {
        Ok(self.server_at(index).await?.state())
    }

    /// Returns a snapshot of every server handle, in cluster order.
    pub async fn servers(&self) -> Vec<Server<E>> {
        self.servers.read().await.clone()
    }

    /// The number of servers in the cluster.
    pub async fn server_count(&self) -> usize {
        self.servers.read().await.len()
    }

    /// The vdisk this controller resolves for.
    pub fn vdisk(&self) -> &str {
        &self.vdisk
    }

    /// Takes the health-event stream. Yields `None` on the second call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<StatusEvent>> {
        self.events.lock().unwrap().take()
    }

    /// Stops watching configuration. Outstanding server handles remain
    /// usable but frozen at their current configuration.
    pub fn close(&self) {
        self.reconciler.abort();
    }
}

fn read_cluster<S: Source>(source: &S, key: &Key) -> Result<StorageClusterConfig, Error> {
    let raw = source.get(key)?;
    Ok(vdisk_config::source::parse_storage_cluster(&raw)?)
}
