//! Pooled connections to ardb servers.
//!
//! Every `(address, database)` pair gets its own bounded pool of idle
//! connections. Pools are process-wide: they are handed out by [Pools] as
//! refcounted handles, and dropping the last handle to a pool drains its
//! connections.

use crate::{
    connection::Connection,
    resp::{Command, Reply},
    Error,
};
use commonware_runtime::{Metrics, Network, SinkOf, StreamOf};
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};
use tracing::debug;
use vdisk_config::StorageServerConfig;

/// Idle connections kept per server.
const DEFAULT_CAPACITY: usize = 4;

/// Dial-and-call attempts before a transient error is surfaced.
const ATTEMPTS: usize = 2;

/// A bounded pool of connections to one `(address, database)`.
///
/// A transport error fails only the in-flight operation: the broken
/// connection is dropped on the floor and the next call dials a fresh one.
pub struct Pool<E: Network + Metrics> {
    context: E,
    address: SocketAddr,
    database: u16,
    capacity: usize,
    idle: Mutex<Vec<Connection<SinkOf<E>, StreamOf<E>>>>,

    connections_created: Counter,
    commands: Counter,
    command_failures: Counter,
}

impl<E: Network + Metrics> Pool<E> {
    fn new(context: E, config: &StorageServerConfig, metrics: &PoolMetrics) -> Self {
        Self {
            context,
            address: config.address,
            database: config.database,
            capacity: DEFAULT_CAPACITY,
            idle: Mutex::new(Vec::new()),

            connections_created: metrics.connections_created.clone(),
            commands: metrics.commands.clone(),
            command_failures: metrics.command_failures.clone(),
        }
    }

    /// The address this pool dials.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The database index this pool selects on connect.
    pub fn database(&self) -> u16 {
        self.database
    }

    /// Sends one command, retrying transient transport errors within a
    /// small budget.
    pub async fn call(&self, command: Command) -> Result<Reply, Error> {
        self.commands.inc();
        let mut last = None;
        for _ in 0..ATTEMPTS {
            let mut connection = match self.acquire().await {
                Ok(connection) => connection,
                Err(err) => {
                    debug!(address = %self.address, ?err, "dial failed");
                    last = Some(err);
                    continue;
                }
            };
            match connection.call(command.clone()).await {
                Ok(reply) => {
                    self.release(connection);
                    return Ok(reply);
                }
                Err(err @ Error::Runtime(_)) => {
                    // The connection is poisoned; drop it and retry.
                    debug!(address = %self.address, ?err, "command failed");
                    last = Some(err);
                }
                Err(err) => {
                    self.command_failures.inc();
                    self.release(connection);
                    return Err(err);
                }
            }
        }
        self.command_failures.inc();
        Err(last.expect("at least one attempt was made"))
    }

    /// Sends a batch of commands in one write, retrying like [Pool::call].
    /// Replies are returned in command order.
    pub async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, Error> {
        self.commands.inc();
        let mut last = None;
        for _ in 0..ATTEMPTS {
            let mut connection = match self.acquire().await {
                Ok(connection) => connection,
                Err(err) => {
                    last = Some(err);
                    continue;
                }
            };
            match connection.pipeline(commands).await {
                Ok(replies) => {
                    self.release(connection);
                    return Ok(replies);
                }
                Err(err @ Error::Runtime(_)) => {
                    debug!(address = %self.address, ?err, "pipeline failed");
                    last = Some(err);
                }
                Err(err) => {
                    self.command_failures.inc();
                    self.release(connection);
                    return Err(err);
                }
            }
        }
        self.command_failures.inc();
        Err(last.expect("at least one attempt was made"))
    }

    /// Checks the server is reachable and responding.
    pub async fn probe(&self) -> Result<(), Error> {
        let mut connection = self.acquire().await?;
        connection.probe().await?;
        self.release(connection);
        Ok(())
    }

    async fn acquire(&self) -> Result<Connection<SinkOf<E>, StreamOf<E>>, Error> {
        if let Some(connection) = self.idle.lock().unwrap().pop() {
            return Ok(connection);
        }
        self.connections_created.inc();
        let (sink, stream) = self.context.dial(self.address).await?;
        Connection::init(sink, stream, self.database).await
    }

    fn release(&self, connection: Connection<SinkOf<E>, StreamOf<E>>) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.capacity {
            idle.push(connection);
        }
    }
}

#[derive(Clone)]
struct PoolMetrics {
    connections_created: Counter,
    commands: Counter,
    command_failures: Counter,
}

impl PoolMetrics {
    fn register<E: Metrics>(context: &E) -> Self {
        let metrics = Self {
            connections_created: Counter::default(),
            commands: Counter::default(),
            command_failures: Counter::default(),
        };
        context.register(
            "connections_created",
            "number of backend connections dialed",
            metrics.connections_created.clone(),
        );
        context.register(
            "commands",
            "number of backend commands issued",
            metrics.commands.clone(),
        );
        context.register(
            "command_failures",
            "number of backend commands that failed after retries",
            metrics.command_failures.clone(),
        );
        metrics
    }
}

/// The process-wide pool registry, keyed by `(address, database)`.
///
/// Handles to the same server share one pool; the pool (and its idle
/// connections) disappears when the last handle is dropped.
#[derive(Clone)]
pub struct Pools<E: Network + Metrics> {
    context: E,
    metrics: PoolMetrics,
    inner: Arc<Mutex<HashMap<(SocketAddr, u16), Weak<Pool<E>>>>>,
}

impl<E: Network + Metrics> Pools<E> {
    pub fn new(context: E) -> Self {
        let metrics = PoolMetrics::register(&context);
        Self {
            context,
            metrics,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the shared pool for `config`, creating it if no live handle
    /// exists.
    pub fn get(&self, config: &StorageServerConfig) -> Arc<Pool<E>> {
        let key = (config.address, config.database);
        let mut inner = self.inner.lock().unwrap();
        if let Some(pool) = inner.get(&key).and_then(Weak::upgrade) {
            return pool;
        }
        let pool = Arc::new(Pool::new(self.context.clone(), config, &self.metrics));
        inner.insert(key, Arc::downgrade(&pool));
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryArdb;
    use bytes::Bytes;
    use commonware_runtime::{deterministic, Runner};
    use vdisk_config::StorageServerConfig;

    #[test]
    fn test_call_roundtrip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let address: SocketAddr = "127.0.0.1:16379".parse().unwrap();
            let backend = MemoryArdb::default();
            backend.clone().serve(context.clone(), address);

            let pools = Pools::new(context.clone());
            let pool = pools.get(&StorageServerConfig::new(address));

            pool.call(Command::new("HSET").arg("disk1").arg_int(0).arg("block"))
                .await
                .unwrap();
            let reply = pool
                .call(Command::new("HGET").arg("disk1").arg_int(0))
                .await
                .unwrap();
            assert_eq!(reply.into_bytes().unwrap(), Some(Bytes::from_static(b"block")));
        });
    }

    #[test]
    fn test_pools_share_and_drain() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let address: SocketAddr = "127.0.0.1:16379".parse().unwrap();
            let backend = MemoryArdb::default();
            backend.clone().serve(context.clone(), address);

            let pools = Pools::new(context.clone());
            let config = StorageServerConfig::new(address);
            let first = pools.get(&config);
            let second = pools.get(&config);
            assert!(Arc::ptr_eq(&first, &second));

            // Dropping every handle drains the registry entry; the next get
            // dials fresh.
            drop(first);
            drop(second);
            let third = pools.get(&config);
            third.probe().await.unwrap();
        });
    }

    #[test]
    fn test_call_fails_without_server() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let address: SocketAddr = "127.0.0.1:16399".parse().unwrap();
            let pools = Pools::new(context.clone());
            let pool = pools.get(&StorageServerConfig::new(address));
            let err = pool.call(Command::new("PING")).await.unwrap_err();
            assert!(matches!(err, Error::Runtime(_)));
        });
    }

    #[test]
    fn test_database_isolation() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let address: SocketAddr = "127.0.0.1:16379".parse().unwrap();
            let backend = MemoryArdb::default();
            backend.clone().serve(context.clone(), address);

            let pools = Pools::new(context.clone());
            let mut zero = StorageServerConfig::new(address);
            zero.database = 0;
            let mut three = StorageServerConfig::new(address);
            three.database = 3;

            let pool_zero = pools.get(&zero);
            let pool_three = pools.get(&three);

            pool_zero
                .call(Command::new("HSET").arg("disk1").arg_int(0).arg("zero"))
                .await
                .unwrap();
            let reply = pool_three
                .call(Command::new("HGET").arg("disk1").arg_int(0))
                .await
                .unwrap();
            assert_eq!(reply.into_bytes().unwrap(), None);
        });
    }
}
