//! Object stores for sealed, sharded aggregations.
//!
//! An object is addressed by the digest of its sealed payload and stored
//! as `coding.total()` shards, each on a distinct backend server (modulo
//! the cluster size). [MemStore] keeps everything in process for tests.

use crate::{Digest, Error};
use bytes::Bytes;
use commonware_runtime::{Metrics, Network, Spawner};
use commonware_utils::hex;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use vdisk_ardb::{resp::Command, Controller};

/// Durable storage for erasure-coded aggregation objects.
pub trait ObjectStore: Clone + Send + Sync + 'static {
    /// Persists every shard of `object`. Returns only once all shards are
    /// acknowledged.
    fn put(
        &self,
        object: Digest,
        shards: Vec<Bytes>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Fetches the shards of `object`, `None` for each shard that is
    /// missing or unreachable.
    fn get(
        &self,
        object: Digest,
        total: usize,
    ) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>, Error>> + Send;
}

/// An in-memory object store.
#[derive(Clone, Default)]
pub struct MemStore {
    objects: Arc<Mutex<HashMap<Digest, Vec<Bytes>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the raw shards of an object (tests reassemble them).
    pub fn shards(&self, object: &Digest) -> Option<Vec<Bytes>> {
        self.objects.lock().unwrap().get(object).cloned()
    }

    /// Drops one shard of an object, simulating a lost backend.
    pub fn corrupt(&self, object: &Digest, shard: usize) {
        if let Some(shards) = self.objects.lock().unwrap().get_mut(object) {
            shards[shard] = Bytes::new();
        }
    }
}

impl ObjectStore for MemStore {
    async fn put(&self, object: Digest, shards: Vec<Bytes>) -> Result<(), Error> {
        self.objects.lock().unwrap().insert(object, shards);
        Ok(())
    }

    async fn get(&self, object: Digest, total: usize) -> Result<Vec<Option<Vec<u8>>>, Error> {
        let objects = self.objects.lock().unwrap();
        let Some(shards) = objects.get(&object) else {
            return Ok(vec![None; total]);
        };
        Ok(shards
            .iter()
            .map(|shard| (!shard.is_empty()).then(|| shard.to_vec()))
            .collect())
    }
}

/// An object store over an ardb tlog cluster.
///
/// Shard `i` lives on server `i % n` under the hash key `tlog:<digest>`,
/// field `i`. With `n >= coding.total()` every shard sits on a distinct
/// server, which is what makes the parity worth its storage.
#[derive(Clone)]
pub struct ArdbStore<E: Spawner + Network + Metrics> {
    cluster: Arc<Controller<E>>,
}

impl<E: Spawner + Network + Metrics> ArdbStore<E> {
    pub fn new(cluster: Arc<Controller<E>>) -> Self {
        Self { cluster }
    }

    fn key(object: &Digest) -> String {
        format!("tlog:{}", hex(object.as_ref()))
    }
}

impl<E: Spawner + Network + Metrics> ObjectStore for ArdbStore<E> {
    async fn put(&self, object: Digest, shards: Vec<Bytes>) -> Result<(), Error> {
        let key = Self::key(&object);
        // Group shard writes per server, one pipeline each.
        let mut batches: HashMap<usize, (vdisk_ardb::Server<E>, Vec<Command>)> = HashMap::new();
        for (index, shard) in shards.into_iter().enumerate() {
            let server = self.cluster.server_for(index as u64).await;
            batches
                .entry(server.index())
                .or_insert_with(|| (server, Vec::new()))
                .1
                .push(
                    Command::new("HSET")
                        .arg(key.clone())
                        .arg_int(index as u64)
                        .arg(shard),
                );
        }
        for (_, (server, commands)) in batches {
            for reply in server.write_pipeline(&commands).await? {
                reply.into_ok()?;
            }
        }
        Ok(())
    }

    async fn get(&self, object: Digest, total: usize) -> Result<Vec<Option<Vec<u8>>>, Error> {
        let key = Self::key(&object);
        let mut shards = Vec::with_capacity(total);
        for index in 0..total {
            let server = self.cluster.server_for(index as u64).await;
            let command = Command::new("HGET").arg(key.clone()).arg_int(index as u64);
            let shard = match server.read(command).await {
                Ok(reply) => reply.into_bytes()?.map(|bytes| bytes.to_vec()),
                // An unreachable shard is simply absent; parity covers it.
                Err(vdisk_ardb::Error::ServerRetired)
                | Err(vdisk_ardb::Error::ServerUnavailable) => None,
                Err(err) => return Err(err.into()),
            };
            shards.push(shard);
        }
        Ok(shards)
    }
}
