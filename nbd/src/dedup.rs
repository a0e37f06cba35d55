//! The deduped engine.
//!
//! Block content is stored once per unique hash in a content-addressed
//! store shared across vdisks; the per-vdisk LBA index maps block indices
//! to those hashes. Content is sharded by the low bits of its hash (so
//! identical blocks collapse no matter which vdisk wrote them), while the
//! LBA index is sharded by block index.

use crate::{
    cache::WriteCache, content_get, content_put, content_shard, hash_block, is_zero,
    lba::LbaIndex, BlockHash, Cluster, Error,
};
use bytes::Bytes;
use commonware_runtime::{Clock, Metrics, Network, Spawner};
use tracing::debug;

pub struct Deduped<E: Spawner + Clock + Network + Metrics> {
    vdisk: String,
    block_size: u64,
    cluster: Cluster<E>,
    template: Option<Cluster<E>>,
    lba: LbaIndex<E>,
    cache: WriteCache<E>,
}

impl<E: Spawner + Clock + Network + Metrics> Deduped<E> {
    pub fn init(
        context: E,
        vdisk: &str,
        block_size: u64,
        cluster: Cluster<E>,
        template: Option<Cluster<E>>,
    ) -> Self {
        let cache = WriteCache::init(context.with_label("cache"), None);
        let lba = LbaIndex::new(vdisk, cluster.clone());
        Self {
            vdisk: vdisk.to_string(),
            block_size,
            cluster,
            template,
            lba,
            cache,
        }
    }

    /// Returns the block at `index`, or an empty buffer if it was never
    /// written.
    pub async fn get_block(&mut self, index: u64) -> Result<Bytes, Error> {
        let Some(hash) = self.lba.get(index).await? else {
            return Ok(Bytes::new());
        };
        if let Some(data) = self.cache.get(&hash) {
            return Ok(data);
        }

        let server = self.cluster.server_for(content_shard(&hash)).await;
        match server.read(content_get(&hash)).await {
            Ok(reply) => match reply.into_bytes()? {
                Some(data) => Ok(data),
                // Mapped but absent locally: first read since the fork.
                None => self.fetch_template(hash, true).await,
            },
            // The shard holding this content is permanently gone.
            Err(vdisk_ardb::Error::ServerRetired) => Ok(Bytes::new()),
            // The shard is down; the template may still serve the read,
            // but nothing can be written through right now.
            Err(vdisk_ardb::Error::ServerUnavailable) if self.template.is_some() => {
                self.fetch_template(hash, false).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stores the block at `index`. Empty or all-zero data is a delete.
    pub async fn set_block(&mut self, index: u64, data: Bytes) -> Result<(), Error> {
        if data.is_empty() || is_zero(&data) {
            return self.delete_block(index).await;
        }
        if data.len() as u64 > self.block_size {
            return Err(Error::InvalidBlockSize {
                expected: self.block_size,
                got: data.len(),
            });
        }

        let hash = hash_block(&data);
        // A cached hash means this exact content reached the backend within
        // the cache window; the write collapses to an LBA update.
        if self.cache.get(&hash).is_none() {
            let server = self.cluster.server_for(content_shard(&hash)).await;
            server.write(content_put(&hash, data.clone())).await?.into_ok()?;
            self.cache.set(hash, data);
        }
        self.lba.set(index, hash).await
    }

    /// Unmaps the block at `index`. The content itself stays: it may be
    /// shared with other indices or other vdisks.
    pub async fn delete_block(&mut self, index: u64) -> Result<(), Error> {
        self.lba.delete(index).await
    }

    /// Persists the LBA index and drops the write cache.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.cache.flush();
        self.lba.flush().await
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        let result = self.flush().await;
        self.cache.close();
        self.cluster.close();
        if let Some(template) = &self.template {
            template.close();
        }
        result
    }

    /// Reads content from the template cluster and, when the primary shard
    /// is healthy, writes it through so the template is never consulted for
    /// this content again.
    async fn fetch_template(
        &mut self,
        hash: BlockHash,
        write_through: bool,
    ) -> Result<Bytes, Error> {
        let Some(template) = &self.template else {
            return Ok(Bytes::new());
        };
        let server = template.server_for(content_shard(&hash)).await;
        let data = match server.read(content_get(&hash)).await {
            Ok(reply) => reply.into_bytes()?,
            Err(vdisk_ardb::Error::ServerRetired) => None,
            Err(err) => return Err(err.into()),
        };
        let Some(data) = data else {
            return Ok(Bytes::new());
        };

        if write_through {
            debug!(vdisk = %self.vdisk, "copying template block to primary");
            let primary = self.cluster.server_for(content_shard(&hash)).await;
            primary.write(content_put(&hash, data.clone())).await?.into_ok()?;
            self.cache.set(hash, data.clone());
        }
        Ok(data)
    }
}
