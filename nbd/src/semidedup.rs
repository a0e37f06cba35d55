//! The semi-deduped engine.
//!
//! Two layers: a read-only deduped template layer (the vdisk's LBA index
//! resolved against the template cluster's content store) and a non-deduped
//! overlay on the primary cluster for local writes. A per-vdisk bitmap
//! records which blocks were overridden; a set bit routes the read to the
//! overlay, even when the overlay holds nothing (an override to zeros must
//! hide the template block).

use crate::{bitmap::Bitmap, content_get, content_shard, is_zero, lba::LbaIndex, Cluster, Error};
use bytes::Bytes;
use commonware_runtime::{Metrics, Network, Spawner};
use vdisk_ardb::resp::Command;

pub struct SemiDeduped<E: Spawner + Network + Metrics> {
    vdisk: String,
    block_size: u64,
    cluster: Cluster<E>,
    template: Option<Cluster<E>>,
    lba: LbaIndex<E>,
    bitmap: Bitmap<E>,
}

impl<E: Spawner + Network + Metrics> SemiDeduped<E> {
    pub fn init(
        vdisk: &str,
        block_size: u64,
        cluster: Cluster<E>,
        template: Option<Cluster<E>>,
    ) -> Self {
        let lba = LbaIndex::new(vdisk, cluster.clone());
        let bitmap = Bitmap::new(vdisk, cluster.clone());
        Self {
            vdisk: vdisk.to_string(),
            block_size,
            cluster,
            template,
            lba,
            bitmap,
        }
    }

    pub async fn get_block(&mut self, index: u64) -> Result<Bytes, Error> {
        if self.bitmap.get(index).await? {
            return self.get_local(index).await;
        }
        self.get_template(index).await
    }

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
        let server = self.cluster.server_for(index).await;
        let command = Command::new("HSET")
            .arg(self.vdisk.clone())
            .arg_int(index)
            .arg(data);
        server.write(command).await?.into_ok()?;
        self.bitmap.set(index).await
    }

    /// Overrides the block with zeros: the local record goes away, and the
    /// set bit keeps the template block hidden.
    pub async fn delete_block(&mut self, index: u64) -> Result<(), Error> {
        let server = self.cluster.server_for(index).await;
        let command = Command::new("HDEL").arg(self.vdisk.clone()).arg_int(index);
        server.write(command).await?.into_ok()?;
        self.bitmap.set(index).await
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.bitmap.flush().await
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        let result = self.flush().await;
        self.cluster.close();
        if let Some(template) = &self.template {
            template.close();
        }
        result
    }

    async fn get_local(&mut self, index: u64) -> Result<Bytes, Error> {
        let server = self.cluster.server_for(index).await;
        let command = Command::new("HGET").arg(self.vdisk.clone()).arg_int(index);
        match server.read(command).await {
            Ok(reply) => Ok(reply.into_bytes()?.unwrap_or_default()),
            Err(vdisk_ardb::Error::ServerRetired) => Ok(Bytes::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_template(&mut self, index: u64) -> Result<Bytes, Error> {
        let Some(hash) = self.lba.get(index).await? else {
            return Ok(Bytes::new());
        };
        let Some(template) = &self.template else {
            return Ok(Bytes::new());
        };
        let server = template.server_for(content_shard(&hash)).await;
        match server.read(content_get(&hash)).await {
            Ok(reply) => Ok(reply.into_bytes()?.unwrap_or_default()),
            Err(vdisk_ardb::Error::ServerRetired) => Ok(Bytes::new()),
            Err(err) => Err(err.into()),
        }
    }
}
