//! The non-deduped engine: blocks stored per vdisk, keyed by block index,
//! on the server `index % cluster size`. The shard of an index never moves,
//! which is also why a non-deduped vdisk cannot be copied onto a cluster of
//! a different size.

use crate::{is_zero, Cluster, Error};
use bytes::Bytes;
use commonware_runtime::{Metrics, Network, Spawner};
use tracing::debug;
use vdisk_ardb::resp::Command;

pub struct NonDeduped<E: Spawner + Network + Metrics> {
    vdisk: String,
    block_size: u64,
    cluster: Cluster<E>,
    template: Option<Cluster<E>>,
}

impl<E: Spawner + Network + Metrics> NonDeduped<E> {
    pub fn init(
        vdisk: &str,
        block_size: u64,
        cluster: Cluster<E>,
        template: Option<Cluster<E>>,
    ) -> Self {
        Self {
            vdisk: vdisk.to_string(),
            block_size,
            cluster,
            template,
        }
    }

    pub async fn get_block(&mut self, index: u64) -> Result<Bytes, Error> {
        let server = self.cluster.server_for(index).await;
        let command = Command::new("HGET").arg(self.vdisk.clone()).arg_int(index);
        match server.read(command).await {
            Ok(reply) => match reply.into_bytes()? {
                Some(data) => Ok(data),
                None => self.fetch_template(index, true).await,
            },
            // Data on a retired server is gone; the block reads as never
            // written.
            Err(vdisk_ardb::Error::ServerRetired) => Ok(Bytes::new()),
            Err(vdisk_ardb::Error::ServerUnavailable) if self.template.is_some() => {
                self.fetch_template(index, false).await
            }
            Err(err) => Err(err.into()),
        }
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
        Ok(())
    }

    pub async fn delete_block(&mut self, index: u64) -> Result<(), Error> {
        let server = self.cluster.server_for(index).await;
        let command = Command::new("HDEL").arg(self.vdisk.clone()).arg_int(index);
        server.write(command).await?.into_ok()?;
        Ok(())
    }

    /// Writes are synchronous; there is nothing to flush.
    pub async fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.cluster.close();
        if let Some(template) = &self.template {
            template.close();
        }
        Ok(())
    }

    async fn fetch_template(&mut self, index: u64, write_through: bool) -> Result<Bytes, Error> {
        let Some(template) = &self.template else {
            return Ok(Bytes::new());
        };
        let server = template.server_for(index).await;
        let command = Command::new("HGET").arg(self.vdisk.clone()).arg_int(index);
        let data = match server.read(command).await {
            Ok(reply) => reply.into_bytes()?,
            Err(vdisk_ardb::Error::ServerRetired) => None,
            Err(err) => return Err(err.into()),
        };
        let Some(data) = data else {
            return Ok(Bytes::new());
        };

        if write_through {
            debug!(vdisk = %self.vdisk, index, "copying template block to primary");
            let primary = self.cluster.server_for(index).await;
            let command = Command::new("HSET")
                .arg(self.vdisk.clone())
                .arg_int(index)
                .arg(data.clone());
            primary.write(command).await?.into_ok()?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing, Storage};
    use commonware_runtime::{deterministic, Runner};
    use rand::{Rng, SeedableRng};
    use vdisk_config::{ServerState, VdiskType};

    #[test]
    fn test_read_your_writes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online; 2]);
            let source = testing::describe(VdiskType::Db, &primary, None);
            let pools = testing::pools(&context, "nondedup");
            let mut storage = crate::open(context.clone(), pools, source, testing::VDISK)
                .await
                .unwrap();
            assert!(matches!(&storage, Storage::NonDeduped(_)));

            let mut rng = rand::rngs::StdRng::seed_from_u64(7);
            let mut blocks = Vec::new();
            for index in 0u64..8 {
                let mut block = vec![0u8; testing::BLOCK_SIZE as usize];
                rng.fill(block.as_mut_slice());
                blocks.push(Bytes::from(block.clone()));
                storage.set_block(index, Bytes::from(block)).await.unwrap();
            }
            for index in 0u64..8 {
                assert_eq!(
                    storage.get_block(index).await.unwrap(),
                    blocks[index as usize]
                );
            }
            storage.close().await.unwrap();
        });
    }

    #[test]
    fn test_zero_write_deletes_record() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online]);
            let source = testing::describe(VdiskType::Db, &primary, None);
            let pools = testing::pools(&context, "nondedup");
            let mut storage = crate::open(context.clone(), pools, source, testing::VDISK)
                .await
                .unwrap();

            storage
                .set_block(0, Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]))
                .await
                .unwrap();
            storage
                .set_block(0, Bytes::from_static(&[0u8; 8]))
                .await
                .unwrap();
            assert!(storage.get_block(0).await.unwrap().is_empty());

            // The backend holds no record for the block.
            let reply = primary.backends[0].apply(
                0,
                &[
                    Bytes::from_static(b"HEXISTS"),
                    Bytes::from_static(b"disk1"),
                    Bytes::from_static(b"0"),
                ],
            );
            assert_eq!(reply, vdisk_ardb::resp::Reply::Integer(0));
            storage.close().await.unwrap();
        });
    }

    #[test]
    fn test_retired_server_semantics() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Cluster [online, rip], block size 8, eight blocks: even
            // indices work, odd indices read zeros and refuse writes.
            let primary = testing::serve_cluster(
                &context,
                16379,
                &[ServerState::Online, ServerState::Rip],
            );
            let source = testing::describe(VdiskType::Db, &primary, None);
            let pools = testing::pools(&context, "nondedup");
            let mut storage = crate::open(context.clone(), pools, source, testing::VDISK)
                .await
                .unwrap();

            let data = Bytes::from_static(&[3u8; 8]);
            for index in (0u64..8).step_by(2) {
                storage.set_block(index, data.clone()).await.unwrap();
                assert_eq!(storage.get_block(index).await.unwrap(), data);
            }
            for index in (1u64..8).step_by(2) {
                assert!(storage.get_block(index).await.unwrap().is_empty());
                let err = storage.set_block(index, data.clone()).await.unwrap_err();
                assert!(matches!(
                    err,
                    Error::Ardb(vdisk_ardb::Error::ServerUnavailable)
                ));
            }
            storage.close().await.unwrap();
        });
    }

    #[test]
    fn test_template_fallback() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Seed the template cluster through an engine bound to it.
            let template = testing::serve_cluster(&context, 16390, &[ServerState::Online; 2]);
            let template_source = testing::describe(VdiskType::Db, &template, None);
            let template_pools = testing::pools(&context, "seed");
            let mut seeded = crate::open(
                context.with_label("seeded"),
                template_pools,
                template_source,
                testing::VDISK,
            )
            .await
            .unwrap();
            let data = Bytes::from_static(&[8u8; 8]);
            seeded.set_block(3, data.clone()).await.unwrap();

            // A fresh vdisk over an empty primary, with the template
            // configured.
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online; 2]);
            let source = testing::describe(VdiskType::Db, &primary, Some(&template));
            let pools = testing::pools(&context, "fresh");
            let mut storage = crate::open(context.with_label("fresh"), pools, source, testing::VDISK)
                .await
                .unwrap();

            // The unread block comes from the template and is written
            // through to the primary.
            assert_eq!(storage.get_block(3).await.unwrap(), data);
            let reply = primary.backends[1].apply(
                0,
                &[
                    Bytes::from_static(b"HEXISTS"),
                    Bytes::from_static(b"disk1"),
                    Bytes::from_static(b"3"),
                ],
            );
            assert_eq!(reply, vdisk_ardb::resp::Reply::Integer(1));

            // A block absent from both layers reads as zeros.
            assert!(storage.get_block(5).await.unwrap().is_empty());
            storage.close().await.unwrap();
        });
    }
}
