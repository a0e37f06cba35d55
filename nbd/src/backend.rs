//! Byte-granular access over a block engine.
//!
//! The NBD frontend works in byte ranges; engines work in whole blocks.
//! This adapter splits a range into blocks, turning partial-block writes
//! into read-merge-write and aligned all-zero writes into deletes. Requests
//! for distinct blocks may reorder relative to each other, but every
//! request against a single backend is serialized through `&mut self`.

use crate::{is_zero, Error, Storage};
use bytes::{Bytes, BytesMut};
use commonware_runtime::{Clock, Metrics, Network, Spawner};

pub struct Backend<E: Spawner + Clock + Network + Metrics> {
    storage: Storage<E>,
    block_size: u64,
    size: u64,
}

impl<E: Spawner + Clock + Network + Metrics> Backend<E> {
    pub fn new(storage: Storage<E>, block_size: u64, size: u64) -> Self {
        Self {
            storage,
            block_size,
            size,
        }
    }

    /// The vdisk size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads `length` bytes starting at `offset`. Absent blocks read as
    /// zeros.
    pub async fn read_at(&mut self, offset: u64, length: u64) -> Result<Bytes, Error> {
        self.check_bounds(offset, length)?;
        let mut out = BytesMut::with_capacity(length as usize);
        let mut cursor = offset;
        let end = offset + length;
        while cursor < end {
            let index = cursor / self.block_size;
            let within = (cursor % self.block_size) as usize;
            let take = ((end - cursor) as usize).min(self.block_size as usize - within);

            let block = self.storage.get_block(index).await?;
            if block.is_empty() {
                out.resize(out.len() + take, 0);
            } else {
                out.extend_from_slice(&block[within..within + take]);
            }
            cursor += take as u64;
        }
        Ok(out.freeze())
    }

    /// Writes `data` starting at `offset`.
    pub async fn write_at(&mut self, offset: u64, data: Bytes) -> Result<(), Error> {
        self.check_bounds(offset, data.len() as u64)?;
        let mut cursor = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let index = cursor / self.block_size;
            let within = (cursor % self.block_size) as usize;
            let take = remaining.len().min(self.block_size as usize - within);
            let chunk = remaining.split_to(take);

            if within == 0 && take as u64 == self.block_size {
                // Aligned full block: the engine handles zero-deletes.
                self.storage.set_block(index, chunk).await?;
            } else {
                self.merge(index, within, &chunk).await?;
            }
            cursor += take as u64;
        }
        Ok(())
    }

    /// Writes zeros over `[offset, offset + length)`.
    pub async fn write_zeroes_at(&mut self, offset: u64, length: u64) -> Result<(), Error> {
        self.check_bounds(offset, length)?;
        let mut cursor = offset;
        let end = offset + length;
        while cursor < end {
            let index = cursor / self.block_size;
            let within = (cursor % self.block_size) as usize;
            let take = ((end - cursor) as usize).min(self.block_size as usize - within);

            if within == 0 && take as u64 == self.block_size {
                self.storage.delete_block(index).await?;
            } else {
                self.merge(index, within, &vec![0u8; take]).await?;
            }
            cursor += take as u64;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.storage.flush().await
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.storage.close().await
    }

    /// Read-merge-write of a partial block.
    async fn merge(&mut self, index: u64, within: usize, chunk: &[u8]) -> Result<(), Error> {
        let current = self.storage.get_block(index).await?;
        let mut block = BytesMut::zeroed(self.block_size as usize);
        if !current.is_empty() {
            block[..current.len()].copy_from_slice(&current);
        }
        block[within..within + chunk.len()].copy_from_slice(chunk);

        if is_zero(&block) {
            self.storage.delete_block(index).await
        } else {
            self.storage.set_block(index, block.freeze()).await
        }
    }

    fn check_bounds(&self, offset: u64, length: u64) -> Result<(), Error> {
        if offset
            .checked_add(length)
            .map(|end| end > self.size)
            .unwrap_or(true)
        {
            return Err(Error::OutOfBounds { offset, length });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use commonware_runtime::{deterministic, Runner};
    use vdisk_config::{ServerState, VdiskType};

    async fn backend(
        context: &commonware_runtime::deterministic::Context,
        primary: &testing::TestCluster,
    ) -> Backend<commonware_runtime::deterministic::Context> {
        let source = testing::describe(VdiskType::Db, primary, None);
        let storage = crate::open(
            context.clone(),
            testing::pools(context, "backend"),
            source,
            testing::VDISK,
        )
        .await
        .unwrap();
        Backend::new(storage, testing::BLOCK_SIZE, testing::BLOCK_SIZE * 8)
    }

    #[test]
    fn test_two_block_roundtrip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online; 2]);
            let mut backend = backend(&context, &primary).await;

            backend
                .write_at(0, Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7]))
                .await
                .unwrap();
            backend
                .write_at(8, Bytes::from_static(&[8, 9, 10, 11, 12, 13, 14, 15]))
                .await
                .unwrap();
            let read = backend.read_at(0, 16).await.unwrap();
            assert_eq!(
                read.as_ref(),
                &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
            );
            backend.close().await.unwrap();
        });
    }

    #[test]
    fn test_half_zero_overwrite() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online; 2]);
            let mut backend = backend(&context, &primary).await;

            backend
                .write_at(0, Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7]))
                .await
                .unwrap();
            backend.write_zeroes_at(4, 4).await.unwrap();
            let read = backend.read_at(0, 8).await.unwrap();
            assert_eq!(read.as_ref(), &[0, 1, 2, 3, 0, 0, 0, 0]);
            backend.close().await.unwrap();
        });
    }

    #[test]
    fn test_delete_via_zeroes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online]);
            let mut backend = backend(&context, &primary).await;

            backend
                .write_at(0, Bytes::from_static(&[1u8; 8]))
                .await
                .unwrap();
            backend.write_zeroes_at(0, 8).await.unwrap();
            let read = backend.read_at(0, 8).await.unwrap();
            assert_eq!(read.as_ref(), &[0u8; 8]);

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
            backend.close().await.unwrap();
        });
    }

    #[test]
    fn test_unaligned_write_merges() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online; 2]);
            let mut backend = backend(&context, &primary).await;

            // A write spanning two blocks, starting mid-block.
            backend
                .write_at(4, Bytes::from_static(&[9u8; 8]))
                .await
                .unwrap();
            let read = backend.read_at(0, 16).await.unwrap();
            assert_eq!(
                read.as_ref(),
                &[0, 0, 0, 0, 9, 9, 9, 9, 9, 9, 9, 9, 0, 0, 0, 0]
            );
            backend.close().await.unwrap();
        });
    }

    #[test]
    fn test_out_of_bounds() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online]);
            let mut backend = backend(&context, &primary).await;
            assert!(matches!(
                backend.read_at(60, 8).await,
                Err(Error::OutOfBounds { .. })
            ));
            backend.close().await.unwrap();
        });
    }
}
