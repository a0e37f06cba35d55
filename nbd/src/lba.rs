//! The LBA index of a deduped vdisk.
//!
//! Maps block indices to content hashes. The map is partitioned into
//! sectors of [RECORDS_PER_SECTOR] hashes; a sector is the unit of fetch,
//! dirty tracking, and writeback. Sectors live in a bounded LRU: reads from
//! the owning task observe writes immediately, and everything else observes
//! them after a [LbaIndex::flush] or an eviction.
//!
//! Persisted layout: redis hash `<vdisk>:lba`, field = sector index, value
//! = the packed hashes, on the server `sector index % cluster size`. An
//! all-vacant sector is deleted instead of written.

use crate::{BlockHash, Cluster, Error, ZERO_HASH};
use bytes::{Bytes, BytesMut};
use commonware_runtime::{Metrics, Network, Spawner};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use vdisk_ardb::resp::Command;

/// Content hashes per LBA sector.
pub(crate) const RECORDS_PER_SECTOR: u64 = 128;

const HASH_BYTES: usize = 32;
const SECTOR_BYTES: usize = HASH_BYTES * RECORDS_PER_SECTOR as usize;

/// Sectors kept in memory per vdisk.
const DEFAULT_CAPACITY: usize = 64;

fn locate(index: u64) -> (u64, usize) {
    (
        index / RECORDS_PER_SECTOR,
        (index % RECORDS_PER_SECTOR) as usize,
    )
}

/// A fixed-stride array of content hashes covering a contiguous range of
/// block indices. The zero hash marks a vacant slot.
struct Sector {
    hashes: Vec<BlockHash>,
    dirty: bool,
}

impl Sector {
    fn vacant() -> Self {
        Self {
            hashes: vec![ZERO_HASH; RECORDS_PER_SECTOR as usize],
            dirty: false,
        }
    }

    fn decode(raw: &[u8], sector_index: u64) -> Result<Self, Error> {
        if raw.len() != SECTOR_BYTES {
            return Err(Error::CorruptSector(sector_index));
        }
        let hashes = raw
            .chunks_exact(HASH_BYTES)
            .map(|chunk| BlockHash::from(<[u8; HASH_BYTES]>::try_from(chunk).expect("exact chunk")))
            .collect();
        Ok(Self {
            hashes,
            dirty: false,
        })
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SECTOR_BYTES);
        for hash in &self.hashes {
            buf.extend_from_slice(hash.as_ref());
        }
        buf.freeze()
    }

    fn get(&self, slot: usize) -> Option<BlockHash> {
        let hash = self.hashes[slot];
        (hash != ZERO_HASH).then_some(hash)
    }

    fn set(&mut self, slot: usize, hash: BlockHash) {
        if self.hashes[slot] != hash {
            self.hashes[slot] = hash;
            self.dirty = true;
        }
    }

    fn is_vacant(&self) -> bool {
        self.hashes.iter().all(|hash| *hash == ZERO_HASH)
    }
}

/// A bounded, write-back cache over the persisted LBA map.
pub(crate) struct LbaIndex<E: Spawner + Network + Metrics> {
    vdisk: String,
    cluster: Cluster<E>,
    capacity: usize,
    sectors: HashMap<u64, Sector>,
    /// LRU order; front is the next eviction candidate.
    order: VecDeque<u64>,
}

impl<E: Spawner + Network + Metrics> LbaIndex<E> {
    pub fn new(vdisk: &str, cluster: Cluster<E>) -> Self {
        Self::with_capacity(vdisk, cluster, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(vdisk: &str, cluster: Cluster<E>, capacity: usize) -> Self {
        Self {
            vdisk: vdisk.to_string(),
            cluster,
            capacity: capacity.max(1),
            sectors: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn key(&self) -> String {
        format!("{}:lba", self.vdisk)
    }

    /// Returns the content hash stored for a block index.
    pub async fn get(&mut self, index: u64) -> Result<Option<BlockHash>, Error> {
        let (sector_index, slot) = locate(index);
        self.load(sector_index).await?;
        let sector = self.sectors.get(&sector_index).expect("sector just loaded");
        Ok(sector.get(slot))
    }

    /// Records the content hash of a block index.
    pub async fn set(&mut self, index: u64, hash: BlockHash) -> Result<(), Error> {
        let (sector_index, slot) = locate(index);
        self.load(sector_index).await?;
        let sector = self
            .sectors
            .get_mut(&sector_index)
            .expect("sector just loaded");
        sector.set(slot, hash);
        Ok(())
    }

    /// Clears the mapping of a block index.
    pub async fn delete(&mut self, index: u64) -> Result<(), Error> {
        self.set(index, ZERO_HASH).await
    }

    /// Persists every dirty sector, one pipelined batch per server.
    pub async fn flush(&mut self) -> Result<(), Error> {
        let key = self.key();
        let mut batches: HashMap<usize, (vdisk_ardb::Server<E>, Vec<(u64, Command)>)> =
            HashMap::new();
        for (sector_index, sector) in &self.sectors {
            if !sector.dirty {
                continue;
            }
            let server = self.cluster.server_for(*sector_index).await;
            let command = if sector.is_vacant() {
                Command::new("HDEL").arg(key.clone()).arg_int(*sector_index)
            } else {
                Command::new("HSET")
                    .arg(key.clone())
                    .arg_int(*sector_index)
                    .arg(sector.encode())
            };
            batches
                .entry(server.index())
                .or_insert_with(|| (server, Vec::new()))
                .1
                .push((*sector_index, command));
        }

        for (_, (server, batch)) in batches {
            let commands: Vec<Command> = batch.iter().map(|(_, command)| command.clone()).collect();
            let replies = server.write_pipeline(&commands).await?;
            for reply in replies {
                reply.into_ok()?;
            }
            // Only acked sectors become clean; a failed server leaves its
            // sectors dirty for the next flush.
            for (sector_index, _) in batch {
                if let Some(sector) = self.sectors.get_mut(&sector_index) {
                    sector.dirty = false;
                }
            }
        }
        Ok(())
    }

    async fn load(&mut self, sector_index: u64) -> Result<(), Error> {
        if self.sectors.contains_key(&sector_index) {
            self.touch(sector_index);
            return Ok(());
        }
        let sector = self.fetch(sector_index).await?;
        self.make_room().await?;
        self.sectors.insert(sector_index, sector);
        self.order.push_back(sector_index);
        Ok(())
    }

    async fn fetch(&self, sector_index: u64) -> Result<Sector, Error> {
        let server = self.cluster.server_for(sector_index).await;
        let command = Command::new("HGET").arg(self.key()).arg_int(sector_index);
        match server.read(command).await {
            Ok(reply) => match reply.into_bytes()? {
                Some(raw) => Sector::decode(&raw, sector_index),
                None => Ok(Sector::vacant()),
            },
            // A retired server's sectors are gone; the blocks they mapped
            // read as never written.
            Err(vdisk_ardb::Error::ServerRetired) => Ok(Sector::vacant()),
            Err(err) => Err(err.into()),
        }
    }

    async fn make_room(&mut self) -> Result<(), Error> {
        while self.sectors.len() >= self.capacity {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            let Some(sector) = self.sectors.remove(&victim) else {
                continue;
            };
            if sector.dirty {
                debug!(sector = victim, "flushing evicted sector");
                self.write_sector(victim, &sector).await?;
            }
        }
        Ok(())
    }

    async fn write_sector(&self, sector_index: u64, sector: &Sector) -> Result<(), Error> {
        let server = self.cluster.server_for(sector_index).await;
        let command = if sector.is_vacant() {
            Command::new("HDEL").arg(self.key()).arg_int(sector_index)
        } else {
            Command::new("HSET")
                .arg(self.key())
                .arg_int(sector_index)
                .arg(sector.encode())
        };
        server.write(command).await?.into_ok()?;
        Ok(())
    }

    fn touch(&mut self, sector_index: u64) {
        if let Some(position) = self.order.iter().position(|key| *key == sector_index) {
            self.order.remove(position);
        }
        self.order.push_back(sector_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use commonware_runtime::{deterministic, Runner};
    use std::sync::Arc;
    use vdisk_config::{ServerState, VdiskType};

    fn hash(byte: u8) -> BlockHash {
        crate::hash_block(&[byte])
    }

    #[test]
    fn test_sector_roundtrip() {
        let mut sector = Sector::vacant();
        assert!(sector.is_vacant());
        assert!(!sector.dirty);
        sector.set(3, hash(1));
        sector.set(127, hash(2));
        assert!(sector.dirty);
        assert!(!sector.is_vacant());

        let decoded = Sector::decode(&sector.encode(), 0).unwrap();
        assert_eq!(decoded.get(3), Some(hash(1)));
        assert_eq!(decoded.get(127), Some(hash(2)));
        assert_eq!(decoded.get(0), None);
    }

    #[test]
    fn test_sector_decode_rejects_bad_length() {
        assert!(matches!(
            Sector::decode(&[0u8; 31], 7),
            Err(Error::CorruptSector(7))
        ));
    }

    #[test]
    fn test_read_your_writes_and_flush() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online; 2]);
            let source = testing::describe(VdiskType::Boot, &primary, None);
            let pools = testing::pools(&context, "lba");
            let cluster = Arc::new(
                vdisk_ardb::Controller::primary(context.clone(), pools.clone(), source.clone(), testing::VDISK)
                    .await
                    .unwrap(),
            );

            let mut index = LbaIndex::new(testing::VDISK, cluster.clone());
            index.set(0, hash(1)).await.unwrap();
            index.set(129, hash(2)).await.unwrap();
            assert_eq!(index.get(0).await.unwrap(), Some(hash(1)));
            assert_eq!(index.get(129).await.unwrap(), Some(hash(2)));
            assert_eq!(index.get(1).await.unwrap(), None);
            index.flush().await.unwrap();

            // A fresh index (same cluster) sees the flushed mappings.
            let mut fresh = LbaIndex::new(testing::VDISK, cluster);
            assert_eq!(fresh.get(0).await.unwrap(), Some(hash(1)));
            assert_eq!(fresh.get(129).await.unwrap(), Some(hash(2)));
            assert_eq!(fresh.get(64).await.unwrap(), None);
        });
    }

    #[test]
    fn test_vacant_sector_removed_on_flush() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online]);
            let source = testing::describe(VdiskType::Boot, &primary, None);
            let pools = testing::pools(&context, "lba");
            let cluster = Arc::new(
                vdisk_ardb::Controller::primary(context.clone(), pools.clone(), source.clone(), testing::VDISK)
                    .await
                    .unwrap(),
            );

            let mut index = LbaIndex::new(testing::VDISK, cluster);
            index.set(5, hash(9)).await.unwrap();
            index.flush().await.unwrap();
            index.delete(5).await.unwrap();
            index.flush().await.unwrap();

            // The whole sector went vacant, so its field is gone.
            let reply = primary.backends[0].apply(
                0,
                &[
                    bytes::Bytes::from_static(b"HEXISTS"),
                    bytes::Bytes::from_static(b"disk1:lba"),
                    bytes::Bytes::from_static(b"0"),
                ],
            );
            assert_eq!(reply, vdisk_ardb::resp::Reply::Integer(0));
        });
    }

    #[test]
    fn test_eviction_flushes_dirty_sector() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(&context, 16379, &[ServerState::Online]);
            let source = testing::describe(VdiskType::Boot, &primary, None);
            let pools = testing::pools(&context, "lba");
            let cluster = Arc::new(
                vdisk_ardb::Controller::primary(context.clone(), pools.clone(), source.clone(), testing::VDISK)
                    .await
                    .unwrap(),
            );

            // Capacity one: loading a second sector evicts (and persists)
            // the first.
            let mut index = LbaIndex::with_capacity(testing::VDISK, cluster.clone(), 1);
            index.set(0, hash(3)).await.unwrap();
            index.set(RECORDS_PER_SECTOR, hash(4)).await.unwrap();

            let mut fresh = LbaIndex::new(testing::VDISK, cluster);
            assert_eq!(fresh.get(0).await.unwrap(), Some(hash(3)));
        });
    }

    #[test]
    fn test_retired_server_reads_vacant() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let primary = testing::serve_cluster(
                &context,
                16379,
                &[ServerState::Online, ServerState::Rip],
            );
            let source = testing::describe(VdiskType::Boot, &primary, None);
            let pools = testing::pools(&context, "lba");
            let cluster = Arc::new(
                vdisk_ardb::Controller::primary(context.clone(), pools.clone(), source.clone(), testing::VDISK)
                    .await
                    .unwrap(),
            );

            let mut index = LbaIndex::new(testing::VDISK, cluster);
            // Sector 1 maps to the retired server: reads come back vacant.
            assert_eq!(index.get(RECORDS_PER_SECTOR).await.unwrap(), None);
        });
    }
}
