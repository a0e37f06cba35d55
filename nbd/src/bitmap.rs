//! The override bitmap of a semi-deduped vdisk: one bit per block index,
//! set when the block was written locally. Sector-sharded and flushed like
//! the LBA index, under `<vdisk>:bitmap`.

use crate::{Cluster, Error};
use bytes::Bytes;
use commonware_runtime::{Metrics, Network, Spawner};
use std::collections::HashMap;
use vdisk_ardb::resp::Command;

/// Block indices covered by one bitmap sector.
pub(crate) const BITS_PER_SECTOR: u64 = 4096;

const SECTOR_BYTES: usize = (BITS_PER_SECTOR / 8) as usize;

fn locate(index: u64) -> (u64, usize, u8) {
    let sector = index / BITS_PER_SECTOR;
    let bit = index % BITS_PER_SECTOR;
    (sector, (bit / 8) as usize, 1 << (bit % 8))
}

struct Sector {
    bits: Vec<u8>,
    dirty: bool,
}

impl Sector {
    fn vacant() -> Self {
        Self {
            bits: vec![0u8; SECTOR_BYTES],
            dirty: false,
        }
    }

    fn decode(raw: &[u8], sector_index: u64) -> Result<Self, Error> {
        if raw.len() != SECTOR_BYTES {
            return Err(Error::CorruptBitmap(sector_index));
        }
        Ok(Self {
            bits: raw.to_vec(),
            dirty: false,
        })
    }

    fn is_vacant(&self) -> bool {
        self.bits.iter().all(|byte| *byte == 0)
    }
}

pub(crate) struct Bitmap<E: Spawner + Network + Metrics> {
    vdisk: String,
    cluster: Cluster<E>,
    sectors: HashMap<u64, Sector>,
}

impl<E: Spawner + Network + Metrics> Bitmap<E> {
    pub fn new(vdisk: &str, cluster: Cluster<E>) -> Self {
        Self {
            vdisk: vdisk.to_string(),
            cluster,
            sectors: HashMap::new(),
        }
    }

    fn key(&self) -> String {
        format!("{}:bitmap", self.vdisk)
    }

    /// Whether the block at `index` was overridden locally.
    pub async fn get(&mut self, index: u64) -> Result<bool, Error> {
        let (sector_index, byte, mask) = locate(index);
        self.load(sector_index).await?;
        let sector = self.sectors.get(&sector_index).expect("sector just loaded");
        Ok(sector.bits[byte] & mask != 0)
    }

    /// Marks the block at `index` as overridden.
    pub async fn set(&mut self, index: u64) -> Result<(), Error> {
        let (sector_index, byte, mask) = locate(index);
        self.load(sector_index).await?;
        let sector = self
            .sectors
            .get_mut(&sector_index)
            .expect("sector just loaded");
        if sector.bits[byte] & mask == 0 {
            sector.bits[byte] |= mask;
            sector.dirty = true;
        }
        Ok(())
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
                    .arg(Bytes::copy_from_slice(&sector.bits))
            };
            batches
                .entry(server.index())
                .or_insert_with(|| (server, Vec::new()))
                .1
                .push((*sector_index, command));
        }

        for (_, (server, batch)) in batches {
            let commands: Vec<Command> = batch.iter().map(|(_, command)| command.clone()).collect();
            for reply in server.write_pipeline(&commands).await? {
                reply.into_ok()?;
            }
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
            return Ok(());
        }
        let server = self.cluster.server_for(sector_index).await;
        let command = Command::new("HGET").arg(self.key()).arg_int(sector_index);
        let sector = match server.read(command).await {
            Ok(reply) => match reply.into_bytes()? {
                Some(raw) => Sector::decode(&raw, sector_index)?,
                None => Sector::vacant(),
            },
            Err(vdisk_ardb::Error::ServerRetired) => Sector::vacant(),
            Err(err) => return Err(err.into()),
        };
        self.sectors.insert(sector_index, sector);
        Ok(())
    }
}
