//! Block storage engines backing vdisk NBD exports.
//!
//! Every engine maps `(block index) -> block bytes` onto an ardb cluster,
//! in one of three layouts:
//!
//! - [Deduped]: blocks are content-addressed. A per-vdisk LBA index maps
//!   block indices to content hashes; identical blocks collapse to a single
//!   physical copy shared across vdisks.
//! - [NonDeduped]: blocks are stored per vdisk, keyed by index.
//! - [SemiDeduped]: a read-only deduped template layer with a non-deduped
//!   overlay for local writes, tracked by a per-vdisk bitmap.
//!
//! All engines share two invariants: a block that was never written reads
//! as absent (the caller sees zeros), and writing an all-zero block is a
//! delete. Engines with a template cluster fetch unknown blocks from it on
//! first read and, where the layout allows, write them through to the
//! primary cluster.

use bytes::Bytes;
use commonware_cryptography::{blake3::Blake3, Hasher};
use commonware_runtime::{Clock, Metrics, Network, Spawner};
use std::sync::Arc;
use thiserror::Error as ThisError;
use vdisk_ardb::{Controller, Pools};
use vdisk_config::{Source, StorageType};

pub mod backend;
mod bitmap;
pub mod cache;
pub mod copy;
mod dedup;
mod lba;
mod nondedup;
mod semidedup;

pub use backend::Backend;
pub use cache::WriteCache;
pub use dedup::Deduped;
pub use nondedup::NonDeduped;
pub use semidedup::SemiDeduped;

/// The content hash of a block.
pub type BlockHash = commonware_cryptography::blake3::Digest;

/// The vacant-slot sentinel in LBA sectors.
pub const ZERO_HASH: BlockHash = commonware_cryptography::blake3::Digest([0u8; 32]);

/// Hashes the contents of a block.
pub fn hash_block(data: &[u8]) -> BlockHash {
    Blake3::hash(data)
}

/// Whether a block is all zeros (and therefore a delete when written).
pub(crate) fn is_zero(data: &[u8]) -> bool {
    data.iter().all(|byte| *byte == 0)
}

/// The ardb key of the content-addressed store bucket holding `hash`.
///
/// Content is spread over 256 buckets by hash prefix so no single redis
/// hash grows unbounded; the store is shared across vdisks.
pub(crate) fn content_key(hash: &BlockHash) -> String {
    format!("0-stor:{:02x}", hash.as_ref()[0])
}

/// The shard a content hash maps to (the low bits of the hash).
pub(crate) fn content_shard(hash: &BlockHash) -> u64 {
    u64::from_le_bytes(hash.as_ref()[..8].try_into().expect("digest is 32 bytes"))
}

/// HGET of a content-addressed block.
pub(crate) fn content_get(hash: &BlockHash) -> vdisk_ardb::resp::Command {
    vdisk_ardb::resp::Command::new("HGET")
        .arg(content_key(hash))
        .arg(Bytes::copy_from_slice(hash.as_ref()))
}

/// HSET of a content-addressed block.
pub(crate) fn content_put(hash: &BlockHash, data: Bytes) -> vdisk_ardb::resp::Command {
    vdisk_ardb::resp::Command::new("HSET")
        .arg(content_key(hash))
        .arg(Bytes::copy_from_slice(hash.as_ref()))
        .arg(data)
}

/// A shared handle to a cluster controller.
pub type Cluster<E> = Arc<Controller<E>>;

/// Errors surfaced by the storage engines.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("backend error: {0}")]
    Ardb(#[from] vdisk_ardb::Error),
    #[error("config error: {0}")]
    Config(#[from] vdisk_config::Error),
    #[error("block has {got} bytes, expected at most {expected}")]
    InvalidBlockSize { expected: u64, got: usize },
    #[error("lba sector {0} is corrupt")]
    CorruptSector(u64),
    #[error("bitmap sector {0} is corrupt")]
    CorruptBitmap(u64),
    #[error("cluster sizes differ: source has {source_count} servers, target {target}")]
    ClusterSizeMismatch { source_count: usize, target: usize },
    #[error("malformed field in hash {0}")]
    MalformedField(String),
    #[error("request [{offset}, {offset}+{length}) is outside the vdisk")]
    OutOfBounds { offset: u64, length: u64 },
}

/// A vdisk's block storage, dispatching to the engine its type prescribes.
pub enum Storage<E: Spawner + Clock + Network + Metrics> {
    Deduped(Deduped<E>),
    NonDeduped(NonDeduped<E>),
    SemiDeduped(SemiDeduped<E>),
}

impl<E: Spawner + Clock + Network + Metrics> Storage<E> {
    /// Returns the block at `index`, or an empty buffer if it was never
    /// written (or was deleted).
    pub async fn get_block(&mut self, index: u64) -> Result<Bytes, Error> {
        match self {
            Self::Deduped(engine) => engine.get_block(index).await,
            Self::NonDeduped(engine) => engine.get_block(index).await,
            Self::SemiDeduped(engine) => engine.get_block(index).await,
        }
    }

    /// Stores the block at `index`. Empty or all-zero data is a delete.
    pub async fn set_block(&mut self, index: u64, data: Bytes) -> Result<(), Error> {
        match self {
            Self::Deduped(engine) => engine.set_block(index, data).await,
            Self::NonDeduped(engine) => engine.set_block(index, data).await,
            Self::SemiDeduped(engine) => engine.set_block(index, data).await,
        }
    }

    /// Removes the block at `index`.
    pub async fn delete_block(&mut self, index: u64) -> Result<(), Error> {
        match self {
            Self::Deduped(engine) => engine.delete_block(index).await,
            Self::NonDeduped(engine) => engine.delete_block(index).await,
            Self::SemiDeduped(engine) => engine.delete_block(index).await,
        }
    }

    /// Persists all buffered state (LBA sectors, bitmaps).
    pub async fn flush(&mut self) -> Result<(), Error> {
        match self {
            Self::Deduped(engine) => engine.flush().await,
            Self::NonDeduped(engine) => engine.flush().await,
            Self::SemiDeduped(engine) => engine.flush().await,
        }
    }

    /// Flushes and releases every resource owned by the engine.
    pub async fn close(&mut self) -> Result<(), Error> {
        match self {
            Self::Deduped(engine) => engine.close().await,
            Self::NonDeduped(engine) => engine.close().await,
            Self::SemiDeduped(engine) => engine.close().await,
        }
    }
}

/// Opens the block storage of `vdisk`, building the engine its configured
/// type prescribes (plus the template controller where one is configured).
pub async fn open<E: Spawner + Clock + Network + Metrics, S: Source>(
    context: E,
    pools: Pools<E>,
    source: S,
    vdisk: &str,
) -> Result<Storage<E>, Error> {
    let static_config = vdisk_config::source::read_vdisk_static(&source, vdisk)?;
    let primary: Cluster<E> = Arc::new(
        Controller::primary(context.clone(), pools.clone(), source.clone(), vdisk).await?,
    );
    let template: Option<Cluster<E>> =
        Controller::template(context.clone(), pools.clone(), source.clone(), vdisk)
            .await?
            .map(Arc::new);

    Ok(match static_config.vdisk_type.storage_type() {
        StorageType::Deduped => Storage::Deduped(Deduped::init(
            context,
            vdisk,
            static_config.block_size,
            primary,
            template,
        )),
        StorageType::NonDeduped => Storage::NonDeduped(NonDeduped::init(
            vdisk,
            static_config.block_size,
            primary,
            template,
        )),
        StorageType::SemiDeduped => Storage::SemiDeduped(SemiDeduped::init(
            vdisk,
            static_config.block_size,
            primary,
            template,
        )),
    })
}
