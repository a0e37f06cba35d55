//! The vdisk transaction log.
//!
//! Every write to a tlog-enabled vdisk is recorded as a [wire::Block] with
//! a per-vdisk, strictly monotonic sequence number. Blocks are batched into
//! aggregations of up to `flush_size` blocks (or whatever accumulated when
//! `flush_time` elapses), sealed (serialized, compressed, AES-CTR
//! encrypted), split into `K + M` Reed-Solomon shards, and shipped to an
//! object store. Each aggregation records the digest of its sealed
//! predecessor, forming a hash chain a replayer can walk back.
//!
//! Two deployments of the same pipeline:
//!
//! - [client]: the in-process pipeline, feeding the object store directly.
//! - [server]: a TCP service speaking the framed [wire] protocol, with a
//!   process-wide [server::Registry] owning one flusher per vdisk.

use thiserror::Error as ThisError;

pub mod client;
mod erasure;
mod flusher;
pub mod seal;
pub mod server;
pub mod store;
pub mod wire;

pub use erasure::Coding;
pub use flusher::{Aggregation, AggregationCfg, Flusher};

/// The digest type used for block hashes and the aggregation chain.
pub type Digest = commonware_cryptography::blake3::Digest;

/// The zero digest: `prev` of the first aggregation of a vdisk.
pub const ZERO_DIGEST: Digest = commonware_cryptography::blake3::Digest([0u8; 32]);

/// Blocks per aggregation before a flush is forced.
pub const DEFAULT_FLUSH_SIZE: usize = 25;

/// How long a partial aggregation may wait for more blocks.
pub const DEFAULT_FLUSH_TIME: std::time::Duration = std::time::Duration::from_secs(25);

/// Errors surfaced by the transaction log.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("backend error: {0}")]
    Ardb(#[from] vdisk_ardb::Error),
    #[error("message of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("peer closed the stream")]
    StreamClosed,
    #[error("compression error: {0}")]
    Compression(String),
    #[error("erasure coding error: {0}")]
    Erasure(String),
    #[error("object {0} has missing or corrupt shards")]
    ObjectCorrupt(Digest),
    #[error("aggregation could not be shipped after {0} attempts")]
    RetriesExhausted(usize),
    #[error("the tlog pipeline is gone")]
    PipelineClosed,
    #[error("invalid private key: expected 32 bytes, got {0}")]
    InvalidKey(usize),
}
