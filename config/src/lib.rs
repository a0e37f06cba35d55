//! Configuration documents and sources for vdisk.
//!
//! A vdisk is described by up to three documents (static, NBD, and tlog
//! configuration) plus one document per storage cluster it references. Each
//! document is stored as a standalone YAML value under a typed [Key], so the
//! same reader code works whether documents come from a single YAML file
//! ([FileSource]) or from a watchable key-value store ([MapSource]).
//!
//! Documents are validated on read: a document that parses but violates an
//! invariant (e.g. a block size that is not a power of two) is rejected
//! before it reaches any consumer.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

mod dial;
pub mod source;

pub use dial::parse_server_configs;
pub use source::{FileSource, Key, MapSource, Source};

/// Errors that can occur when reading or validating configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config not found: {0}")]
    NotFound(Key),
    #[error("invalid block size {0} (must be a power of two of at least 512)")]
    InvalidBlockSize(u64),
    #[error("vdisk size {size} is smaller than block size {block_size}")]
    InvalidSize { size: u64, block_size: u64 },
    #[error("invalid storage address: {0}")]
    InvalidAddress(String),
    #[error("storage cluster has no servers")]
    EmptyCluster,
    #[error("vdisk {vdisk} references unknown cluster {cluster}")]
    UnknownCluster { vdisk: String, cluster: String },
    #[error("vdisk {0} requires a template cluster but none is configured")]
    MissingTemplateCluster(String),
}

/// The type of a vdisk.
///
/// The type fixes how block data is laid out in the storage cluster and
/// which optional subsystems (template fallback, transaction log) apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VdiskType {
    Boot,
    Db,
    Cache,
    TmpDb,
    TmpCache,
}

/// How block data is addressed in the storage cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageType {
    /// Blocks are stored once per unique content, keyed by content hash.
    Deduped,
    /// Blocks are stored per vdisk, keyed by block index.
    NonDeduped,
    /// A read-only deduped template layer with a non-deduped write overlay.
    SemiDeduped,
}

impl VdiskType {
    /// Returns the storage layout used for this vdisk type.
    pub fn storage_type(&self) -> StorageType {
        match self {
            Self::Boot => StorageType::Deduped,
            Self::Db | Self::TmpDb => StorageType::NonDeduped,
            Self::Cache | Self::TmpCache => StorageType::SemiDeduped,
        }
    }

    /// Whether writes to this vdisk type are recorded in the transaction log.
    ///
    /// Temporary vdisks are rebuilt from scratch on restart, so logging
    /// their writes would only burn storage.
    pub fn tlog_support(&self) -> bool {
        matches!(self, Self::Boot | Self::Db)
    }

    /// Whether this vdisk type can fall back to a template cluster for
    /// blocks it has never written.
    pub fn template_support(&self) -> bool {
        matches!(self, Self::Boot | Self::Cache | Self::TmpCache)
    }
}

/// The immutable properties of a vdisk, fixed at creation time.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiskStaticConfig {
    pub block_size: u64,
    pub size: u64,
    #[serde(rename = "type")]
    pub vdisk_type: VdiskType,
    #[serde(default)]
    pub read_only: bool,
}

impl VdiskStaticConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidBlockSize(self.block_size));
        }
        if self.size < self.block_size {
            return Err(Error::InvalidSize {
                size: self.size,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    /// The number of addressable blocks (the last block may be partial).
    pub fn block_count(&self) -> u64 {
        self.size.div_ceil(self.block_size)
    }
}

/// The cluster references used by the NBD data path of a vdisk.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiskNbdConfig {
    pub storage_cluster_id: String,
    #[serde(default)]
    pub template_cluster_id: Option<String>,
    #[serde(default)]
    pub tlog_cluster_id: Option<String>,
}

/// The cluster reference used by the tlog data path of a vdisk.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiskTlogConfig {
    pub storage_cluster_id: String,
}

/// The liveness state of a single storage server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Reachable; reads and writes proceed.
    #[default]
    Online,
    /// Temporarily unreachable; reads may fall back to a template, writes
    /// fail fast.
    Offline,
    /// Being migrated elsewhere by an operator; still serves traffic.
    Respread,
    /// Permanently gone. Data on this server is considered lost: reads
    /// resolve to the zero block and writes are rejected.
    Rip,
}

/// Address, database index, and state of one storage server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageServerConfig {
    pub address: SocketAddr,
    #[serde(default)]
    pub database: u16,
    #[serde(default)]
    pub state: ServerState,
}

impl StorageServerConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            database: 0,
            state: ServerState::Online,
        }
    }
}

/// An ordered list of storage servers.
///
/// The order is load-bearing: block indices are mapped to servers by
/// position, so a cluster bound to a vdisk must never change length.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterConfig {
    pub servers: Vec<StorageServerConfig>,
}

impl StorageClusterConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::EmptyCluster);
        }
        Ok(())
    }
}
