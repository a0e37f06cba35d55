//! Client plumbing for ardb storage clusters.
//!
//! An ardb cluster is an ordered list of Redis-wire-protocol servers that
//! together hold the blocks of one or more vdisks. This crate provides the
//! layers between a storage engine and those servers:
//!
//! - [resp]: encoding of commands and incremental decoding of replies.
//! - [Connection]: one client connection over a runtime sink/stream pair.
//! - [Pool]/[Pools]: process-wide, refcounted, bounded connection pools.
//! - [cluster::Controller]: maps block indices to servers, tracks
//!   per-server state, and follows cluster reconfiguration at runtime.
//! - [mem::MemoryArdb]: an in-memory backend for tests.
//!
//! Nothing in this crate knows what a block is; it moves opaque bytes keyed
//! the way the storage engines decide.

use thiserror::Error as ThisError;

pub mod cluster;
mod connection;
pub mod mem;
mod pool;
pub mod resp;

pub use cluster::{Controller, Server, StatusEvent, StatusKind};
pub use connection::Connection;
pub use pool::{Pool, Pools};

/// Errors surfaced by cluster operations.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("config error: {0}")]
    Config(#[from] vdisk_config::Error),
    #[error("malformed reply: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Reply(String),
    #[error("unexpected reply type")]
    UnexpectedReply,
    /// The server cannot take this operation right now (offline, or a
    /// transient failure that survived the retry budget).
    #[error("server unavailable")]
    ServerUnavailable,
    /// The server is gone for good; data it held is considered lost.
    #[error("server retired")]
    ServerRetired,
    #[error("server index {0} out of bounds")]
    InvalidServerIndex(usize),
}
