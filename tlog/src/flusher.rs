//! Assembly and shipment of aggregations.
//!
//! The [Flusher] owns the hash-chain state of one vdisk: every flush seals
//! the pending blocks into an [Aggregation] whose `prev` is the digest of
//! the previously shipped object, shards the sealed bytes, and ships them.
//! Shipping failures are retried with exponential backoff; once the budget
//! is exhausted the flusher reports a fatal error and the vdisk must be
//! taken offline.

use crate::{
    erasure,
    seal::{self, Compression, Key},
    store::ObjectStore,
    wire::Block,
    Coding, Digest, Error, ZERO_DIGEST,
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    varint::UInt, Decode, Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write,
};
use commonware_cryptography::{blake3::Blake3, Hasher};
use commonware_runtime::Clock;
use std::time::Duration;
use tracing::{debug, warn};

/// Shipping attempts per aggregation.
const SHIP_ATTEMPTS: usize = 5;

/// Backoff after the first failed attempt (doubles each retry).
const SHIP_BACKOFF: Duration = Duration::from_millis(100);

/// A batch of tlog blocks, chained to its predecessor by `prev`.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregation {
    pub vdisk: String,
    pub timestamp: u64,
    pub prev: Digest,
    pub blocks: Vec<Block>,
}

/// Decode limits for untrusted aggregations.
#[derive(Clone)]
pub struct AggregationCfg {
    pub max_blocks: usize,
    pub max_block_size: usize,
}

impl Aggregation {
    /// The digest of the serialized (pre-seal) form; it seeds the
    /// encryption nonce.
    pub fn digest(&self) -> Digest {
        Blake3::hash(&self.encode())
    }

    /// The sequences recorded in this aggregation, in order.
    pub fn sequences(&self) -> Vec<u64> {
        self.blocks.iter().map(|block| block.sequence).collect()
    }
}

impl Write for Aggregation {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.vdisk.len() as u64).write(buf);
        buf.put_slice(self.vdisk.as_bytes());
        self.timestamp.write(buf);
        self.prev.write(buf);
        UInt(self.blocks.len() as u64).write(buf);
        for block in &self.blocks {
            block.write(buf);
        }
    }
}

impl EncodeSize for Aggregation {
    fn encode_size(&self) -> usize {
        let blocks: usize = self.blocks.iter().map(|block| block.encode_size()).sum();
        UInt(self.vdisk.len() as u64).encode_size()
            + self.vdisk.len()
            + self.timestamp.encode_size()
            + self.prev.encode_size()
            + UInt(self.blocks.len() as u64).encode_size()
            + blocks
    }
}

impl Read for Aggregation {
    type Cfg = AggregationCfg;

    fn read_cfg(buf: &mut impl Buf, cfg: &Self::Cfg) -> Result<Self, CodecError> {
        let vdisk_len: u64 = UInt::<u64>::read(buf)?.into();
        let vdisk_len = vdisk_len as usize;
        if vdisk_len > 256 || buf.remaining() < vdisk_len {
            return Err(CodecError::InvalidLength(vdisk_len));
        }
        let vdisk = String::from_utf8(buf.copy_to_bytes(vdisk_len).to_vec())
            .map_err(|_| CodecError::Invalid("tlog::Aggregation", "not valid utf-8"))?;
        let timestamp = u64::read(buf)?;
        let prev = Digest::read(buf)?;
        let count: u64 = UInt::<u64>::read(buf)?.into();
        let count = count as usize;
        if count > cfg.max_blocks {
            return Err(CodecError::InvalidLength(count));
        }
        let block_cfg: RangeCfg<usize> = (..=cfg.max_block_size).into();
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(Block::read_cfg(buf, &block_cfg)?);
        }
        Ok(Self {
            vdisk,
            timestamp,
            prev,
            blocks,
        })
    }
}

/// Seals, shards, and ships aggregations for one vdisk, maintaining the
/// hash chain.
pub struct Flusher<E: Clock, S: ObjectStore> {
    context: E,
    vdisk: String,
    key: Key,
    compression: Compression,
    coding: Coding,
    store: S,
    prev: Digest,
}

impl<E: Clock, S: ObjectStore> Flusher<E, S> {
    pub fn new(
        context: E,
        vdisk: &str,
        key: Key,
        compression: Compression,
        coding: Coding,
        store: S,
    ) -> Self {
        Self {
            context,
            vdisk: vdisk.to_string(),
            key,
            compression,
            coding,
            store,
            prev: ZERO_DIGEST,
        }
    }

    /// The digest of the last shipped aggregation (the chain head).
    pub fn head(&self) -> Digest {
        self.prev
    }

    /// Ships `blocks` as one aggregation. Returns the acknowledged
    /// sequences.
    pub async fn flush(&mut self, timestamp: u64, blocks: Vec<Block>) -> Result<Vec<u64>, Error> {
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        let aggregation = Aggregation {
            vdisk: self.vdisk.clone(),
            timestamp,
            prev: self.prev,
            blocks,
        };
        let sequences = aggregation.sequences();

        let serialized = aggregation.encode();
        let digest = Blake3::hash(&serialized);
        let sealed = seal::seal(&self.key, self.compression, &digest, &serialized)?;
        // The object key doubles as the next aggregation's `prev`.
        let object = Blake3::hash(&sealed);
        let shards = erasure::shard(self.coding, &sealed)?;

        let mut backoff = SHIP_BACKOFF;
        for attempt in 1..=SHIP_ATTEMPTS {
            match self.store.put(object, shards.clone()).await {
                Ok(()) => {
                    debug!(
                        vdisk = %self.vdisk,
                        blocks = sequences.len(),
                        object = ?object,
                        "shipped aggregation"
                    );
                    self.prev = object;
                    return Ok(sequences);
                }
                Err(err) if attempt < SHIP_ATTEMPTS => {
                    warn!(vdisk = %self.vdisk, attempt, ?err, "shipping failed, backing off");
                    self.context.sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    warn!(vdisk = %self.vdisk, ?err, "shipping failed, giving up");
                    return Err(Error::RetriesExhausted(SHIP_ATTEMPTS));
                }
            }
        }
        unreachable!("loop returns on success or final failure");
    }

    /// Fetches and opens the aggregation stored under `object` (used by
    /// replay and the test suites).
    pub async fn fetch(&self, object: Digest, cfg: &AggregationCfg) -> Result<Aggregation, Error> {
        let shards = self.store.get(object, self.coding.total()).await?;
        let sealed = erasure::reconstruct(self.coding, shards)
            .map_err(|_| Error::ObjectCorrupt(object))?;
        if Blake3::hash(&sealed) != object {
            return Err(Error::ObjectCorrupt(object));
        }
        let serialized = seal::unseal(&self.key, &sealed)?;
        Ok(Aggregation::decode_cfg(serialized, cfg)?)
    }
}

/// The shared batching loop: accumulates blocks from `queue` until
/// `flush_size` is reached or `flush_time` has passed since the first
/// pending block, then ships the batch and reports the outcome through
/// `on_flush`. Runs until the queue closes (one final flush) or `on_flush`
/// returns false.
pub(crate) async fn batch<E, S, F>(
    context: E,
    flush_size: usize,
    flush_time: Duration,
    mut flusher: Flusher<E, S>,
    mut queue: futures::channel::mpsc::Receiver<Block>,
    accepted: prometheus_client::metrics::counter::Counter,
    mut on_flush: F,
) where
    E: Clock,
    S: ObjectStore,
    F: FnMut(Result<Vec<u64>, Error>) -> bool,
{
    use commonware_macros::select;
    use commonware_utils::SystemTimeExt;
    use futures::StreamExt;

    let mut pending: Vec<Block> = Vec::new();
    let mut deadline: Option<std::time::SystemTime> = None;
    loop {
        // Without a pending block there is no deadline to race.
        let timeout = {
            let context = context.clone();
            async move {
                match deadline {
                    Some(at) => context.sleep_until(at).await,
                    None => futures::future::pending().await,
                }
            }
        };

        select! {
            block = queue.next() => {
                match block {
                    Some(block) => {
                        accepted.inc();
                        if pending.is_empty() {
                            deadline = Some(context.current() + flush_time);
                        }
                        pending.push(block);
                        if pending.len() >= flush_size {
                            let blocks = std::mem::take(&mut pending);
                            let timestamp = context.current().epoch_millis();
                            if !on_flush(flusher.flush(timestamp, blocks).await) {
                                return;
                            }
                            deadline = None;
                        }
                    }
                    None => {
                        // Producers are gone: one final attempt, then stop.
                        debug!("tlog batcher closing");
                        if !pending.is_empty() {
                            let blocks = std::mem::take(&mut pending);
                            let timestamp = context.current().epoch_millis();
                            on_flush(flusher.flush(timestamp, blocks).await);
                        }
                        return;
                    }
                }
            },
            _ = timeout => {
                if !pending.is_empty() {
                    let blocks = std::mem::take(&mut pending);
                    let timestamp = context.current().epoch_millis();
                    if !on_flush(flusher.flush(timestamp, blocks).await) {
                        return;
                    }
                }
                deadline = None;
            },
        }
    }
}
