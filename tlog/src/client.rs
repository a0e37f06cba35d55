//! The in-process tlog client pipeline.
//!
//! A [Writer] hands blocks to a per-vdisk pipeline task over a bounded
//! queue (a full queue blocks the writer, which is the backpressure the
//! NBD frontend needs). The pipeline batches blocks into aggregations of
//! up to `flush_size`, or whatever accumulated when `flush_time` passes
//! since the first pending block, and ships them through a [Flusher].
//!
//! Every shipped aggregation is announced as an [Event::Flushed] carrying
//! its sequences, in aggregation order. A shipping failure that survives
//! the retry budget is announced as [Event::Fatal]; the pipeline stops and
//! the vdisk must be taken offline.

use crate::{
    flusher::Flusher,
    seal::{Compression, Key},
    store::ObjectStore,
    wire::{Block, Operation},
    Coding, Error, DEFAULT_FLUSH_SIZE, DEFAULT_FLUSH_TIME,
};
use bytes::Bytes;
use commonware_cryptography::{blake3::Blake3, Hasher};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use commonware_utils::SystemTimeExt;
use futures::{channel::mpsc, SinkExt};
use prometheus_client::metrics::counter::Counter;
use std::time::Duration;
use tracing::error;

/// Configuration of one vdisk's pipeline.
pub struct Config<S: ObjectStore> {
    pub vdisk: String,
    pub key: Key,
    pub compression: Compression,
    pub coding: Coding,
    pub flush_size: usize,
    pub flush_time: Duration,
    pub store: S,
}

impl<S: ObjectStore> Config<S> {
    /// A config with the default batching, compression, and coding shape.
    pub fn new(vdisk: &str, key: Key, store: S) -> Self {
        Self {
            vdisk: vdisk.to_string(),
            key,
            compression: Compression::default(),
            coding: Coding::default(),
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_time: DEFAULT_FLUSH_TIME,
            store,
        }
    }
}

/// Pipeline notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// An aggregation became durable; these sequences are safe.
    Flushed { sequences: Vec<u64> },
    /// The pipeline is dead and the vdisk must go offline.
    Fatal { reason: String },
}

/// The write half of a pipeline. Assigns sequences and computes content
/// hashes; dropping it flushes whatever is pending and stops the pipeline.
pub struct Writer<E: Clock> {
    context: E,
    vdisk: String,
    sender: mpsc::Sender<Block>,
    next_sequence: u64,
}

impl<E: Clock> Writer<E> {
    /// Records one write. Blocks while the pipeline is backed up. Returns
    /// the sequence assigned to the block.
    pub async fn record(
        &mut self,
        operation: Operation,
        lba: u64,
        data: Bytes,
    ) -> Result<u64, Error> {
        let sequence = self.next_sequence;
        let block = Block {
            vdisk: self.vdisk.clone(),
            sequence,
            lba,
            size: data.len() as u64,
            hash: Blake3::hash(&data),
            data,
            timestamp: self.context.current().epoch_millis(),
            operation,
        };
        self.sender
            .send(block)
            .await
            .map_err(|_| Error::PipelineClosed)?;
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// The sequence the next [Writer::record] will be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Starts the pipeline of one vdisk.
pub fn init<E: Spawner + Clock + Metrics, S: ObjectStore>(
    context: E,
    config: Config<S>,
) -> (Writer<E>, mpsc::UnboundedReceiver<Event>, Handle<()>) {
    let blocks_recorded = Counter::default();
    context.register(
        "tlog_blocks",
        "number of blocks accepted by the tlog pipeline",
        blocks_recorded.clone(),
    );
    let aggregations_shipped = Counter::default();
    context.register(
        "tlog_aggregations",
        "number of aggregations shipped",
        aggregations_shipped.clone(),
    );

    let (block_tx, block_rx) = mpsc::channel(config.flush_size * 2);
    let (event_tx, event_rx) = mpsc::unbounded();
    let flusher = Flusher::new(
        context.clone(),
        &config.vdisk,
        config.key.clone(),
        config.compression,
        config.coding,
        config.store.clone(),
    );

    let writer = Writer {
        context: context.clone(),
        vdisk: config.vdisk.clone(),
        sender: block_tx,
        next_sequence: 1,
    };
    let handle = context.with_label("tlog").spawn(move |context| {
        run(
            context,
            config.flush_size,
            config.flush_time,
            flusher,
            block_rx,
            event_tx,
            blocks_recorded,
            aggregations_shipped,
        )
    });
    (writer, event_rx, handle)
}

async fn run<E: Spawner + Clock + Metrics, S: ObjectStore>(
    context: E,
    flush_size: usize,
    flush_time: Duration,
    flusher: Flusher<E, S>,
    blocks: mpsc::Receiver<Block>,
    events: mpsc::UnboundedSender<Event>,
    blocks_recorded: Counter,
    aggregations_shipped: Counter,
) {
    crate::flusher::batch(
        context,
        flush_size,
        flush_time,
        flusher,
        blocks,
        blocks_recorded,
        move |outcome| match outcome {
            Ok(sequences) => {
                aggregations_shipped.inc();
                let _ = events.unbounded_send(Event::Flushed { sequences });
                true
            }
            Err(err) => {
                error!(?err, "tlog pipeline failed");
                let _ = events.unbounded_send(Event::Fatal {
                    reason: err.to_string(),
                });
                false
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use commonware_runtime::{deterministic, Runner};
    use futures::StreamExt;

    fn config(store: MemStore, flush_size: usize, flush_time: Duration) -> Config<MemStore> {
        let mut config = Config::new("disk1", Key::new([3u8; 32]), store);
        config.coding = Coding::new(2, 1);
        config.flush_size = flush_size;
        config.flush_time = flush_time;
        config
    }

    #[test]
    fn test_flush_on_size() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            let (mut writer, mut events, handle) = init(
                context.clone(),
                config(store.clone(), 3, Duration::from_secs(60)),
            );

            for lba in 0u64..6 {
                let sequence = writer
                    .record(Operation::Set, lba, Bytes::from(vec![lba as u8; 8]))
                    .await
                    .unwrap();
                assert_eq!(sequence, lba + 1);
            }

            // Two aggregations, announced in order.
            assert_eq!(
                events.next().await.unwrap(),
                Event::Flushed {
                    sequences: vec![1, 2, 3]
                }
            );
            assert_eq!(
                events.next().await.unwrap(),
                Event::Flushed {
                    sequences: vec![4, 5, 6]
                }
            );
            assert_eq!(store.len(), 2);

            drop(writer);
            handle.await.unwrap();
        });
    }

    #[test]
    fn test_flush_on_time() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            let (mut writer, mut events, handle) = init(
                context.clone(),
                config(store.clone(), 25, Duration::from_secs(5)),
            );

            writer
                .record(Operation::Set, 0, Bytes::from_static(&[1u8; 8]))
                .await
                .unwrap();
            writer
                .record(Operation::Delete, 1, Bytes::new())
                .await
                .unwrap();

            // Nothing fills the batch; the timer flushes it.
            context.sleep(Duration::from_secs(6)).await;
            assert_eq!(
                events.next().await.unwrap(),
                Event::Flushed {
                    sequences: vec![1, 2]
                }
            );

            drop(writer);
            handle.await.unwrap();
        });
    }

    #[test]
    fn test_final_flush_on_close() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            let (mut writer, mut events, handle) = init(
                context.clone(),
                config(store.clone(), 25, Duration::from_secs(60)),
            );

            writer
                .record(Operation::Set, 7, Bytes::from_static(&[2u8; 8]))
                .await
                .unwrap();
            drop(writer);
            handle.await.unwrap();

            // The pending block was shipped on the way out.
            assert_eq!(
                events.next().await.unwrap(),
                Event::Flushed {
                    sequences: vec![1]
                }
            );
            assert_eq!(store.len(), 1);
        });
    }

    #[test]
    fn test_sequences_are_monotonic_across_aggregations() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            let (mut writer, mut events, handle) = init(
                context.clone(),
                config(store.clone(), 2, Duration::from_secs(60)),
            );

            for lba in 0u64..8 {
                writer
                    .record(Operation::Set, lba, Bytes::from(vec![lba as u8; 4]))
                    .await
                    .unwrap();
            }
            drop(writer);
            handle.await.unwrap();

            let mut seen = Vec::new();
            while let Some(event) = events.next().await {
                let Event::Flushed { sequences } = event else {
                    panic!("unexpected event: {event:?}");
                };
                seen.extend(sequences);
            }
            assert_eq!(seen, (1..=8).collect::<Vec<u64>>());
        });
    }
}
