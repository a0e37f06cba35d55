//! The tlog server.
//!
//! Listens on TCP for the framed [wire] protocol. A connection handshakes
//! once (version and vdisk checks), then streams blocks; the server
//! verifies each block's hash, feeds it to the vdisk's flusher, and
//! acknowledges twice: `RecvOk` on ingest and `FlushOk` once the
//! aggregation holding it is durable.
//!
//! Per-vdisk state lives in a process-wide [Registry], created at startup
//! and handed to the server (there is no global). The first successful
//! handshake for a vdisk creates its slot and flusher; reconnects reattach
//! to the existing slot, and their `first_sequence` lets the server
//! acknowledge already-durable sequences without re-persisting them.

use crate::{
    flusher::{self, Flusher},
    seal::{Compression, Key},
    store::ObjectStore,
    wire::{
        self, Block, BlockStatus, HandshakeRequest, HandshakeResponse, HandshakeStatus, Response,
    },
    Coding, Error, DEFAULT_FLUSH_SIZE, DEFAULT_FLUSH_TIME,
};
use commonware_codec::Decode;
use commonware_runtime::{
    Clock, Handle, Listener, Metrics, Network, SinkOf, Spawner, StreamOf,
};
use futures::{channel::mpsc, SinkExt, StreamExt};
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

/// Settings shared by every flusher the registry spawns.
pub struct RegistryConfig<S: ObjectStore> {
    pub key: Key,
    pub compression: Compression,
    pub coding: Coding,
    pub flush_size: usize,
    pub flush_time: Duration,
    pub store: S,
}

impl<S: ObjectStore> RegistryConfig<S> {
    pub fn new(key: Key, store: S) -> Self {
        Self {
            key,
            compression: Compression::default(),
            coding: Coding::default(),
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_time: DEFAULT_FLUSH_TIME,
            store,
        }
    }
}

#[derive(Clone)]
struct Slot {
    ingest: mpsc::Sender<Block>,
    /// The response subscriber of the currently attached connection.
    responses: Arc<Mutex<Option<mpsc::UnboundedSender<Response>>>>,
    last_durable: Arc<AtomicU64>,
    last_received: Arc<AtomicU64>,
    /// Set when the flusher died; the vdisk needs operator attention.
    dead: Arc<AtomicBool>,
}

/// What a connection gets out of a successful handshake.
struct Attachment {
    ingest: mpsc::Sender<Block>,
    response_tx: mpsc::UnboundedSender<Response>,
    response_rx: mpsc::UnboundedReceiver<Response>,
    last_durable: Arc<AtomicU64>,
    last_received: Arc<AtomicU64>,
}

/// The process-wide owner of per-vdisk tlog state.
pub struct Registry<E: Spawner + Clock + Metrics, S: ObjectStore> {
    context: E,
    key: Key,
    compression: Compression,
    coding: Coding,
    flush_size: usize,
    flush_time: Duration,
    store: S,
    accepted: Counter,
    flushed: Counter,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl<E: Spawner + Clock + Metrics, S: ObjectStore> Clone for Registry<E, S> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            key: self.key.clone(),
            compression: self.compression,
            coding: self.coding,
            flush_size: self.flush_size,
            flush_time: self.flush_time,
            store: self.store.clone(),
            accepted: self.accepted.clone(),
            flushed: self.flushed.clone(),
            slots: self.slots.clone(),
        }
    }
}

impl<E: Spawner + Clock + Metrics, S: ObjectStore> Registry<E, S> {
    pub fn new(context: E, config: RegistryConfig<S>) -> Self {
        let accepted = Counter::default();
        context.register(
            "tlog_blocks",
            "number of blocks accepted into aggregations",
            accepted.clone(),
        );
        let flushed = Counter::default();
        context.register(
            "tlog_flushes",
            "number of aggregations made durable",
            flushed.clone(),
        );
        Self {
            context,
            key: config.key,
            compression: config.compression,
            coding: config.coding,
            flush_size: config.flush_size,
            flush_time: config.flush_time,
            store: config.store,
            accepted,
            flushed,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The highest durable sequence of a vdisk (zero if none).
    pub fn last_durable(&self, vdisk: &str) -> u64 {
        self.slots
            .lock()
            .unwrap()
            .get(vdisk)
            .map_or(0, |slot| slot.last_durable.load(Ordering::Relaxed))
    }

    fn attach(&self, vdisk: &str, first_sequence: u64) -> Result<Attachment, Error> {
        let mut slots = self.slots.lock().unwrap();
        let slot = match slots.get(vdisk) {
            Some(slot) if slot.dead.load(Ordering::Relaxed) => {
                return Err(Error::PipelineClosed);
            }
            Some(slot) => slot.clone(),
            None => {
                info!(vdisk, "creating vdisk slot");
                let slot = self.spawn_flusher(vdisk);
                slots.insert(vdisk.to_string(), slot.clone());
                slot
            }
        };

        // The newest connection takes over the response stream; a stale
        // connection's responder dies with its channel.
        let (response_tx, response_rx) = mpsc::unbounded();
        *slot.responses.lock().unwrap() = Some(response_tx.clone());
        slot.last_received
            .store(first_sequence.saturating_sub(1), Ordering::Relaxed);
        Ok(Attachment {
            ingest: slot.ingest.clone(),
            response_tx,
            response_rx,
            last_durable: slot.last_durable.clone(),
            last_received: slot.last_received.clone(),
        })
    }

    fn spawn_flusher(&self, vdisk: &str) -> Slot {
        let (ingest_tx, ingest_rx) = mpsc::channel(self.flush_size * 2);
        let slot = Slot {
            ingest: ingest_tx,
            responses: Arc::new(Mutex::new(None)),
            last_durable: Arc::new(AtomicU64::new(0)),
            last_received: Arc::new(AtomicU64::new(0)),
            dead: Arc::new(AtomicBool::new(false)),
        };
        let flusher = Flusher::new(
            self.context.clone(),
            vdisk,
            self.key.clone(),
            self.compression,
            self.coding,
            self.store.clone(),
        );

        let responses = slot.responses.clone();
        let last_durable = slot.last_durable.clone();
        let dead = slot.dead.clone();
        let flushed = self.flushed.clone();
        let accepted = self.accepted.clone();
        let flush_size = self.flush_size;
        let flush_time = self.flush_time;
        let vdisk = vdisk.to_string();
        self.context.with_label("flusher").spawn(move |context| {
            flusher::batch(
                context,
                flush_size,
                flush_time,
                flusher,
                ingest_rx,
                accepted,
                move |outcome| match outcome {
                    Ok(sequences) => {
                        flushed.inc();
                        if let Some(max) = sequences.last() {
                            last_durable.store(*max, Ordering::Relaxed);
                        }
                        send_response(
                            &responses,
                            Response {
                                status: BlockStatus::FlushOk,
                                sequences,
                            },
                        );
                        true
                    }
                    Err(err) => {
                        warn!(vdisk = %vdisk, ?err, "flusher failed, taking vdisk offline");
                        dead.store(true, Ordering::Relaxed);
                        send_response(
                            &responses,
                            Response {
                                status: BlockStatus::FlushFailed,
                                sequences: Vec::new(),
                            },
                        );
                        false
                    }
                },
            )
        });
        slot
    }
}

fn send_response(
    responses: &Arc<Mutex<Option<mpsc::UnboundedSender<Response>>>>,
    response: Response,
) {
    let responses = responses.lock().unwrap();
    if let Some(sender) = responses.as_ref() {
        let _ = sender.unbounded_send(response);
    }
}

/// Server configuration.
pub struct Config {
    pub address: SocketAddr,
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: ([0, 0, 0, 0], 11211).into(),
            max_message_size: wire::MAX_MESSAGE_SIZE,
        }
    }
}

/// The TCP front of the transaction log.
pub struct Server<E: Spawner + Clock + Network + Metrics, S: ObjectStore> {
    context: E,
    registry: Registry<E, S>,
    address: SocketAddr,
    max_message_size: usize,

    connections: Counter,
    blocks: Counter,
    hash_failures: Counter,
}

impl<E: Spawner + Clock + Network + Metrics, S: ObjectStore> Server<E, S> {
    pub fn new(context: E, registry: Registry<E, S>, config: Config) -> Self {
        let connections = Counter::default();
        context.register(
            "connections",
            "number of accepted tlog connections",
            connections.clone(),
        );
        let blocks = Counter::default();
        context.register(
            "blocks_received",
            "number of blocks received and verified",
            blocks.clone(),
        );
        let hash_failures = Counter::default();
        context.register(
            "hash_failures",
            "number of blocks rejected for a bad hash",
            hash_failures.clone(),
        );
        Self {
            context,
            registry,
            address: config.address,
            max_message_size: config.max_message_size,
            connections,
            blocks,
            hash_failures,
        }
    }

    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(self) {
        let mut listener = match self.context.bind(self.address).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(address = %self.address, ?err, "failed to bind");
                return;
            }
        };
        info!(address = %self.address, "tlog server listening");

        loop {
            let Ok((peer, sink, stream)) = listener.accept().await else {
                return;
            };
            debug!(%peer, "accepted connection");
            self.connections.inc();
            let registry = self.registry.clone();
            let blocks = self.blocks.clone();
            let hash_failures = self.hash_failures.clone();
            let max_message_size = self.max_message_size;
            self.context.with_label("connection").spawn(move |context| {
                handle_connection(
                    context,
                    registry,
                    max_message_size,
                    blocks,
                    hash_failures,
                    sink,
                    stream,
                )
            });
        }
    }
}

async fn handle_connection<E: Spawner + Clock + Network + Metrics, S: ObjectStore>(
    context: E,
    registry: Registry<E, S>,
    max_message_size: usize,
    blocks: Counter,
    hash_failures: Counter,
    mut sink: SinkOf<E>,
    mut stream: StreamOf<E>,
) {
    // Handshake. Whatever happens, the client gets a status.
    let request = match wire::recv_msg::<_, HandshakeRequest>(&mut stream, max_message_size).await
    {
        Ok(request) => request,
        Err(err) => {
            debug!(?err, "handshake not decodable");
            respond_handshake(&mut sink, HandshakeStatus::InvalidRequest, max_message_size).await;
            return;
        }
    };
    if request.version < wire::MIN_VERSION {
        debug!(version = request.version, "unsupported client version");
        respond_handshake(&mut sink, HandshakeStatus::InvalidVersion, max_message_size).await;
        return;
    }
    if request.vdisk.is_empty() {
        respond_handshake(&mut sink, HandshakeStatus::InvalidVdisk, max_message_size).await;
        return;
    }
    let attachment = match registry.attach(&request.vdisk, request.first_sequence) {
        Ok(attachment) => attachment,
        Err(err) => {
            debug!(vdisk = %request.vdisk, ?err, "unable to attach vdisk");
            respond_handshake(&mut sink, HandshakeStatus::Internal, max_message_size).await;
            return;
        }
    };
    respond_handshake(&mut sink, HandshakeStatus::Ok, max_message_size).await;
    debug!(
        vdisk = %request.vdisk,
        first_sequence = request.first_sequence,
        "handshake complete"
    );

    // The responder owns the sink; acknowledgements from this loop and
    // FlushOks from the flusher share one ordered stream.
    let mut response_rx = attachment.response_rx;
    context.with_label("responder").spawn(move |_| async move {
        while let Some(response) = response_rx.next().await {
            if wire::send_msg(&mut sink, &response, max_message_size)
                .await
                .is_err()
            {
                return;
            }
        }
    });

    let respond = attachment.response_tx;
    let mut ingest = attachment.ingest;
    let data_limit = (..=max_message_size).into();
    loop {
        let frame = match wire::recv_frame(&mut stream, max_message_size).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let block = match Block::decode_cfg(frame, &data_limit) {
            Ok(block) => block,
            Err(err) => {
                debug!(?err, "undecodable block");
                let _ = respond.unbounded_send(Response {
                    status: BlockStatus::RecvFailed,
                    sequences: Vec::new(),
                });
                break;
            }
        };
        if !block.verify() {
            hash_failures.inc();
            let _ = respond.unbounded_send(Response {
                status: BlockStatus::RecvFailed,
                sequences: vec![block.sequence],
            });
            break;
        }

        let sequence = block.sequence;
        if sequence <= attachment.last_durable.load(Ordering::Relaxed) {
            // A restarted client replaying history; it is already safe.
            let _ = respond.unbounded_send(Response {
                status: BlockStatus::FlushOk,
                sequences: vec![sequence],
            });
            continue;
        }
        if sequence <= attachment.last_received.load(Ordering::Relaxed) {
            debug!(sequence, "sequence out of order");
            let _ = respond.unbounded_send(Response {
                status: BlockStatus::RecvFailed,
                sequences: vec![sequence],
            });
            break;
        }
        attachment.last_received.store(sequence, Ordering::Relaxed);

        if ingest.send(block).await.is_err() {
            let _ = respond.unbounded_send(Response {
                status: BlockStatus::Disconnected,
                sequences: vec![sequence],
            });
            break;
        }
        blocks.inc();
        let _ = respond.unbounded_send(Response {
            status: BlockStatus::RecvOk,
            sequences: vec![sequence],
        });
    }
    debug!(vdisk = %request.vdisk, "connection closed");
}

async fn respond_handshake<Si: commonware_runtime::Sink>(
    sink: &mut Si,
    status: HandshakeStatus,
    max_message_size: usize,
) {
    let response = HandshakeResponse {
        version: wire::VERSION,
        status,
    };
    let _ = wire::send_msg(sink, &response, max_message_size).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use bytes::Bytes;
    use commonware_cryptography::{blake3::Blake3, Hasher};
    use commonware_runtime::{deterministic, Error as RuntimeError, Runner};
    use commonware_utils::SystemTimeExt as _;

    const ADDRESS: &str = "127.0.0.1:11211";

    fn start_server(
        context: &deterministic::Context,
        store: MemStore,
        flush_size: usize,
    ) -> Registry<deterministic::Context, MemStore> {
        let mut config = RegistryConfig::new(Key::new([9u8; 32]), store);
        config.coding = Coding::new(2, 1);
        config.flush_size = flush_size;
        config.flush_time = Duration::from_secs(60);
        let registry = Registry::new(context.with_label("registry"), config);
        let server = Server::new(
            context.with_label("server"),
            registry.clone(),
            Config {
                address: ADDRESS.parse().unwrap(),
                max_message_size: wire::MAX_MESSAGE_SIZE,
            },
        );
        server.start();
        registry
    }

    async fn dial(
        context: &deterministic::Context,
    ) -> (
        commonware_runtime::SinkOf<deterministic::Context>,
        commonware_runtime::StreamOf<deterministic::Context>,
    ) {
        loop {
            match context.dial(ADDRESS.parse().unwrap()).await {
                Ok(pair) => return pair,
                Err(RuntimeError::ConnectionFailed) => {
                    context.sleep(Duration::from_millis(1)).await;
                }
                Err(err) => panic!("unexpected dial error: {err:?}"),
            }
        }
    }

    async fn handshake(
        context: &deterministic::Context,
        version: u32,
        first_sequence: u64,
    ) -> (
        commonware_runtime::SinkOf<deterministic::Context>,
        commonware_runtime::StreamOf<deterministic::Context>,
        HandshakeResponse,
    ) {
        let (mut sink, mut stream) = dial(context).await;
        let request = HandshakeRequest {
            version,
            vdisk: "disk1".to_string(),
            first_sequence,
        };
        wire::send_msg(&mut sink, &request, wire::MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        let response: HandshakeResponse =
            wire::recv_msg(&mut stream, wire::MAX_MESSAGE_SIZE).await.unwrap();
        (sink, stream, response)
    }

    fn block(context: &deterministic::Context, sequence: u64) -> Block {
        let data = Bytes::from(vec![sequence as u8; 16]);
        Block {
            vdisk: "disk1".to_string(),
            sequence,
            lba: sequence,
            size: data.len() as u64,
            hash: Blake3::hash(&data),
            data,
            timestamp: context.current().epoch_millis(),
            operation: wire::Operation::Set,
        }
    }

    async fn recv_response(
        stream: &mut commonware_runtime::StreamOf<deterministic::Context>,
    ) -> Response {
        let frame = wire::recv_frame(stream, wire::MAX_MESSAGE_SIZE).await.unwrap();
        Response::decode_cfg(frame, &64).unwrap()
    }

    #[test]
    fn test_receive_and_flush() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            let registry = start_server(&context, store.clone(), 3);

            let (mut sink, mut stream, response) = handshake(&context, wire::VERSION, 1).await;
            assert_eq!(response.status, HandshakeStatus::Ok);

            for sequence in 1u64..=3 {
                wire::send_msg(
                    &mut sink,
                    &block(&context, sequence),
                    wire::MAX_MESSAGE_SIZE,
                )
                .await
                .unwrap();
            }

            // Three receive acks, then the durable ack for the whole
            // aggregation.
            let mut received = Vec::new();
            let mut flushed = Vec::new();
            while flushed.len() < 3 {
                let response = recv_response(&mut stream).await;
                match response.status {
                    BlockStatus::RecvOk => received.extend(response.sequences),
                    BlockStatus::FlushOk => flushed.extend(response.sequences),
                    other => panic!("unexpected status: {other:?}"),
                }
            }
            assert_eq!(received, vec![1, 2, 3]);
            assert_eq!(flushed, vec![1, 2, 3]);
            assert_eq!(store.len(), 1);
            assert_eq!(registry.last_durable("disk1"), 3);
        });
    }

    #[test]
    fn test_rejects_old_version() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            start_server(&context, store, 3);

            let (_sink, mut stream, response) =
                handshake(&context, wire::MIN_VERSION - 1, 1).await;
            assert_eq!(response.status, HandshakeStatus::InvalidVersion);

            // The server hangs up after the rejection.
            assert!(
                wire::recv_frame(&mut stream, wire::MAX_MESSAGE_SIZE)
                    .await
                    .is_err()
            );
        });
    }

    #[test]
    fn test_rejects_bad_hash() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            start_server(&context, store.clone(), 3);

            let (mut sink, mut stream, response) = handshake(&context, wire::VERSION, 1).await;
            assert_eq!(response.status, HandshakeStatus::Ok);

            let mut corrupt = block(&context, 1);
            corrupt.hash = Blake3::hash(b"not the data");
            wire::send_msg(&mut sink, &corrupt, wire::MAX_MESSAGE_SIZE)
                .await
                .unwrap();

            let response = recv_response(&mut stream).await;
            assert_eq!(response.status, BlockStatus::RecvFailed);
            assert_eq!(response.sequences, vec![1]);
            assert!(store.is_empty());
        });
    }

    #[test]
    fn test_reconnect_skips_durable_sequences() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            let registry = start_server(&context, store.clone(), 2);

            // First connection makes sequences 1..=2 durable.
            let (mut sink, mut stream, response) = handshake(&context, wire::VERSION, 1).await;
            assert_eq!(response.status, HandshakeStatus::Ok);
            for sequence in 1u64..=2 {
                wire::send_msg(
                    &mut sink,
                    &block(&context, sequence),
                    wire::MAX_MESSAGE_SIZE,
                )
                .await
                .unwrap();
            }
            let mut durable = Vec::new();
            while durable.len() < 2 {
                let response = recv_response(&mut stream).await;
                if response.status == BlockStatus::FlushOk {
                    durable.extend(response.sequences);
                }
            }
            drop((sink, stream));
            assert_eq!(registry.last_durable("disk1"), 2);

            // A restarted client replays from sequence 1: the replayed
            // blocks are acknowledged as already durable, new ones flow.
            let (mut sink, mut stream, response) = handshake(&context, wire::VERSION, 1).await;
            assert_eq!(response.status, HandshakeStatus::Ok);
            wire::send_msg(&mut sink, &block(&context, 1), wire::MAX_MESSAGE_SIZE)
                .await
                .unwrap();
            let response = recv_response(&mut stream).await;
            assert_eq!(response.status, BlockStatus::FlushOk);
            assert_eq!(response.sequences, vec![1]);
            assert_eq!(store.len(), 1);
        });
    }

    #[test]
    fn test_rejects_non_monotonic_sequence() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = MemStore::new();
            start_server(&context, store, 10);

            let (mut sink, mut stream, response) = handshake(&context, wire::VERSION, 1).await;
            assert_eq!(response.status, HandshakeStatus::Ok);

            wire::send_msg(&mut sink, &block(&context, 5), wire::MAX_MESSAGE_SIZE)
                .await
                .unwrap();
            let response = recv_response(&mut stream).await;
            assert_eq!(response.status, BlockStatus::RecvOk);

            // Going backwards is a protocol violation.
            wire::send_msg(&mut sink, &block(&context, 4), wire::MAX_MESSAGE_SIZE)
                .await
                .unwrap();
            let response = recv_response(&mut stream).await;
            assert_eq!(response.status, BlockStatus::RecvFailed);
        });
    }
}
