//! An in-memory cache of recently written block content.
//!
//! Keyed by content hash, bounded, with a time-to-live. The deduped engine
//! uses it to coalesce duplicate writes of the same content within a short
//! window: content whose hash is still cached is already in the backend, so
//! the write collapses to an LBA update.
//!
//! Evictions (capacity, expiry, and purge) run a caller-supplied callback
//! synchronously. A janitor task forces expiry at the cleanup interval, so
//! stale entries disappear even when nothing touches the cache.

use crate::BlockHash;
use bytes::Bytes;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// How long an entry stays valid.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(10);

/// How often the janitor forces expiry.
pub const DEFAULT_CLEANUP: Duration = Duration::from_secs(5);

/// Entries kept before the least recently used one is evicted.
pub const DEFAULT_CAPACITY: usize = 100;

/// Invoked synchronously for every entry leaving the cache.
pub type EvictFn = Box<dyn Fn(BlockHash, Bytes) + Send + 'static>;

struct Entry {
    data: Bytes,
    expires: SystemTime,
}

struct Inner {
    entries: HashMap<BlockHash, Entry>,
    /// LRU order; front is the next eviction candidate.
    order: VecDeque<BlockHash>,
    capacity: usize,
    evict: Option<EvictFn>,
}

impl Inner {
    fn remove(&mut self, hash: &BlockHash) -> Option<Bytes> {
        let entry = self.entries.remove(hash)?;
        if let Some(position) = self.order.iter().position(|key| key == hash) {
            self.order.remove(position);
        }
        Some(entry.data)
    }

    fn evict(&mut self, hash: BlockHash) {
        if let Some(data) = self.remove(&hash) {
            if let Some(callback) = &self.evict {
                callback(hash, data);
            }
        }
    }

    fn sweep(&mut self, now: SystemTime) {
        let expired: Vec<BlockHash> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.evict(hash);
        }
    }
}

/// A bounded LRU of block content with a TTL and an eviction callback.
pub struct WriteCache<E: Spawner + Clock + Metrics> {
    context: E,
    expiration: Duration,
    inner: Arc<Mutex<Inner>>,
    janitor: Handle<()>,
}

impl<E: Spawner + Clock + Metrics> WriteCache<E> {
    /// Builds a cache with the default expiration, cleanup interval, and
    /// capacity.
    pub fn init(context: E, evict: Option<EvictFn>) -> Self {
        Self::with_config(
            context,
            DEFAULT_EXPIRATION,
            DEFAULT_CLEANUP,
            DEFAULT_CAPACITY,
            evict,
        )
    }

    pub fn with_config(
        context: E,
        expiration: Duration,
        cleanup: Duration,
        capacity: usize,
        evict: Option<EvictFn>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            evict,
        }));

        // Expired entries must go even if nothing touches the cache again.
        let cleanup = cleanup.min(expiration);
        let janitor = context.with_label("janitor").spawn({
            let inner = inner.clone();
            move |context| async move {
                loop {
                    context.sleep(cleanup).await;
                    inner.lock().unwrap().sweep(context.current());
                }
            }
        });

        Self {
            context,
            expiration,
            inner,
            janitor,
        }
    }

    /// Caches `data` under its content hash. May synchronously evict the
    /// least recently used entries through the callback.
    pub fn set(&self, hash: BlockHash, data: Bytes) {
        let expires = self.context.current() + self.expiration;
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.insert(hash, Entry { data, expires }).is_none() {
            inner.order.push_back(hash);
        } else if let Some(position) = inner.order.iter().position(|key| *key == hash) {
            inner.order.remove(position);
            inner.order.push_back(hash);
        }
        while inner.entries.len() > inner.capacity {
            let Some(victim) = inner.order.front().copied() else {
                break;
            };
            inner.evict(victim);
        }
    }

    /// Returns the cached content for `hash`, if still valid.
    pub fn get(&self, hash: &BlockHash) -> Option<Bytes> {
        let now = self.context.current();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(hash)?;
        if entry.expires <= now {
            inner.evict(*hash);
            return None;
        }
        let data = entry.data.clone();
        if let Some(position) = inner.order.iter().position(|key| key == hash) {
            inner.order.remove(position);
            inner.order.push_back(*hash);
        }
        Some(data)
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts everything, running the callback for each entry.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(victim) = inner.order.front().copied() {
            inner.evict(victim);
        }
    }

    /// Stops the janitor and purges the cache.
    pub fn close(&self) {
        self.janitor.abort();
        self.flush();
    }
}
