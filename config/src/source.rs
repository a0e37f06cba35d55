//! Configuration sources.
//!
//! A [Source] hands out YAML snapshots keyed by [Key] and, for sources that
//! support it, a watch stream of updated snapshots. Two sources are
//! provided: [FileSource] reads everything from a single YAML file (no
//! meaningful watch), and [MapSource] is an in-process key-value store with
//! working watches, shaped like an etcd client. [MapSource] doubles as the
//! stub used throughout the test suites.

use crate::{
    Error, StorageClusterConfig, StorageType, VdiskNbdConfig, VdiskStaticConfig, VdiskTlogConfig,
    VdiskType,
};
use bytes::Bytes;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// A typed configuration key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    VdiskStatic(String),
    VdiskNbd(String),
    VdiskTlog(String),
    ClusterStorage(String),
    ClusterTlog(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VdiskStatic(id) => write!(f, "vdisks/{id}/static"),
            Self::VdiskNbd(id) => write!(f, "vdisks/{id}/nbd"),
            Self::VdiskTlog(id) => write!(f, "vdisks/{id}/tlog"),
            Self::ClusterStorage(id) => write!(f, "clusters/{id}/storage"),
            Self::ClusterTlog(id) => write!(f, "clusters/{id}/tlog"),
        }
    }
}

/// A provider of configuration snapshots.
///
/// Watch streams deliver snapshots in the order they were emitted. A closed
/// stream means the source will never produce another snapshot for that key.
pub trait Source: Clone + Send + Sync + 'static {
    /// Returns the current snapshot for `key`.
    fn get(&self, key: &Key) -> Result<Bytes, Error>;

    /// Returns a stream of snapshots for `key`, starting with the next
    /// update (the current value is fetched with [Source::get]).
    fn watch(&self, key: &Key) -> mpsc::UnboundedReceiver<Bytes>;
}

/// Reads and validates the static config of a vdisk.
pub fn read_vdisk_static<S: Source>(source: &S, vdisk: &str) -> Result<VdiskStaticConfig, Error> {
    let raw = source.get(&Key::VdiskStatic(vdisk.to_string()))?;
    let config: VdiskStaticConfig = serde_yaml::from_slice(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Reads the NBD cluster references of a vdisk.
pub fn read_vdisk_nbd<S: Source>(source: &S, vdisk: &str) -> Result<VdiskNbdConfig, Error> {
    let raw = source.get(&Key::VdiskNbd(vdisk.to_string()))?;
    Ok(serde_yaml::from_slice(&raw)?)
}

/// Reads the tlog cluster reference of a vdisk.
pub fn read_vdisk_tlog<S: Source>(source: &S, vdisk: &str) -> Result<VdiskTlogConfig, Error> {
    let raw = source.get(&Key::VdiskTlog(vdisk.to_string()))?;
    Ok(serde_yaml::from_slice(&raw)?)
}

/// Parses and validates a raw storage cluster snapshot (as delivered by a
/// watch stream).
pub fn parse_storage_cluster(raw: &[u8]) -> Result<StorageClusterConfig, Error> {
    let config: StorageClusterConfig = serde_yaml::from_slice(raw)?;
    config.validate()?;
    Ok(config)
}

/// Reads and validates a storage cluster document.
pub fn read_storage_cluster<S: Source>(
    source: &S,
    cluster: &str,
) -> Result<StorageClusterConfig, Error> {
    let raw = source.get(&Key::ClusterStorage(cluster.to_string()))?;
    let config: StorageClusterConfig = serde_yaml::from_slice(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Reads and validates a tlog cluster document.
pub fn read_tlog_cluster<S: Source>(
    source: &S,
    cluster: &str,
) -> Result<StorageClusterConfig, Error> {
    let raw = source.get(&Key::ClusterTlog(cluster.to_string()))?;
    let config: StorageClusterConfig = serde_yaml::from_slice(&raw)?;
    config.validate()?;
    Ok(config)
}

/// The on-disk layout of a [FileSource] file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileFormat {
    #[serde(default)]
    vdisks: BTreeMap<String, FileVdisk>,
    #[serde(default)]
    clusters: BTreeMap<String, StorageClusterConfig>,
}

/// One vdisk entry in a [FileSource] file: the static document and the
/// cluster references, flattened into a single YAML mapping.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileVdisk {
    block_size: u64,
    size: u64,
    #[serde(rename = "type")]
    vdisk_type: VdiskType,
    #[serde(default)]
    read_only: bool,
    storage_cluster: String,
    #[serde(default)]
    template_cluster: Option<String>,
    #[serde(default)]
    tlog_cluster: Option<String>,
}

impl FileVdisk {
    fn static_config(&self) -> VdiskStaticConfig {
        VdiskStaticConfig {
            block_size: self.block_size,
            size: self.size,
            vdisk_type: self.vdisk_type,
            read_only: self.read_only,
        }
    }

    fn nbd_config(&self) -> VdiskNbdConfig {
        VdiskNbdConfig {
            storage_cluster_id: self.storage_cluster.clone(),
            template_cluster_id: self.template_cluster.clone(),
            tlog_cluster_id: self.tlog_cluster.clone(),
        }
    }
}

impl FileFormat {
    /// Ensures every cluster referenced by a vdisk exists, and that every
    /// document on its own is valid.
    fn validate(&self) -> Result<(), Error> {
        for (id, cluster) in &self.clusters {
            cluster.validate().map_err(|err| {
                debug!(cluster = %id, "invalid cluster config");
                err
            })?;
        }
        for (id, vdisk) in &self.vdisks {
            vdisk.static_config().validate()?;

            let mut referenced = vec![&vdisk.storage_cluster];
            referenced.extend(vdisk.template_cluster.iter());
            referenced.extend(vdisk.tlog_cluster.iter());
            for cluster in referenced {
                if !self.clusters.contains_key(cluster) {
                    return Err(Error::UnknownCluster {
                        vdisk: id.clone(),
                        cluster: cluster.clone(),
                    });
                }
            }

            if vdisk.vdisk_type.storage_type() == StorageType::SemiDeduped
                && vdisk.template_cluster.is_none()
            {
                return Err(Error::MissingTemplateCluster(id.clone()));
            }
        }
        Ok(())
    }
}

/// A configuration source backed by a single YAML file.
///
/// The file is re-read (and re-validated) on every [Source::get], so edits
/// are picked up without a restart. Watches yield the value current at the
/// time of the call and then close: a file cannot push updates.
#[derive(Clone)]
pub struct FileSource {
    path: Arc<PathBuf>,
}

impl FileSource {
    /// Opens `path` and validates its current contents.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let source = Self {
            path: Arc::new(path.into()),
        };
        source.load()?;
        Ok(source)
    }

    fn load(&self) -> Result<FileFormat, Error> {
        let raw = std::fs::read(self.path.as_ref())?;
        let format: FileFormat = serde_yaml::from_slice(&raw)?;
        format.validate()?;
        Ok(format)
    }

    fn extract(format: &FileFormat, key: &Key) -> Result<Bytes, Error> {
        let not_found = || Error::NotFound(key.clone());
        let value = match key {
            Key::VdiskStatic(id) => {
                let vdisk = format.vdisks.get(id).ok_or_else(not_found)?;
                serde_yaml::to_string(&vdisk.static_config())?
            }
            Key::VdiskNbd(id) => {
                let vdisk = format.vdisks.get(id).ok_or_else(not_found)?;
                serde_yaml::to_string(&vdisk.nbd_config())?
            }
            Key::VdiskTlog(id) => {
                let vdisk = format.vdisks.get(id).ok_or_else(not_found)?;
                let cluster = vdisk.tlog_cluster.clone().ok_or_else(not_found)?;
                serde_yaml::to_string(&VdiskTlogConfig {
                    storage_cluster_id: cluster,
                })?
            }
            Key::ClusterStorage(id) | Key::ClusterTlog(id) => {
                let cluster = format.clusters.get(id).ok_or_else(not_found)?;
                serde_yaml::to_string(cluster)?
            }
        };
        Ok(Bytes::from(value))
    }
}

impl Source for FileSource {
    fn get(&self, key: &Key) -> Result<Bytes, Error> {
        let format = self.load()?;
        Self::extract(&format, key)
    }

    fn watch(&self, key: &Key) -> mpsc::UnboundedReceiver<Bytes> {
        let (sender, receiver) = mpsc::unbounded();
        if let Ok(snapshot) = self.get(key) {
            let _ = sender.unbounded_send(snapshot);
        }
        // Dropping the sender closes the stream: files don't push updates.
        receiver
    }
}

#[derive(Default)]
struct MapInner {
    values: HashMap<Key, Bytes>,
    watchers: HashMap<Key, Vec<mpsc::UnboundedSender<Bytes>>>,
}

/// An in-process watchable configuration source.
///
/// Shaped like an etcd-backed source: every key holds a YAML document and
/// watchers are notified of every update, in order. Also the stub used by
/// tests that need to flip configuration at runtime.
#[derive(Clone, Default)]
pub struct MapSource {
    inner: Arc<Mutex<MapInner>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw snapshot under `key` and notifies watchers.
    pub fn set(&self, key: Key, value: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        inner.values.insert(key.clone(), value.clone());
        if let Some(watchers) = inner.watchers.get_mut(&key) {
            watchers.retain(|watcher| watcher.unbounded_send(value.clone()).is_ok());
        }
    }

    /// Stores the documents of a vdisk.
    pub fn set_vdisk(
        &self,
        vdisk: &str,
        static_config: &VdiskStaticConfig,
        nbd_config: &VdiskNbdConfig,
    ) {
        self.set(
            Key::VdiskStatic(vdisk.to_string()),
            yaml_bytes(static_config),
        );
        self.set(Key::VdiskNbd(vdisk.to_string()), yaml_bytes(nbd_config));
        if let Some(cluster) = &nbd_config.tlog_cluster_id {
            self.set(
                Key::VdiskTlog(vdisk.to_string()),
                yaml_bytes(&VdiskTlogConfig {
                    storage_cluster_id: cluster.clone(),
                }),
            );
        }
    }

    /// Stores a storage cluster document.
    pub fn set_storage_cluster(&self, cluster: &str, config: &StorageClusterConfig) {
        self.set(Key::ClusterStorage(cluster.to_string()), yaml_bytes(config));
    }

    /// Stores a tlog cluster document.
    pub fn set_tlog_cluster(&self, cluster: &str, config: &StorageClusterConfig) {
        self.set(Key::ClusterTlog(cluster.to_string()), yaml_bytes(config));
    }
}

fn yaml_bytes<T: Serialize>(value: &T) -> Bytes {
    // Serializing a value that was just constructed from valid fields
    // cannot fail.
    Bytes::from(serde_yaml::to_string(value).expect("yaml serialization failed"))
}

impl Source for MapSource {
    fn get(&self, key: &Key) -> Result<Bytes, Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    fn watch(&self, key: &Key) -> mpsc::UnboundedReceiver<Bytes> {
        let (sender, receiver) = mpsc::unbounded();
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.entry(key.clone()).or_default().push(sender);
        receiver
    }
}
