//! An in-memory ardb backend.
//!
//! Implements the handful of commands the storage engines rely on, either
//! applied directly ([MemoryArdb::apply]) or served as a real RESP endpoint
//! on any runtime network ([MemoryArdb::serve]). Test suites across the
//! workspace bind one of these on the deterministic network instead of
//! talking to a real cluster.

use crate::resp::{self, Decoded, Reply};
use bytes::{Bytes, BytesMut};
use commonware_runtime::{Handle, Listener, Metrics, Network, Sink, Spawner, Stream};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

type Hash = BTreeMap<Bytes, Bytes>;

#[derive(Default)]
struct Inner {
    databases: HashMap<u16, BTreeMap<Bytes, Hash>>,
}

/// A threadsafe, multi-database, hash-only key-value store.
#[derive(Clone, Default)]
pub struct MemoryArdb {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryArdb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one command against `database` and returns its reply.
    ///
    /// Unknown commands produce an error reply, like a real server would.
    pub fn apply(&self, database: u16, parts: &[Bytes]) -> Reply {
        let Some((name, args)) = parts.split_first() else {
            return Reply::Error("ERR empty command".into());
        };
        let name = name.to_ascii_uppercase();
        let mut inner = self.inner.lock().unwrap();
        let db = inner.databases.entry(database).or_default();
        match (name.as_slice(), args) {
            (b"PING", []) => Reply::Simple("PONG".into()),
            (b"HSET", [key, field, value]) => {
                let new = db
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone())
                    .is_none();
                Reply::Integer(new as i64)
            }
            (b"HGET", [key, field]) => {
                Reply::Bulk(db.get(key).and_then(|hash| hash.get(field)).cloned())
            }
            (b"HDEL", [key, fields @ ..]) if !fields.is_empty() => {
                let mut removed = 0;
                if let Some(hash) = db.get_mut(key) {
                    for field in fields {
                        removed += hash.remove(field).is_some() as i64;
                    }
                    if hash.is_empty() {
                        db.remove(key);
                    }
                }
                Reply::Integer(removed)
            }
            (b"HEXISTS", [key, field]) => Reply::Integer(
                db.get(key).is_some_and(|hash| hash.contains_key(field)) as i64,
            ),
            (b"HLEN", [key]) => Reply::Integer(db.get(key).map_or(0, |hash| hash.len() as i64)),
            (b"HKEYS", [key]) => Reply::Array(Some(
                db.get(key)
                    .map(|hash| hash.keys().cloned().map(|f| Reply::Bulk(Some(f))).collect())
                    .unwrap_or_default(),
            )),
            (b"HGETALL", [key]) => {
                let mut items = Vec::new();
                if let Some(hash) = db.get(key) {
                    for (field, value) in hash {
                        items.push(Reply::Bulk(Some(field.clone())));
                        items.push(Reply::Bulk(Some(value.clone())));
                    }
                }
                Reply::Array(Some(items))
            }
            (b"EXISTS", [key]) => Reply::Integer(db.contains_key(key) as i64),
            (b"DEL", keys) if !keys.is_empty() => {
                let mut removed = 0;
                for key in keys {
                    removed += db.remove(key).is_some() as i64;
                }
                Reply::Integer(removed)
            }
            (b"KEYS", [pattern]) => {
                let matches: Vec<Reply> = db
                    .keys()
                    .filter(|key| matches_pattern(pattern, key))
                    .cloned()
                    .map(|key| Reply::Bulk(Some(key)))
                    .collect();
                Reply::Array(Some(matches))
            }
            _ => Reply::Error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&name)
            )),
        }
    }

    /// Serves the store as a RESP endpoint bound on `address`.
    pub fn serve<E: Spawner + Network + Metrics>(self, context: E, address: SocketAddr) -> Handle<()> {
        context.with_label("ardb").spawn(move |context| async move {
            let mut listener = match context.bind(address).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(%address, ?err, "failed to bind");
                    return;
                }
            };
            loop {
                let Ok((peer, sink, stream)) = listener.accept().await else {
                    return;
                };
                debug!(%peer, "accepted connection");
                let backend = self.clone();
                context
                    .with_label("connection")
                    .spawn(move |_| backend.handle(sink, stream));
            }
        })
    }

    async fn handle<Si: Sink, St: Stream>(self, mut sink: Si, mut stream: St) {
        let mut database = 0u16;
        let mut pending = BytesMut::new();
        loop {
            // Commands are themselves RESP values (arrays of bulk strings),
            // so the reply decoder reads them too.
            let command = loop {
                match resp::decode(&pending) {
                    Ok(Decoded::Complete(command, used)) => {
                        let _ = pending.split_to(used);
                        break command;
                    }
                    Ok(Decoded::Incomplete(needed)) => {
                        let mut read = vec![0u8; needed];
                        if stream.recv(&mut read[..]).await.is_err() {
                            return;
                        };
                        pending.extend_from_slice(&read);
                    }
                    Err(_) => return,
                }
            };
            let Some(parts) = command_parts(command) else {
                return;
            };

            // SELECT is handled here: the database index is per-connection
            // state, not store state.
            let reply = match parts.split_first() {
                Some((name, [index])) if name.eq_ignore_ascii_case(b"SELECT") => {
                    match std::str::from_utf8(index)
                        .ok()
                        .and_then(|raw| raw.parse::<u16>().ok())
                    {
                        Some(index) => {
                            database = index;
                            Reply::Simple("OK".into())
                        }
                        None => Reply::Error("ERR invalid DB index".into()),
                    }
                }
                _ => self.apply(database, &parts),
            };

            let mut buf = BytesMut::new();
            reply.encode(&mut buf);
            if sink.send(buf).await.is_err() {
                return;
            }
        }
    }
}

/// Extracts the bulk-string parts of a decoded command.
fn command_parts(command: Reply) -> Option<Vec<Bytes>> {
    let Reply::Array(Some(items)) = command else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            Reply::Bulk(Some(bytes)) => Some(bytes),
            _ => None,
        })
        .collect()
}

/// Glob matching, reduced to the two forms the workspace uses: exact keys
/// and `prefix*`.
fn matches_pattern(pattern: &[u8], key: &[u8]) -> bool {
    match pattern.split_last() {
        Some((b'*', prefix)) => key.starts_with(prefix),
        _ => key == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(raw: &[&str]) -> Vec<Bytes> {
        raw.iter()
            .map(|part| Bytes::copy_from_slice(part.as_bytes()))
            .collect()
    }

    #[test]
    fn test_hash_commands() {
        let backend = MemoryArdb::new();
        assert_eq!(
            backend.apply(0, &parts(&["HSET", "disk1", "0", "a"])),
            Reply::Integer(1)
        );
        assert_eq!(
            backend.apply(0, &parts(&["HSET", "disk1", "0", "b"])),
            Reply::Integer(0)
        );
        assert_eq!(
            backend.apply(0, &parts(&["HGET", "disk1", "0"])),
            Reply::Bulk(Some(Bytes::from_static(b"b")))
        );
        assert_eq!(
            backend.apply(0, &parts(&["HLEN", "disk1"])),
            Reply::Integer(1)
        );
        assert_eq!(
            backend.apply(0, &parts(&["HDEL", "disk1", "0"])),
            Reply::Integer(1)
        );
        // Deleting the last field removes the key entirely.
        assert_eq!(
            backend.apply(0, &parts(&["EXISTS", "disk1"])),
            Reply::Integer(0)
        );
    }

    #[test]
    fn test_databases_are_isolated() {
        let backend = MemoryArdb::new();
        backend.apply(0, &parts(&["HSET", "disk1", "0", "zero"]));
        assert_eq!(
            backend.apply(1, &parts(&["HGET", "disk1", "0"])),
            Reply::Bulk(None)
        );
    }

    #[test]
    fn test_keys_pattern() {
        let backend = MemoryArdb::new();
        backend.apply(0, &parts(&["HSET", "disk1", "0", "a"]));
        backend.apply(0, &parts(&["HSET", "disk1:lba", "0", "b"]));
        backend.apply(0, &parts(&["HSET", "disk2", "0", "c"]));

        let matched = backend.apply(0, &parts(&["KEYS", "disk1*"]));
        let Reply::Array(Some(items)) = matched else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_unknown_command() {
        let backend = MemoryArdb::new();
        assert!(matches!(
            backend.apply(0, &parts(&["WHAT"])),
            Reply::Error(_)
        ));
    }
}
