//! Vdisk copy algorithms.
//!
//! What a copy moves depends on the engine:
//!
//! - deduped: only the LBA sectors. Block content is content-addressed and
//!   shared; the target pulls it from its template on first read.
//! - non-deduped: every block, server by server. Source and target clusters
//!   must be the same size, because the index shard is fixed.
//! - semi-deduped: LBA sectors, the override bitmap, and any local
//!   overrides.
//!
//! A copy is not transactional: on error the target must be considered
//! garbage, though already-copied data is not rolled back.

use crate::Error;
use bytes::Bytes;
use commonware_runtime::{Metrics, Network, Spawner};
use std::collections::HashMap;
use tracing::info;
use vdisk_ardb::{
    resp::{Command, Reply},
    Controller, Server,
};
use vdisk_config::ServerState;

/// Copies a deduped vdisk: its LBA sectors, resharded onto the target
/// cluster.
pub async fn copy_deduped<E: Spawner + Network + Metrics>(
    source_vdisk: &str,
    target_vdisk: &str,
    source: &Controller<E>,
    target: &Controller<E>,
) -> Result<(), Error> {
    info!(source_vdisk, target_vdisk, "copying deduped vdisk metadata");
    copy_resharded(
        source,
        target,
        &format!("{source_vdisk}:lba"),
        &format!("{target_vdisk}:lba"),
    )
    .await
}

/// Copies a non-deduped vdisk block by block, server position by server
/// position. The clusters must be the same size.
pub async fn copy_nondeduped<E: Spawner + Network + Metrics>(
    source_vdisk: &str,
    target_vdisk: &str,
    source: &Controller<E>,
    target: &Controller<E>,
) -> Result<(), Error> {
    let source_servers = source.servers().await;
    let target_servers = target.servers().await;
    if source_servers.len() != target_servers.len() {
        return Err(Error::ClusterSizeMismatch {
            source_count: source_servers.len(),
            target: target_servers.len(),
        });
    }

    info!(source_vdisk, target_vdisk, "copying non-deduped vdisk");
    for (source_server, target_server) in source_servers.iter().zip(target_servers.iter()) {
        let fields = read_fields(source_server, source_vdisk).await?;
        if fields.is_empty() {
            continue;
        }
        let commands: Vec<Command> = fields
            .into_iter()
            .map(|(field, value)| {
                Command::new("HSET")
                    .arg(target_vdisk.to_string())
                    .arg(field)
                    .arg(value)
            })
            .collect();
        for reply in target_server.write_pipeline(&commands).await? {
            reply.into_ok()?;
        }
    }
    Ok(())
}

/// Copies a semi-deduped vdisk: LBA sectors, the override bitmap, and the
/// local overrides.
pub async fn copy_semideduped<E: Spawner + Network + Metrics>(
    source_vdisk: &str,
    target_vdisk: &str,
    source: &Controller<E>,
    target: &Controller<E>,
) -> Result<(), Error> {
    copy_deduped(source_vdisk, target_vdisk, source, target).await?;
    copy_resharded(
        source,
        target,
        &format!("{source_vdisk}:bitmap"),
        &format!("{target_vdisk}:bitmap"),
    )
    .await?;
    // Local overrides are indexed by block, so they reshard the same way.
    copy_resharded(source, target, source_vdisk, target_vdisk).await
}

/// Copies one redis hash whose fields are numeric shard keys, regrouping
/// every field onto the target server its key maps to.
async fn copy_resharded<E: Spawner + Network + Metrics>(
    source: &Controller<E>,
    target: &Controller<E>,
    source_key: &str,
    target_key: &str,
) -> Result<(), Error> {
    let mut batches: HashMap<usize, (Server<E>, Vec<Command>)> = HashMap::new();
    for server in source.servers().await {
        for (field, value) in read_fields(&server, source_key).await? {
            let index: u64 = std::str::from_utf8(&field)
                .ok()
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| Error::MalformedField(source_key.to_string()))?;
            let target_server = target.server_for(index).await;
            batches
                .entry(target_server.index())
                .or_insert_with(|| (target_server, Vec::new()))
                .1
                .push(
                    Command::new("HSET")
                        .arg(target_key.to_string())
                        .arg(field)
                        .arg(value),
                );
        }
    }
    for (_, (server, commands)) in batches {
        for reply in server.write_pipeline(&commands).await? {
            reply.into_ok()?;
        }
    }
    Ok(())
}

/// Reads every field of a redis hash on one server. A retired server
/// yields nothing: its share of the data is gone.
async fn read_fields<E: Spawner + Network + Metrics>(
    server: &Server<E>,
    key: &str,
) -> Result<Vec<(Bytes, Bytes)>, Error> {
    if server.state() == ServerState::Rip {
        return Ok(Vec::new());
    }
    let items = server
        .read(Command::new("HGETALL").arg(key.to_string()))
        .await?
        .into_array()?;
    let mut fields = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(field), Some(value)) = (items.next(), items.next()) {
        let (Reply::Bulk(Some(field)), Reply::Bulk(Some(value))) = (field, value) else {
            return Err(Error::MalformedField(key.to_string()));
        };
        fields.push((field, value));
    }
    Ok(fields)
}
