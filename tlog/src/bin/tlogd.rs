//! The standalone tlog server daemon.
//!
//! Receives tlog blocks over TCP and persists erasure-coded aggregations
//! to an ardb storage cluster given as dial strings.

use clap::{Arg, Command};
use commonware_runtime::{tokio as tokio_runtime, Metrics, Runner};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tracing::{error, info};
use vdisk_ardb::{Controller, Pools};
use vdisk_config::{Key as ConfigKey, MapSource, StorageClusterConfig};
use vdisk_tlog::{
    seal::Key,
    server::{Config as ServerConfig, Registry, RegistryConfig, Server},
    store::ArdbStore,
    Coding,
};

/// The cluster id the dial strings are registered under.
const CLUSTER: &str = "tlog";

fn required_parse<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> T {
    matches
        .get_one::<String>(name)
        .unwrap()
        .parse()
        .unwrap_or_else(|_| {
            eprintln!("invalid value for --{name}");
            std::process::exit(1);
        })
}

fn main() {
    let matches = Command::new("tlogd")
        .about("receives vdisk transaction logs and persists them")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDRESS")
                .help("Address to accept tlog connections on")
                .default_value("0.0.0.0:11211"),
        )
        .arg(
            Arg::new("storage")
                .short('s')
                .long("storage")
                .value_name("DIALSTRINGS")
                .help("Comma-separated storage servers (ip:port[@db],...)")
                .required(true),
        )
        .arg(
            Arg::new("priv-key")
                .long("priv-key")
                .value_name("KEY")
                .help("32-byte private key sealing aggregations")
                .default_value("12345678901234567890123456789012"),
        )
        .arg(
            Arg::new("data-shards")
                .short('k')
                .long("data-shards")
                .value_name("K")
                .help("Erasure-coding data shard count")
                .default_value("4"),
        )
        .arg(
            Arg::new("parity-shards")
                .short('m')
                .long("parity-shards")
                .value_name("M")
                .help("Erasure-coding parity shard count")
                .default_value("2"),
        )
        .arg(
            Arg::new("flush-size")
                .long("flush-size")
                .value_name("BLOCKS")
                .help("Blocks per aggregation")
                .default_value("25"),
        )
        .arg(
            Arg::new("flush-time")
                .long("flush-time")
                .value_name("SECONDS")
                .help("Seconds before a partial aggregation is flushed")
                .default_value("25"),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .value_name("PORT")
                .help("Port on which metrics are exposed")
                .default_value("9090"),
        )
        .get_matches();

    let listen: SocketAddr = required_parse(&matches, "listen");
    let metrics_port: u16 = required_parse(&matches, "metrics-port");
    let data_shards: usize = required_parse(&matches, "data-shards");
    let parity_shards: usize = required_parse(&matches, "parity-shards");
    let flush_size: usize = required_parse(&matches, "flush-size");
    let flush_time: u64 = required_parse(&matches, "flush-time");

    let servers = match vdisk_config::parse_server_configs(
        matches.get_one::<String>("storage").unwrap(),
    ) {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => {
            eprintln!("at least one storage server is required");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("invalid --storage: {err}");
            std::process::exit(1);
        }
    };
    if servers.len() < data_shards + parity_shards {
        eprintln!(
            "{} storage servers cannot hold {} shards on distinct servers",
            servers.len(),
            data_shards + parity_shards
        );
        std::process::exit(1);
    }

    let key = match Key::from_slice(matches.get_one::<String>("priv-key").unwrap().as_bytes()) {
        Ok(key) => key,
        Err(err) => {
            eprintln!("invalid --priv-key: {err}");
            std::process::exit(1);
        }
    };

    let executor = tokio_runtime::Runner::default();
    executor.start(|context| async move {
        tokio_runtime::telemetry::init(
            context.with_label("telemetry"),
            tokio_runtime::telemetry::Logging {
                level: tracing::Level::INFO,
                json: false,
            },
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, metrics_port))),
            None,
        );

        // The dial strings become an in-process config source holding one
        // tlog cluster.
        let source = MapSource::new();
        source.set_tlog_cluster(CLUSTER, &StorageClusterConfig { servers });
        let pools = Pools::new(context.with_label("pools"));
        let cluster = match Controller::init(
            context.with_label("cluster"),
            pools,
            source,
            CLUSTER,
            ConfigKey::ClusterTlog(CLUSTER.to_string()),
        )
        .await
        {
            Ok(cluster) => Arc::new(cluster),
            Err(err) => {
                error!(?err, "unable to build storage cluster");
                return;
            }
        };

        let store = ArdbStore::new(cluster);
        let mut registry_config = RegistryConfig::new(key, store);
        registry_config.coding = Coding::new(data_shards, parity_shards);
        registry_config.flush_size = flush_size;
        registry_config.flush_time = Duration::from_secs(flush_time);
        let registry = Registry::new(context.with_label("registry"), registry_config);

        info!(
            %listen,
            data_shards,
            parity_shards,
            flush_size,
            flush_time,
            "starting tlog server"
        );
        let server = Server::new(
            context.with_label("server"),
            registry,
            ServerConfig {
                address: listen,
                max_message_size: vdisk_tlog::wire::MAX_MESSAGE_SIZE,
            },
        );
        let _ = server.start().await;
    });
}
