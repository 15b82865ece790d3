/*
 * quorumd is a standalone replication server around the quorum Raft engine.
 * It takes configuration via a configuration file and environment variables,
 * binds the listen addresses, and serves the peer and client protocols.
 */

#![warn(clippy::all)]

use quorum::error::Result;
use quorum::raft;
use quorum::storage;
use quorum::{errdata, errinput};

use fs2::FileExt as _;
use log::{debug, error};
use serde_derive::Deserialize;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

fn main() {
    if let Err(err) = run() {
        error!("quorumd failed: {err}");
        eprintln!("quorumd: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/quorumd.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("quorum");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    if cfg.server_id == 0 {
        return errinput!("serverId must be nonzero");
    }
    let heartbeat_period = match cfg.heartbeat_period_milliseconds {
        Some(0) | None => cfg.election_timeout_milliseconds / 5,
        Some(ms) => ms,
    };
    if heartbeat_period == 0 || cfg.election_timeout_milliseconds == 0 {
        return errinput!("election timeout and heartbeat period must be nonzero");
    }
    let election_ticks =
        (cfg.election_timeout_milliseconds / heartbeat_period).clamp(1, 100) as raft::Ticks;

    // Select the storage module. Temporary storage is shorthand for the
    // in-memory module.
    let memory = cfg.use_temporary_storage || cfg.storage_module.eq_ignore_ascii_case("memory");
    let (log_store, snapshot_store, _lockfile): (
        Box<dyn storage::Store>,
        Box<dyn raft::snapshot::Store>,
        Option<std::fs::File>,
    ) = if memory {
        (Box::new(storage::Memory::new()), Box::new(raft::snapshot::Memory::new()), None)
    } else if cfg.storage_module.eq_ignore_ascii_case("filesystem") {
        let path = std::path::Path::new(&cfg.storage_path);
        std::fs::create_dir_all(path)?;
        // Guard the storage directory against concurrent servers.
        let lockfile = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.join("lockfile"))?;
        if lockfile.try_lock_exclusive().is_err() {
            return errdata!("storage directory {} is locked by another process", cfg.storage_path);
        }
        (
            Box::new(storage::Filesystem::new(&path.join("log"))?),
            Box::new(raft::snapshot::Filesystem::new(&path.join("snapshots"))?),
            Some(lockfile),
        )
    } else {
        return errinput!("invalid storage module {}", cfg.storage_module);
    };

    let snapshots: Arc<Mutex<Box<dyn raft::snapshot::Store>>> =
        Arc::new(Mutex::new(snapshot_store));
    let snapshot_meta = snapshots.lock()?.installed()?;
    let mut log = raft::Log::new(log_store, snapshot_meta.as_ref())?;
    if let Some(uuid) = &cfg.cluster_uuid {
        log.set_cluster_uuid(uuid)?;
    }

    let opts = raft::Options {
        election_timeout_range: election_ticks..2 * election_ticks,
        tick_millis: heartbeat_period,
        addresses: cfg.listen_addresses.clone(),
        ..raft::Options::default()
    };

    let mut listeners = Vec::new();
    for addr in cfg.listen_addresses.split(',').map(str::trim) {
        listeners.push(TcpListener::bind(addr)?);
    }

    let server = raft::Server::new(
        cfg.server_id,
        cfg.listen_addresses.clone(),
        log,
        snapshots,
        opts,
        cfg.max_threads,
    )?;
    server.serve(
        listeners,
        Box::new(|apply| match apply {
            raft::Apply::Entries(entries) => {
                if let Some(last) = entries.last() {
                    debug!("Committed {} entries through {}", entries.len(), last.index)
                }
            }
            raft::Apply::Snapshot { index, .. } => debug!("Restored snapshot through {index}"),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct Config {
    server_id: raft::ServerId,
    listen_addresses: String,
    cluster_uuid: Option<String>,
    storage_module: String,
    storage_path: String,
    use_temporary_storage: bool,
    election_timeout_milliseconds: u64,
    heartbeat_period_milliseconds: Option<u64>,
    max_threads: usize,
    log_level: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("storage_module", "Filesystem")?
            .set_default("storage_path", "data")?
            .set_default("use_temporary_storage", false)?
            .set_default("election_timeout_milliseconds", 500)?
            .set_default("max_threads", 16)?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("QUORUMD"))
            .build()?
            .try_deserialize()?)
    }
}
