//! `torrentd` CLI: a thin host binary around the `torrentd` engine library.
//!
//! It loads configuration (TOML file + `TORRENTD_CONFIG_OVERRIDE_*` env
//! overrides, see `torrentd_configuration`), wires the `tokio`-backed
//! socket/filesystem/session-store implementations into an `Engine`,
//! restores any previously known torrents, optionally adds one torrent file
//! or magnet link given on the command line, and then runs the maintenance
//! loop until interrupted.
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use torrentd::net::TokioSocketFactory;
use torrentd::session::FileSessionStore;
use torrentd::storage::TokioFileSystem;
use torrentd::{Engine, EngineEvent};
use torrentd_configuration::{EngineConfig, Info};
use tracing::{error, info, warn};

const ENV_VAR_CONFIG_TOML: &str = "TORRENTD_CONFIG_TOML";
const ENV_VAR_CONFIG_PATH: &str = "TORRENTD_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "torrentd.toml";

/// An embeddable `BitTorrent` client engine, run as a standalone daemon.
#[derive(Parser, Debug)]
#[command(name = "torrentd", version, about)]
struct Cli {
    /// Path to a TOML configuration file. Created with defaults on first run
    /// if it does not exist.
    #[arg(short, long, env = "TORRENTD_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Directory for persisted session state (torrent list, bitfields, `.torrent` blobs).
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Directory backing the `default` storage root, where torrent content is written.
    #[arg(long, default_value = "./downloads")]
    download_dir: PathBuf,

    /// A `.torrent` file path or `magnet:` URI to add (and start) on launch.
    torrent: Option<String>,
}

/// Turns one host-facing event into a log line. A richer host (a UI, an
/// RPC server) would consume `Engine::take_events`'s receiver directly
/// instead of just logging it, as this CLI does.
fn log_engine_event(event: &EngineEvent) {
    match event {
        EngineEvent::Metadata { info_hash } => info!(%info_hash, "metadata resolved"),
        EngineEvent::PieceVerified { info_hash, index } => info!(%info_hash, index, "piece verified"),
        EngineEvent::Complete { info_hash } => info!(%info_hash, "torrent complete"),
        EngineEvent::PeerCountChanged { info_hash, connected } => info!(%info_hash, connected, "peer count changed"),
        EngineEvent::TrackerAnnounce { info_hash, url, seeders, leechers } => {
            info!(%info_hash, url, seeders, leechers, "tracker announce");
        }
        EngineEvent::TrackerFailure { info_hash, reason } => warn!(%info_hash, reason, "tracker announce failed"),
        EngineEvent::Error { info_hash, kind, message } => error!(%info_hash, kind, message, "engine error"),
        EngineEvent::StatsTick { info_hash, down, up, eta, pieces } => {
            info!(%info_hash, down, up, eta = ?eta, pieces, "stats tick");
        }
    }
}

fn init_tracing(level: torrentd_configuration::LogLevel) {
    if level == torrentd_configuration::LogLevel::Off {
        return;
    }
    let filter = level.to_string();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let info = match Info::new(ENV_VAR_CONFIG_TOML, ENV_VAR_CONFIG_PATH, &cli.config) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("torrentd: failed to read configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    if info.config_toml.is_none() && !std::path::Path::new(&info.config_toml_path).exists() {
        if let Err(err) = EngineConfig::create_default_configuration_file(&info.config_toml_path) {
            eprintln!("torrentd: failed to write default configuration to {}: {err}", info.config_toml_path);
            return ExitCode::FAILURE;
        }
    }

    let config = match EngineConfig::load(&info) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("torrentd: invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.logging.log_level);

    info!(port = config.network.listen_port, "starting torrentd");

    if let Err(err) = std::fs::create_dir_all(&cli.data_dir) {
        error!("failed to create data directory {:?}: {err}", cli.data_dir);
        return ExitCode::FAILURE;
    }

    let mut roots = HashMap::new();
    for root in &config.storage.storage_roots {
        roots.insert(root.key.clone(), cli.download_dir.join(&root.root_id));
    }

    let socket_factory = Arc::new(TokioSocketFactory);
    let file_system = Arc::new(TokioFileSystem::new(roots));
    let session_store = match FileSessionStore::new(cli.data_dir.clone()).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("failed to open session store at {:?}: {err}", cli.data_dir);
            return ExitCode::FAILURE;
        }
    };

    let mut engine = match Engine::new(config, socket_factory, file_system, session_store).await {
        Ok(engine) => engine,
        Err(err) => {
            error!("failed to start engine: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = engine.restore_session().await {
        warn!("failed to fully restore session state: {err}");
    }

    if let Some(mut events) = engine.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_engine_event(&event);
            }
        });
    }

    if let Some(torrent) = cli.torrent {
        let added = if torrent.starts_with("magnet:") {
            engine.add_magnet(&torrent, None).await
        } else {
            match std::fs::read(&torrent) {
                Ok(bytes) => engine.add_torrent_file(&bytes, None).await,
                Err(err) => {
                    error!("failed to read torrent file {torrent}: {err}");
                    return ExitCode::FAILURE;
                }
            }
        };

        match added {
            Ok(info_hash) => {
                if let Err(err) = engine.start_torrent(info_hash).await {
                    error!("failed to start torrent {info_hash}: {err}");
                    return ExitCode::FAILURE;
                }
                info!(%info_hash, "added and started torrent");
            }
            Err(err) => {
                error!("failed to add torrent: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    tokio::select! {
        () = engine.run() => unreachable!("Engine::run never returns"),
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    ExitCode::SUCCESS
}
