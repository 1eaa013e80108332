use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use robofocus_alpaca::config::{self, LoggingCfg};
use robofocus_alpaca::focuser::FocuserController;
use robofocus_alpaca::protocol::ProtocolLog;
use robofocus_alpaca::server::{Server, ServerInfo, DEFAULT_DISCOVERY_PORT};
use robofocus_alpaca::settings::{Mode, SettingsStore};

/// ASCOM Alpaca driver for the Robofocus electronic focuser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file; created with defaults when missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Persisted user settings file; created with defaults when missing.
    #[arg(long, default_value = "user_settings.json")]
    settings: PathBuf,

    /// Override the HTTP listen port from the configuration.
    #[arg(long)]
    port: Option<u16>,

    /// Run against the built-in simulator for this session, without
    /// changing the persisted mode preference.
    #[arg(long)]
    simulator: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load_or_create(&args.config)?;
    init_tracing(&cfg.logging)?;

    let settings = Arc::new(SettingsStore::load_or_create(
        args.settings.clone(),
        &cfg.focuser,
    )?);
    let log = Arc::new(ProtocolLog::default());
    let mode_override = args.simulator.then_some(Mode::Simulator);

    let ip: IpAddr = cfg
        .server
        .ip
        .parse()
        .with_context(|| format!("invalid server ip {:?}", cfg.server.ip))?;
    let listen_addr = SocketAddr::new(ip, args.port.unwrap_or(cfg.server.port));

    let controller = FocuserController::new(cfg.clone(), settings, log, mode_override);
    tracing::info!(mode = ?controller.mode(), %listen_addr, "starting Robofocus Alpaca driver");

    Server {
        controller,
        info: ServerInfo::default(),
        listen_addr,
        discovery_port: DEFAULT_DISCOVERY_PORT,
        discovery_enabled: cfg.server.discovery_enabled,
    }
    .start()
    .await
}

fn init_tracing(cfg: &LoggingCfg) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    match &cfg.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}
