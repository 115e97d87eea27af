//! CineChat server — chat rooms for people watching movies together.
//!
//! # Usage
//!
//! ```bash
//! cinechatd                       # Serve UDP on the configured port
//! cinechatd --transport tcp       # Serve TCP instead
//! cinechatd --port 2000           # Override the port for this run
//! cinechatd --loss 0.2            # Drop 20% of outgoing UDP datagrams
//! cinechatd --config server.toml  # Use a specific config file
//! ```
//!
//! On first run a config file with a small demo movie catalog is written
//! to `~/.config/cinechat/server.toml`; edit it to change the catalog.
//!
//! The server runs one transport per process. Both speak the same frames;
//! a UDP server exercises the full retransmission machinery (especially
//! with `--loss`), a TCP server the stream reassembly.

mod directory;
mod session;
mod tcp;
mod udp;

use anyhow::{Context, Result};
use clap::Parser;
use cinechat_core::config::{ServerConfig, TransportKind};
use directory::Directory;
use session::ChatServer;
use std::path::PathBuf;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

/// CineChat server — movie chat rooms over reliable UDP or TCP.
#[derive(Parser, Debug)]
#[command(name = "cinechatd", about = "CineChat chat server")]
struct Cli {
    /// Address to bind. Overrides the config file for this run.
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on. Overrides the config file for this run.
    #[arg(short, long)]
    port: Option<u16>,

    /// Transport to serve: udp or tcp.
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Probability (0.0–1.0) of dropping an outgoing UDP datagram.
    #[arg(short, long)]
    loss: Option<f64>,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    // -----------------------------------------------------------------------
    // Load or create configuration
    // -----------------------------------------------------------------------
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => ServerConfig::config_file_path().context("could not determine config directory")?,
    };

    let mut config = match ServerConfig::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            info!(path = %config_path.display(), "first run, writing default config");
            let config = ServerConfig::first_run();
            config.save_to(&config_path)?;
            config
        }
    };

    // CLI overrides
    if let Some(bind) = &cli.bind {
        config.bind_address = bind.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if let Some(loss) = cli.loss {
        anyhow::ensure!((0.0..=1.0).contains(&loss), "--loss must be within 0.0–1.0");
        config.loss_probability = loss;
    }

    if config.movies.is_empty() {
        warn!("movie catalog is empty — clients will see no rooms to join");
    }

    let directory = Directory::new(config.movies.clone());
    let server = ChatServer::new(directory);
    let bind_addr = format!("{}:{}", config.bind_address, config.port);

    // -----------------------------------------------------------------------
    // Serve until Ctrl+C
    // -----------------------------------------------------------------------
    info!(
        transport = %config.transport,
        addr = %bind_addr,
        movies = config.movies.len(),
        "starting CineChat server"
    );

    match config.transport {
        TransportKind::Udp => {
            let socket = UdpSocket::bind(&bind_addr)
                .await
                .with_context(|| format!("failed to bind UDP socket on {bind_addr}"))?;
            tokio::select! {
                () = udp::run(socket, config.loss_probability, server) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        TransportKind::Tcp => {
            if config.loss_probability > 0.0 {
                warn!("--loss only applies to the UDP transport, ignoring");
            }
            let listener = TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {bind_addr}"))?;
            tokio::select! {
                () = tcp::run(listener, server) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }

    info!("shutting down");
    Ok(())
}

/// Initializes tracing with a stderr layer and, when the data directory is
/// writable, an append-mode file layer. `CINECHAT_LOG` controls the level
/// (default `info`).
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_env("CINECHAT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = cinechat_core::config::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("cinechatd.log"))
                .ok()
        })
        .map(|file| {
            fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
