//! CineChat terminal client — log in, pick a movie, chat about it.
//!
//! # Usage
//!
//! ```bash
//! cinechat --name alice                  # Connect to the configured server
//! cinechat --server 192.168.1.20        # Dial a specific server
//! cinechat --transport tcp               # Use the stream transport
//! cinechat --loss 0.2                    # Drop 20% of outgoing datagrams
//! ```
//!
//! Once connected, lines you type are chat messages; commands start with
//! a slash:
//!
//! | Command          | Effect                                |
//! |------------------|---------------------------------------|
//! | `/movies`        | List the movie catalog                |
//! | `/join <title>`  | Join that movie's chat room           |
//! | `/main`          | Go back to the main room              |
//! | `/who`           | Show the users in the current view    |
//! | `/quit`          | Leave the system and exit             |

mod event;
mod net;
mod session;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use cinechat_core::config::{ClientConfig, TransportKind};
use cinechat_core::types::{Movie, RoomRef, RoomStatus, UserEntry, Username};
use event::UiEvent;
use session::Command;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

/// CineChat terminal client.
#[derive(Parser, Debug)]
#[command(name = "cinechat", about = "CineChat terminal client")]
struct Cli {
    /// Username to log in with. Overrides the config file for this run.
    #[arg(short, long)]
    name: Option<String>,

    /// Server host name or address.
    #[arg(short, long)]
    server: Option<String>,

    /// Server port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Transport to dial: udp or tcp.
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
    // Log to stderr only when asked — interleaving log lines with the
    // chat itself makes both unreadable.
    if std::env::var("CINECHAT_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("CINECHAT_LOG"))
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => ClientConfig::config_file_path().context("could not determine config directory")?,
    };
    let mut config = ClientConfig::load_from(&config_path)?.unwrap_or_default();

    if let Some(server) = &cli.server {
        config.server_address = server.clone();
    }
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if let Some(loss) = cli.loss {
        anyhow::ensure!((0.0..=1.0).contains(&loss), "--loss must be within 0.0–1.0");
        config.loss_probability = loss;
    }

    let name = match cli.name.or_else(|| config.username.clone()) {
        Some(name) => name,
        None => prompt_username()?,
    };
    let name = Username::new(name).context("invalid username")?;

    let server = resolve(&config.server_address, config.server_port)
        .await
        .with_context(|| {
            format!(
                "could not resolve server {}:{}",
                config.server_address, config.server_port
            )
        })?;

    // -----------------------------------------------------------------------
    // Network loop + login
    // -----------------------------------------------------------------------
    let (command_tx, command_rx) = mpsc::channel::<Command>(16);
    let (ui_tx, ui_rx) = mpsc::channel::<UiEvent>(64);

    let net_task = match config.transport {
        TransportKind::Udp => tokio::spawn(net::run_udp(
            server,
            config.loss_probability,
            command_rx,
            ui_tx,
        )),
        TransportKind::Tcp => tokio::spawn(net::run_tcp(server, command_rx, ui_tx)),
    };

    println!(
        "Connecting to {server} over {} as {name}...",
        config.transport
    );
    command_tx
        .send(Command::Login(name.clone()))
        .await
        .context("network loop ended before login")?;

    run_repl(name, command_tx, ui_rx).await;

    net_task.abort();
    // Surface a setup failure (bind, connect) instead of exiting silently;
    // a task cancelled by the abort above is the normal path.
    if let Ok(Err(e)) = net_task.await {
        return Err(e).context("network error");
    }
    Ok(())
}

/// State the front end keeps purely for display.
#[derive(Default)]
struct View {
    movies: Vec<Movie>,
    users: Vec<UserEntry>,
}

/// The interactive loop: stdin lines become commands or chat, protocol
/// events become printed lines.
async fn run_repl(
    name: Username,
    command_tx: mpsc::Sender<Command>,
    mut ui_rx: mpsc::Receiver<UiEvent>,
) {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdin_open = true;
    let mut view = View::default();

    loop {
        tokio::select! {
            line = lines.next(), if stdin_open => match line {
                Some(Ok(line)) => handle_line(&line, &view, &command_tx).await,
                Some(Err(_)) | None => {
                    // stdin closed — leave politely and wait for the ACK
                    stdin_open = false;
                    let _ = command_tx.send(Command::Leave).await;
                }
            },
            event = ui_rx.recv() => match event {
                Some(event) => {
                    if render(event, &name, &mut view) {
                        return;
                    }
                }
                None => return, // network loop ended
            },
        }
    }
}

/// Interprets one input line.
async fn handle_line(line: &str, view: &View, command_tx: &mpsc::Sender<Command>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let command = if let Some(rest) = line.strip_prefix("/join ") {
        Command::Join(RoomRef::Movie(rest.trim().to_string()))
    } else if line == "/main" {
        Command::Join(RoomRef::MainRoom)
    } else if line == "/quit" {
        Command::Leave
    } else if line == "/movies" {
        if view.movies.is_empty() {
            println!("(no movies announced yet)");
        }
        for movie in &view.movies {
            println!("  {movie}");
        }
        return;
    } else if line == "/who" {
        for user in &view.users {
            match user.status {
                RoomStatus::MainRoom => println!("  {} (main room)", user.name),
                RoomStatus::Movie(id) => println!("  {} (watching #{id})", user.name),
            }
        }
        return;
    } else if line.starts_with('/') {
        println!("unknown command: {line}");
        return;
    } else {
        Command::Chat(line.to_string())
    };

    let _ = command_tx.send(command).await;
}

/// Prints one protocol event. Returns `true` when the app should exit.
fn render(event: UiEvent, name: &Username, view: &mut View) -> bool {
    let clock = Local::now().format("%H:%M");
    match event {
        UiEvent::InitComplete { users, movies } => {
            println!("[{clock}] logged in as {name}");
            if !movies.is_empty() {
                println!("movies on tonight:");
                for movie in &movies {
                    println!("  {movie}");
                }
            }
            println!(
                "{} user(s) online — /join <title> to pick a room",
                users.len()
            );
            view.movies = movies;
            view.users = users;
        }
        UiEvent::UserList(users) => {
            view.users = users;
        }
        UiEvent::UserUpdate { name, room } => {
            let status = match &room {
                RoomRef::MainRoom => RoomStatus::MainRoom,
                RoomRef::Movie(title) => view
                    .movies
                    .iter()
                    .find(|m| m.title == *title)
                    .map(|m| RoomStatus::Movie(m.id))
                    .unwrap_or(RoomStatus::MainRoom),
            };
            view.users.push(UserEntry {
                name: name.clone(),
                status,
            });
            println!("[{clock}] {name} is in {room}");
        }
        UiEvent::ChatMessage { sender, text } => {
            println!("[{clock}] {sender}: {text}");
        }
        UiEvent::JoinRoomOk => {
            println!("[{clock}] room change confirmed");
        }
        UiEvent::ConnectionRejected { reason } => {
            eprintln!("connection rejected: {reason}");
        }
        UiEvent::LeaveSystemOk => {
            println!("[{clock}] goodbye");
            return true;
        }
        UiEvent::ApplicationQuit => {
            return true;
        }
    }
    false
}

/// Prompts for a username when neither the CLI nor the config names one.
fn prompt_username() -> Result<String> {
    anyhow::ensure!(
        io::stdin().is_terminal(),
        "no username configured; pass --name or set it in the config file"
    );
    print!("Pick a username: ");
    io::stdout().flush()?;
    let mut name = String::new();
    io::stdin().read_line(&mut name)?;
    Ok(name.trim().to_string())
}

/// Resolves `host:port` to a socket address (first match wins).
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().context("host resolved to no addresses")
}
