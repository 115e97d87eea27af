//! Client network loops.
//!
//! One task owns the socket, the `ClientSession`, and the retransmission
//! timers; the front end talks to it through channels ([`Command`] in,
//! [`UiEvent`] out). As on the server, timers are sleeps that post the
//! `(seq)` key back into the loop, and all protocol state changes happen
//! on this single task.
//!
//! The loop ends when the session raises [`UiEvent::ApplicationQuit`]
//! (refused login, server gone, or our LEAVE_APP acknowledged) or when
//! the front end goes away.

use crate::event::UiEvent;
use crate::session::{ClientSession, Command, Step};
use cinechat_core::framer::{write_frame, StreamFramer};
use cinechat_core::reliability::RETRANSMIT_INTERVAL;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Largest datagram we accept; a frame's length field is a `u16`.
const MAX_DATAGRAM: usize = 65_536;

/// Errors that can occur while setting up or running the network loop.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to bind local UDP socket: {0}")]
    Bind(std::io::Error),

    #[error("failed to connect to server at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// A connected UDP socket that randomly drops outgoing datagrams.
struct LossySocket {
    socket: UdpSocket,
    loss_probability: f64,
}

impl LossySocket {
    async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        if self.loss_probability > 0.0 && rand::random::<f64>() < self.loss_probability {
            debug!(len = bytes.len(), "simulated loss, dropping outgoing datagram");
            return Ok(());
        }
        self.socket.send(bytes).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv(buf).await
    }
}

/// Runs the UDP client loop until the session is over.
pub async fn run_udp(
    server: SocketAddr,
    loss_probability: f64,
    mut commands: mpsc::Receiver<Command>,
    ui: mpsc::Sender<UiEvent>,
) -> Result<(), NetError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(NetError::Bind)?;
    socket
        .connect(server)
        .await
        .map_err(|e| NetError::Connect {
            addr: server,
            source: e,
        })?;
    debug!(%server, "UDP socket ready");

    let socket = LossySocket {
        socket,
        loss_probability,
    };
    let mut session = ClientSession::new();
    let (timer_tx, mut timer_rx) = mpsc::channel::<u64>(64);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let step = tokio::select! {
            received = socket.recv(&mut buf) => match received {
                Ok(len) => session.handle_frame(&buf[..len]),
                Err(e) => {
                    // Commonly an ICMP unreachable surfacing; the
                    // retransmission machinery deals with real loss.
                    debug!(error = %e, "UDP receive error");
                    continue;
                }
            },
            command = commands.recv() => match command {
                Some(command) => session.handle_command(command),
                None => return Ok(()), // front end is gone
            },
            Some(seq) = timer_rx.recv() => session.handle_timer(seq),
        };

        for out in &step.sends {
            if let Err(e) = socket.send(&out.bytes).await {
                warn!(error = %e, "failed to send datagram");
            }
            schedule(&timer_tx, out.timer);
        }
        if forward_events(&ui, step).await {
            return Ok(());
        }
    }
}

/// Runs the TCP client loop until the session is over.
pub async fn run_tcp(
    server: SocketAddr,
    mut commands: mpsc::Receiver<Command>,
    ui: mpsc::Sender<UiEvent>,
) -> Result<(), NetError> {
    let stream = TcpStream::connect(server)
        .await
        .map_err(|e| NetError::Connect {
            addr: server,
            source: e,
        })?;
    debug!(%server, "TCP connection established");

    let (mut read_half, mut write_half) = stream.into_split();
    let mut session = ClientSession::new();
    let mut framer = StreamFramer::new();
    let (timer_tx, mut timer_rx) = mpsc::channel::<u64>(64);
    let mut buf = vec![0u8; 4096];

    loop {
        let steps: Vec<Step> = tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    warn!("server closed the connection");
                    let _ = ui.send(UiEvent::ConnectionRejected {
                        reason: "server closed the connection".to_string(),
                    }).await;
                    let _ = ui.send(UiEvent::ApplicationQuit).await;
                    return Ok(());
                }
                Ok(n) => {
                    framer.extend(&buf[..n]);
                    let mut steps = Vec::new();
                    loop {
                        match framer.next_frame() {
                            Ok(Some(frame)) => steps.push(session.handle_frame(&frame)),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "corrupt stream from server");
                                let _ = ui.send(UiEvent::ConnectionRejected {
                                    reason: "corrupt stream from server".to_string(),
                                }).await;
                                let _ = ui.send(UiEvent::ApplicationQuit).await;
                                return Ok(());
                            }
                        }
                    }
                    steps
                }
                Err(e) => {
                    warn!(error = %e, "connection read error");
                    let _ = ui.send(UiEvent::ApplicationQuit).await;
                    return Ok(());
                }
            },
            command = commands.recv() => match command {
                Some(command) => vec![session.handle_command(command)],
                None => return Ok(()),
            },
            Some(seq) = timer_rx.recv() => vec![session.handle_timer(seq)],
        };

        for step in steps {
            for out in &step.sends {
                if let Err(e) = write_frame(&mut write_half, &out.bytes).await {
                    warn!(error = %e, "failed to write frame");
                }
                schedule(&timer_tx, out.timer);
            }
            if forward_events(&ui, step).await {
                return Ok(());
            }
        }
    }
}

/// Schedules a retransmission check by posting the key back to the loop.
fn schedule(timer_tx: &mpsc::Sender<u64>, timer: Option<u64>) {
    if let Some(seq) = timer {
        let tx = timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRANSMIT_INTERVAL).await;
            let _ = tx.send(seq).await;
        });
    }
}

/// Forwards a step's events to the front end. Returns `true` when the
/// session asked to quit (the loop should end).
async fn forward_events(ui: &mpsc::Sender<UiEvent>, step: Step) -> bool {
    for event in step.events {
        let quit = event == UiEvent::ApplicationQuit;
        if ui.send(event).await.is_err() {
            return true; // front end is gone
        }
        if quit {
            return true;
        }
    }
    false
}
