//! UDP transport loop for the server.
//!
//! One task owns the socket and the whole `ChatServer`; every inbound
//! datagram (exactly one frame) and every retransmission timer is
//! processed on it, which serializes all protocol state changes without
//! locks. Timers are realized by spawning a sleep that posts a
//! `(peer, seq)` key back into the loop's channel; the reliability engine
//! re-checks the key when it arrives, so a stale timer is harmless.
//!
//! Outgoing datagrams pass through [`LossySocket`], which drops them with
//! the configured probability. The loss lives entirely in this wrapper:
//! protocol code never knows a frame was dropped, it just fails to see an
//! ACK and retransmits.

use crate::session::{ChatServer, Outgoing};
use cinechat_core::reliability::RETRANSMIT_INTERVAL;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Largest datagram we accept; a frame's length field is a `u16`.
const MAX_DATAGRAM: usize = 65_536;

/// A UDP socket that randomly drops outgoing datagrams.
pub struct LossySocket {
    socket: UdpSocket,
    loss_probability: f64,
}

impl LossySocket {
    pub fn new(socket: UdpSocket, loss_probability: f64) -> Self {
        Self {
            socket,
            loss_probability,
        }
    }

    /// Sends `bytes`, or silently pretends to when the dice say so.
    pub async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> std::io::Result<()> {
        if self.loss_probability > 0.0 && rand::random::<f64>() < self.loss_probability {
            debug!(peer = %to, len = bytes.len(), "simulated loss, dropping outgoing datagram");
            return Ok(());
        }
        self.socket.send_to(bytes, to).await.map(|_| ())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Runs the UDP server loop forever.
pub async fn run(socket: UdpSocket, loss_probability: f64, mut server: ChatServer) {
    match socket.local_addr() {
        Ok(addr) => info!(%addr, "UDP chat server listening"),
        Err(e) => warn!(error = %e, "UDP socket has no local address"),
    }

    let socket = LossySocket::new(socket, loss_probability);
    // Retransmission timers post back here; the sender side is cloned into
    // each spawned sleep, so the channel can never close under us.
    let (timer_tx, mut timer_rx) = mpsc::channel::<(SocketAddr, u64)>(256);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let outgoing = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => server.handle_frame(from, &buf[..len]),
                Err(e) => {
                    // Transient (ICMP port unreachable surfacing, etc.) —
                    // log and keep serving.
                    error!(error = %e, "UDP receive failed");
                    continue;
                }
            },
            Some((peer, seq)) = timer_rx.recv() => server.handle_timer(peer, seq),
        };

        send_all(&socket, &timer_tx, outgoing).await;
    }
}

/// Writes a batch of outgoing frames and schedules their timers.
async fn send_all(
    socket: &LossySocket,
    timer_tx: &mpsc::Sender<(SocketAddr, u64)>,
    outgoing: Vec<Outgoing>,
) {
    for out in outgoing {
        if let Err(e) = socket.send_to(&out.bytes, out.to).await {
            warn!(peer = %out.to, error = %e, "failed to send datagram");
        }
        if let Some(seq) = out.timer {
            let tx = timer_tx.clone();
            let peer = out.to;
            tokio::spawn(async move {
                tokio::time::sleep(RETRANSMIT_INTERVAL).await;
                let _ = tx.send((peer, seq)).await;
            });
        }
    }
}
