//! TCP transport loop for the server.
//!
//! The stream variant of the protocol carries the same frames as UDP but
//! needs reassembly: a read may end mid-frame or contain several frames.
//! Each accepted connection gets a reader task with its own
//! [`StreamFramer`]; complete frames are forwarded to the central loop,
//! which owns the `ChatServer` and all write halves. As with UDP, one
//! task mutates all protocol state, and retransmission timers post
//! `(peer, seq)` keys back into the same loop.
//!
//! Retransmission over TCP looks redundant — the stream is reliable —
//! but the two transports interoperate at the frame level and share the
//! acknowledgement machinery, so the server behaves identically on both:
//! a client that stops acknowledging is evicted either way.

use crate::session::{ChatServer, Outgoing};
use cinechat_core::framer::{write_frame, StreamFramer};
use cinechat_core::reliability::RETRANSMIT_INTERVAL;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events the per-connection reader tasks feed into the central loop.
enum ConnEvent {
    /// A complete frame arrived from this peer.
    Frame(SocketAddr, Vec<u8>),
    /// The connection closed or its stream went corrupt.
    Closed(SocketAddr),
}

/// Runs the TCP server loop forever.
pub async fn run(listener: TcpListener, mut server: ChatServer) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "TCP chat server listening"),
        Err(e) => warn!(error = %e, "TCP listener has no local address"),
    }

    let (event_tx, mut event_rx) = mpsc::channel::<ConnEvent>(256);
    let (timer_tx, mut timer_rx) = mpsc::channel::<(SocketAddr, u64)>(256);
    let mut writers: HashMap<SocketAddr, OwnedWriteHalf> = HashMap::new();

    loop {
        let outgoing = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted TCP connection");
                    let (read_half, write_half) = stream.into_split();
                    writers.insert(peer, write_half);
                    tokio::spawn(read_loop(read_half, peer, event_tx.clone()));
                    continue;
                }
                Err(e) => {
                    // Accept errors are usually transient (fd exhaustion);
                    // back off briefly instead of crashing the server.
                    error!(error = %e, "failed to accept TCP connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            Some(event) = event_rx.recv() => match event {
                ConnEvent::Frame(peer, bytes) => server.handle_frame(peer, &bytes),
                ConnEvent::Closed(peer) => {
                    writers.remove(&peer);
                    server.handle_disconnect(peer)
                }
            },
            Some((peer, seq)) = timer_rx.recv() => server.handle_timer(peer, seq),
        };

        send_all(&mut writers, &timer_tx, outgoing).await;
    }
}

/// Writes a batch of outgoing frames and schedules their timers.
///
/// A frame for a peer whose connection already went away is dropped; the
/// disconnect event has either been processed (the session is gone) or is
/// about to be.
async fn send_all(
    writers: &mut HashMap<SocketAddr, OwnedWriteHalf>,
    timer_tx: &mpsc::Sender<(SocketAddr, u64)>,
    outgoing: Vec<Outgoing>,
) {
    for out in outgoing {
        match writers.get_mut(&out.to) {
            Some(writer) => {
                if let Err(e) = write_frame(writer, &out.bytes).await {
                    warn!(peer = %out.to, error = %e, "failed to write frame");
                }
            }
            None => debug!(peer = %out.to, "dropping frame for a closed connection"),
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

/// Reads one connection until EOF, forwarding reassembled frames.
async fn read_loop(mut read_half: OwnedReadHalf, peer: SocketAddr, events: mpsc::Sender<ConnEvent>) {
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 4096];

    'conn: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!(%peer, "peer closed the connection");
                break 'conn;
            }
            Ok(n) => {
                framer.extend(&buf[..n]);
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) => {
                            if events.send(ConnEvent::Frame(peer, frame)).await.is_err() {
                                // Server loop is gone; nothing left to do.
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%peer, error = %e, "corrupt stream, dropping connection");
                            break 'conn;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "connection read error");
                break 'conn;
            }
        }
    }

    let _ = events.send(ConnEvent::Closed(peer)).await;
}
