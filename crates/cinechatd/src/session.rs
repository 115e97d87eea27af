//! Server session logic: admission, rooms, chat fan-out, eviction.
//!
//! `ChatServer` is the transport-independent half of the server. The UDP
//! and TCP loops own the sockets; they hand every decoded-or-not frame to
//! [`ChatServer::handle_frame`] and every retransmission-timer firing to
//! [`ChatServer::handle_timer`], and write out the [`Outgoing`] frames
//! they get back. Keeping the logic in one place is what lets the two
//! transports interoperate at the frame level without duplicated state
//! machines.
//!
//! Per peer there are two possible records:
//!
//! - a **connected session** ([`PeerSession`]): a reliability link plus
//!   the username admitted into the directory. The username is the
//!   back-reference into the directory; the directory's `User` holds the
//!   peer address as the back-reference here.
//! - a **refused peer**: an address that tried to log in with a taken
//!   username. Kept separate so retries from the same address never
//!   pollute the directory; the record holds only the link for the
//!   refusal exchange and the last refused name.
//!
//! Every inbound non-ACK frame is acknowledged *before* any processing —
//! even duplicates, unknown peers, or requests that turn out to be
//! no-ops — so a peer whose ACK got lost is always unblocked.

use crate::directory::Directory;
use cinechat_core::codec::{Frame, MessageType, Payload};
use cinechat_core::reliability::{ack_bytes, Inbound, ReliableLink, TimerAction};
use cinechat_core::types::{RoomRef, Username};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// A frame to put on the wire.
///
/// `timer` carries the sequence to schedule a retransmission check for,
/// [`cinechat_core::reliability::RETRANSMIT_INTERVAL`] from now; ACKs are
/// fire-and-forget and carry `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
    pub timer: Option<u64>,
}

/// Per-peer state for a logged-in user.
#[derive(Debug)]
struct PeerSession {
    username: String,
    link: ReliableLink,
}

/// Per-address state for a peer whose login was refused.
#[derive(Debug)]
struct RefusedPeer {
    name: String,
    link: ReliableLink,
}

/// The server-side protocol state machine.
pub struct ChatServer {
    directory: Directory,
    connected: HashMap<SocketAddr, PeerSession>,
    refused: HashMap<SocketAddr, RefusedPeer>,
}

impl ChatServer {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            connected: HashMap::new(),
            refused: HashMap::new(),
        }
    }

    /// Read access to the directory (stats, tests).
    #[allow(dead_code)]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Whether an address currently has a logged-in session.
    #[allow(dead_code)]
    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.connected.contains_key(&addr)
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    /// Processes one raw frame from `from`.
    ///
    /// Undecodable bytes are dropped without an ACK: retransmission will
    /// bring the frame back intact, and acknowledging garbage would make
    /// the sender advance past a frame that was never processed.
    pub fn handle_frame(&mut self, from: SocketAddr, bytes: &[u8]) -> Vec<Outgoing> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping undecodable frame");
                return Vec::new();
            }
        };

        match frame.payload {
            Payload::Ack => self.on_ack(from, frame.sequence),
            Payload::Connect { username } => {
                let mut out = vec![Outgoing {
                    to: from,
                    bytes: ack_bytes(frame.sequence),
                    timer: None,
                }];
                out.extend(self.on_connect(from, frame.sequence, username));
                out
            }
            payload => {
                let mut out = vec![Outgoing {
                    to: from,
                    bytes: ack_bytes(frame.sequence),
                    timer: None,
                }];
                out.extend(self.on_session_frame(from, frame.sequence, payload));
                out
            }
        }
    }

    /// A peer stopped acknowledging and the retry budget ran out, or a
    /// TCP connection dropped: treat as an involuntary LEAVE_APP.
    pub fn handle_disconnect(&mut self, peer: SocketAddr) -> Vec<Outgoing> {
        self.refused.remove(&peer);
        if self.connected.contains_key(&peer) {
            info!(%peer, "peer disconnected");
            return self.evict(peer);
        }
        Vec::new()
    }

    /// Handles a retransmission timer scheduled for `(peer, seq)`.
    pub fn handle_timer(&mut self, peer: SocketAddr, seq: u64) -> Vec<Outgoing> {
        if let Some(session) = self.connected.get_mut(&peer) {
            return match session.link.on_timer(seq) {
                TimerAction::Settled => Vec::new(),
                TimerAction::Resend(bytes) => {
                    debug!(%peer, seq, "retransmitting");
                    vec![Outgoing {
                        to: peer,
                        bytes,
                        timer: Some(seq),
                    }]
                }
                TimerAction::Exhausted => {
                    warn!(%peer, user = %session.username, "peer stopped acknowledging, evicting");
                    self.evict(peer)
                }
            };
        }

        if let Some(peer_state) = self.refused.get_mut(&peer) {
            return match peer_state.link.on_timer(seq) {
                TimerAction::Settled => Vec::new(),
                TimerAction::Resend(bytes) => vec![Outgoing {
                    to: peer,
                    bytes,
                    timer: Some(seq),
                }],
                TimerAction::Exhausted => {
                    debug!(%peer, "refused peer never acknowledged, dropping");
                    self.refused.remove(&peer);
                    Vec::new()
                }
            };
        }

        Vec::new()
    }

    // -----------------------------------------------------------------------
    // Message handling
    // -----------------------------------------------------------------------

    fn on_ack(&mut self, from: SocketAddr, seq: u16) -> Vec<Outgoing> {
        if let Some(session) = self.connected.get_mut(&from) {
            let outcome = session.link.handle_ack(seq);
            return outcome
                .next
                .map(|t| Outgoing {
                    to: from,
                    bytes: t.bytes,
                    timer: Some(t.seq),
                })
                .into_iter()
                .collect();
        }

        if let Some(peer) = self.refused.get_mut(&from) {
            let outcome = peer.link.handle_ack(seq);
            if outcome.acked == Some(MessageType::ConnectRefuse) && peer.link.outstanding() == 0 {
                // The refusal arrived; the exchange with this address is over.
                debug!(%from, "refusal delivered");
                self.refused.remove(&from);
                return Vec::new();
            }
            return outcome
                .next
                .map(|t| Outgoing {
                    to: from,
                    bytes: t.bytes,
                    timer: Some(t.seq),
                })
                .into_iter()
                .collect();
        }

        debug!(%from, "ACK from unknown peer");
        Vec::new()
    }

    fn on_connect(&mut self, from: SocketAddr, seq: u16, username: String) -> Vec<Outgoing> {
        if let Some(session) = self.connected.get_mut(&from) {
            // A live session re-sent its CONNECT (our ACK was lost, or the
            // client is confused). The ACK already queued is all it gets.
            let _ = session.link.classify_inbound(seq);
            debug!(%from, "CONNECT from an already-connected address");
            return Vec::new();
        }

        if username.len() > Username::MAX_BYTES {
            // Such a name could never be carried in a user-list record.
            warn!(%from, len = username.len(), "CONNECT with oversized username, ignoring");
            return Vec::new();
        }

        if self.directory.user_exists(&username) {
            return self.refuse(from, seq, username);
        }

        // Admission: fresh link, user into the main room, then the welcome
        // sequence. CONNECT_ACCEPT goes on the wire now; MOVIE_LIST and the
        // USER_LIST broadcast queue behind it and drain as ACKs arrive.
        self.refused.remove(&from);
        info!(%from, user = %username, "admitting user");

        let mut session = PeerSession {
            username: username.clone(),
            link: ReliableLink::new(),
        };
        let _ = session.link.classify_inbound(seq);

        self.directory.add_user(username, RoomRef::MainRoom, from);

        let mut out = Vec::new();
        if let Some(t) = session.link.enqueue(Payload::ConnectAccept) {
            out.push(Outgoing {
                to: from,
                bytes: t.bytes,
                timer: Some(t.seq),
            });
        }
        let catalog = self.directory.movies().to_vec();
        let _ = session.link.enqueue(Payload::MovieList(catalog));

        self.connected.insert(from, session);
        out.extend(self.broadcast_main_room());
        out
    }

    /// Answers a CONNECT for an already-taken name, idempotently per
    /// address: a retransmitted CONNECT is absorbed by the refusal link's
    /// duplicate detection instead of queueing a second CONNECT_REFUSE.
    fn refuse(&mut self, from: SocketAddr, seq: u16, username: String) -> Vec<Outgoing> {
        let peer = match self.refused.entry(from) {
            Entry::Occupied(mut entry) => {
                if entry.get().name == username {
                    if entry.get_mut().link.classify_inbound(seq) != Inbound::Deliver {
                        debug!(%from, "retransmitted CONNECT for an already-refused name");
                        return Vec::new();
                    }
                } else {
                    // Same address, new name, still taken: a fresh login
                    // attempt, so the exchange starts over.
                    let mut link = ReliableLink::new();
                    let _ = link.classify_inbound(seq);
                    *entry.get_mut() = RefusedPeer {
                        name: username.clone(),
                        link,
                    };
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                let mut link = ReliableLink::new();
                let _ = link.classify_inbound(seq);
                entry.insert(RefusedPeer {
                    name: username.clone(),
                    link,
                })
            }
        };

        info!(%from, user = %username, "username taken, refusing login");
        peer.link
            .enqueue(Payload::ConnectRefuse)
            .map(|t| Outgoing {
                to: from,
                bytes: t.bytes,
                timer: Some(t.seq),
            })
            .into_iter()
            .collect()
    }

    /// Dispatches a non-CONNECT request from a logged-in peer, applying
    /// the per-direction duplicate suppression first.
    fn on_session_frame(&mut self, from: SocketAddr, seq: u16, payload: Payload) -> Vec<Outgoing> {
        let Some(session) = self.connected.get_mut(&from) else {
            debug!(%from, "frame from an address with no session, ignoring");
            return Vec::new();
        };

        match session.link.classify_inbound(seq) {
            Inbound::Deliver => {}
            Inbound::Duplicate => {
                debug!(%from, seq, "duplicate frame, re-acked and dropped");
                return Vec::new();
            }
            Inbound::OutOfOrder => {
                debug!(%from, seq, expected = session.link.expected_inbound(), "frame ahead of window, dropped");
                return Vec::new();
            }
        }

        let username = session.username.clone();
        match payload {
            Payload::LeaveApp => self.on_leave_app(from, &username),
            Payload::SelectMovie { title } => self.on_select_movie(&username, &title),
            Payload::LeaveMovieRoom => self.on_leave_movie_room(&username),
            Payload::Chat { sender, text } => self.on_chat(from, &username, sender, text),
            other => {
                warn!(%from, kind = ?other.message_type(), "client sent a server-only message, ignoring");
                Vec::new()
            }
        }
    }

    fn on_leave_app(&mut self, from: SocketAddr, username: &str) -> Vec<Outgoing> {
        info!(user = %username, "LEAVE_APP");
        self.connected.remove(&from);
        if let Some(RoomRef::Movie(title)) = self.directory.user_by_name(username).map(|u| u.room.clone()) {
            self.directory.stop_streaming(&title);
        }
        self.directory.remove_user(username);
        self.broadcast_main_room()
    }

    fn on_select_movie(&mut self, username: &str, title: &str) -> Vec<Outgoing> {
        if self.directory.movie_by_title(title).is_none() {
            warn!(user = %username, movie = %title, "SELECT_MOVIE for a title not in the catalog");
            return Vec::new();
        }
        info!(user = %username, movie = %title, "joining movie room");

        self.directory
            .update_user_room(username, RoomRef::Movie(title.to_string()));
        self.directory.start_streaming(title);
        self.room_change_broadcasts(title)
    }

    fn on_leave_movie_room(&mut self, username: &str) -> Vec<Outgoing> {
        match self.directory.user_by_name(username).map(|u| u.room.clone()) {
            Some(RoomRef::Movie(title)) => {
                info!(user = %username, movie = %title, "back to the main room");
                self.directory.stop_streaming(&title);
                self.directory.update_user_room(username, RoomRef::MainRoom);
                self.room_change_broadcasts(&title)
            }
            Some(RoomRef::MainRoom) => {
                debug!(user = %username, "LEAVE_MOVIE_ROOM while already in the main room");
                self.broadcast_main_room()
            }
            None => Vec::new(),
        }
    }

    /// Relays a chat line to every *other* peer in the sender's room.
    fn on_chat(&mut self, from: SocketAddr, username: &str, sender: String, text: String) -> Vec<Outgoing> {
        let Some(room) = self.directory.user_by_name(username).map(|u| u.room.clone()) else {
            return Vec::new();
        };
        debug!(user = %username, room = %room, "chat fan-out");

        let targets: Vec<SocketAddr> = self
            .connected
            .iter()
            .filter(|(addr, _)| **addr != from)
            .filter(|(_, s)| {
                self.directory
                    .user_by_name(&s.username)
                    .is_some_and(|u| u.room == room)
            })
            .map(|(addr, _)| *addr)
            .collect();

        targets
            .into_iter()
            .filter_map(|addr| {
                self.send_to(
                    addr,
                    Payload::Chat {
                        sender: sender.clone(),
                        text: text.clone(),
                    },
                )
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Broadcasts
    // -----------------------------------------------------------------------

    /// Sends the full user list to every peer in the main room.
    fn broadcast_main_room(&mut self) -> Vec<Outgoing> {
        let entries = self.directory.all_user_entries();
        let targets: Vec<SocketAddr> = self
            .connected
            .iter()
            .filter(|(_, s)| {
                self.directory
                    .user_by_name(&s.username)
                    .is_some_and(|u| u.room.is_main())
            })
            .map(|(addr, _)| *addr)
            .collect();

        targets
            .into_iter()
            .filter_map(|addr| self.send_to(addr, Payload::UserList(entries.clone())))
            .collect()
    }

    /// After a room transition touching `title`: main-room peers get the
    /// full list, peers in that movie room get the room's list.
    fn room_change_broadcasts(&mut self, title: &str) -> Vec<Outgoing> {
        let all = self.directory.all_user_entries();
        let in_room = self.directory.user_entries_in_movie(title);

        let mut plan: Vec<(SocketAddr, Payload)> = Vec::new();
        for (addr, session) in &self.connected {
            let Some(user) = self.directory.user_by_name(&session.username) else {
                continue;
            };
            match &user.room {
                RoomRef::MainRoom => plan.push((*addr, Payload::UserList(all.clone()))),
                RoomRef::Movie(t) if t == title => {
                    plan.push((*addr, Payload::UserList(in_room.clone())));
                }
                RoomRef::Movie(_) => {}
            }
        }

        plan.into_iter()
            .filter_map(|(addr, payload)| self.send_to(addr, payload))
            .collect()
    }

    /// Enqueues a payload on a peer's link, returning the wire order if
    /// the window was free (otherwise the frame drains later via ACKs).
    fn send_to(&mut self, addr: SocketAddr, payload: Payload) -> Option<Outgoing> {
        let session = self.connected.get_mut(&addr)?;
        session.link.enqueue(payload).map(|t| Outgoing {
            to: addr,
            bytes: t.bytes,
            timer: Some(t.seq),
        })
    }

    /// Involuntary departure: directory removal plus the same broadcasts
    /// a voluntary leave of the peer's room would have produced.
    fn evict(&mut self, peer: SocketAddr) -> Vec<Outgoing> {
        let Some(session) = self.connected.remove(&peer) else {
            return Vec::new();
        };
        let room = self
            .directory
            .user_by_name(&session.username)
            .map(|u| u.room.clone());
        if let Some(RoomRef::Movie(title)) = &room {
            self.directory.stop_streaming(title);
        }
        self.directory.remove_user(&session.username);

        match room {
            Some(RoomRef::Movie(title)) => self.room_change_broadcasts(&title),
            _ => self.broadcast_main_room(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cinechat_core::types::{Movie, RoomStatus, UserEntry};
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn server() -> ChatServer {
        ChatServer::new(Directory::new(vec![
            Movie {
                id: 1,
                title: "The Matrix".to_string(),
                ip: Ipv4Addr::new(239, 0, 0, 1),
                port: 8080,
            },
            Movie {
                id: 2,
                title: "Metropolis".to_string(),
                ip: Ipv4Addr::new(239, 0, 0, 2),
                port: 8081,
            },
        ]))
    }

    fn frame(out: &Outgoing) -> Frame {
        Frame::decode(&out.bytes).unwrap()
    }

    /// Plays the role of perfectly-behaved clients: acknowledges every
    /// tracked frame the server emitted until all outboxes drain, and
    /// returns every non-ACK frame each address received.
    fn settle(server: &mut ChatServer, initial: Vec<Outgoing>) -> Vec<(SocketAddr, Frame)> {
        let mut queue = initial;
        let mut seen = Vec::new();
        let mut at = 0;
        while at < queue.len() {
            let out = queue[at].clone();
            at += 1;
            let f = frame(&out);
            if f.payload == Payload::Ack {
                continue;
            }
            seen.push((out.to, f.clone()));
            let ack = Frame::new(f.sequence, Payload::Ack).encode();
            queue.extend(server.handle_frame(out.to, &ack));
        }
        seen
    }

    fn login(server: &mut ChatServer, from: SocketAddr, name: &str) {
        let connect = Frame::new(
            0,
            Payload::Connect {
                username: name.to_string(),
            },
        )
        .encode();
        let out = server.handle_frame(from, &connect);
        settle(server, out);
    }

    fn send(server: &mut ChatServer, from: SocketAddr, seq: u16, payload: Payload) -> Vec<Outgoing> {
        server.handle_frame(from, &Frame::new(seq, payload).encode())
    }

    #[test]
    fn login_accept_sequence() {
        // Empty directory, alice logs in.
        let mut server = server();
        let alice = addr(4000);

        let out = send(
            &mut server,
            alice,
            0,
            Payload::Connect {
                username: "alice".to_string(),
            },
        );

        // The ACK goes first, before any processing; CONNECT_ACCEPT rides
        // sequence 0; the rest waits for the stop-and-wait window.
        assert_eq!(frame(&out[0]), Frame::new(0, Payload::Ack));
        assert_eq!(out[0].timer, None);
        assert_eq!(frame(&out[1]), Frame::new(0, Payload::ConnectAccept));
        assert_eq!(out[1].timer, Some(0));
        assert_eq!(out.len(), 2);

        // As alice acknowledges, MOVIE_LIST(1) then USER_LIST(2) drain out.
        let delivered = settle(&mut server, out);
        let frames: Vec<&Frame> = delivered.iter().map(|(_, f)| f).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, Payload::ConnectAccept);
        assert_eq!(frames[1].sequence, 1);
        assert!(matches!(&frames[1].payload, Payload::MovieList(m) if m.len() == 2));
        assert_eq!(frames[2].sequence, 2);
        assert_eq!(
            frames[2].payload,
            Payload::UserList(vec![UserEntry {
                name: "alice".to_string(),
                status: RoomStatus::MainRoom,
            }])
        );

        assert!(server.directory().user_exists("alice"));
        assert!(server.is_connected(alice));
    }

    #[test]
    fn login_refuse_keeps_directory_unchanged() {
        // "alice" is taken; a second client tries the same name.
        let mut server = server();
        login(&mut server, addr(4000), "alice");

        let bob = addr(4001);
        let out = send(
            &mut server,
            bob,
            0,
            Payload::Connect {
                username: "alice".to_string(),
            },
        );

        assert_eq!(frame(&out[0]), Frame::new(0, Payload::Ack));
        assert_eq!(frame(&out[1]), Frame::new(0, Payload::ConnectRefuse));
        assert_eq!(out.len(), 2);

        assert_eq!(server.directory().users().len(), 1);
        assert!(!server.is_connected(bob));
    }

    #[test]
    fn retransmitted_refused_connect_gets_one_ack_and_no_second_refuse() {
        let mut server = server();
        login(&mut server, addr(4000), "alice");

        let bob = addr(4001);
        let connect = Payload::Connect {
            username: "alice".to_string(),
        };
        send(&mut server, bob, 0, connect.clone());

        // The CONNECT_REFUSE got lost; bob retransmits the CONNECT.
        let out = send(&mut server, bob, 0, connect);
        assert_eq!(out.len(), 1);
        assert_eq!(frame(&out[0]), Frame::new(0, Payload::Ack));
    }

    #[test]
    fn refused_address_can_retry_with_a_fresh_name() {
        let mut server = server();
        login(&mut server, addr(4000), "alice");

        let bob = addr(4001);
        send(
            &mut server,
            bob,
            0,
            Payload::Connect {
                username: "alice".to_string(),
            },
        );

        let out = send(
            &mut server,
            bob,
            0,
            Payload::Connect {
                username: "bob".to_string(),
            },
        );
        assert_eq!(frame(&out[1]), Frame::new(0, Payload::ConnectAccept));
        assert!(server.is_connected(bob));
        assert!(server.directory().user_exists("bob"));
    }

    #[test]
    fn duplicate_connect_from_live_session_is_idempotent() {
        let mut server = server();
        let alice = addr(4000);
        login(&mut server, alice, "alice");

        let out = send(
            &mut server,
            alice,
            0,
            Payload::Connect {
                username: "alice".to_string(),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(frame(&out[0]), Frame::new(0, Payload::Ack));
        assert_eq!(server.directory().users().len(), 1);
    }

    #[test]
    fn chat_fans_out_to_the_room_only() {
        // alice, bob, and carol in the main room; dave in a movie room.
        let mut server = server();
        let (alice, bob, carol, dave) = (addr(1), addr(2), addr(3), addr(4));
        login(&mut server, alice, "alice");
        login(&mut server, bob, "bob");
        login(&mut server, carol, "carol");
        login(&mut server, dave, "dave");
        let out = send(
            &mut server,
            dave,
            1,
            Payload::SelectMovie {
                title: "The Matrix".to_string(),
            },
        );
        settle(&mut server, out);

        let out = send(
            &mut server,
            alice,
            1,
            Payload::Chat {
                sender: "alice".to_string(),
                text: "hi".to_string(),
            },
        );

        assert_eq!(frame(&out[0]), Frame::new(1, Payload::Ack));
        let chats: Vec<&Outgoing> = out[1..].iter().collect();
        let mut targets: Vec<SocketAddr> = chats.iter().map(|o| o.to).collect();
        targets.sort();
        assert_eq!(targets, vec![bob, carol]);
        for chat in chats {
            assert_eq!(
                frame(chat).payload,
                Payload::Chat {
                    sender: "alice".to_string(),
                    text: "hi".to_string(),
                }
            );
        }
    }

    #[test]
    fn duplicate_chat_produces_one_ack_and_no_fanout() {
        let mut server = server();
        let (alice, bob) = (addr(1), addr(2));
        login(&mut server, alice, "alice");
        login(&mut server, bob, "bob");

        let chat = Payload::Chat {
            sender: "alice".to_string(),
            text: "once".to_string(),
        };
        let out = send(&mut server, alice, 1, chat.clone());
        settle(&mut server, out);

        // Retransmission of the same sequence: ACK again, relay nothing.
        let out = send(&mut server, alice, 1, chat);
        assert_eq!(out.len(), 1);
        assert_eq!(frame(&out[0]), Frame::new(1, Payload::Ack));
    }

    #[test]
    fn select_movie_updates_room_and_both_views() {
        // alice joins "The Matrix"; bob stays in the main room.
        let mut server = server();
        let (alice, bob) = (addr(1), addr(2));
        login(&mut server, alice, "alice");
        login(&mut server, bob, "bob");

        let out = send(
            &mut server,
            alice,
            1,
            Payload::SelectMovie {
                title: "The Matrix".to_string(),
            },
        );

        assert_eq!(frame(&out[0]), Frame::new(1, Payload::Ack));
        assert_eq!(
            server.directory().user_by_name("alice").unwrap().room,
            RoomRef::Movie("The Matrix".to_string())
        );

        let delivered = settle(&mut server, out);
        let to_bob: Vec<_> = delivered.iter().filter(|(to, _)| *to == bob).collect();
        let to_alice: Vec<_> = delivered.iter().filter(|(to, _)| *to == alice).collect();

        // bob (main room) sees everyone, with alice marked as watching
        assert_eq!(
            to_bob.last().unwrap().1.payload,
            Payload::UserList(vec![
                UserEntry {
                    name: "alice".to_string(),
                    status: RoomStatus::Movie(1),
                },
                UserEntry {
                    name: "bob".to_string(),
                    status: RoomStatus::MainRoom,
                },
            ])
        );
        // alice (movie room) sees only that room
        assert_eq!(
            to_alice.last().unwrap().1.payload,
            Payload::UserList(vec![UserEntry {
                name: "alice".to_string(),
                status: RoomStatus::Movie(1),
            }])
        );
    }

    #[test]
    fn select_unknown_movie_is_a_no_op() {
        let mut server = server();
        let alice = addr(1);
        login(&mut server, alice, "alice");

        let out = send(
            &mut server,
            alice,
            1,
            Payload::SelectMovie {
                title: "Not In Catalog".to_string(),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(frame(&out[0]), Frame::new(1, Payload::Ack));
        assert!(server.directory().user_by_name("alice").unwrap().room.is_main());
    }

    #[test]
    fn leave_movie_room_returns_to_main_and_updates_both_rooms() {
        let mut server = server();
        let (alice, bob) = (addr(1), addr(2));
        login(&mut server, alice, "alice");
        login(&mut server, bob, "bob");
        let out = send(
            &mut server,
            alice,
            1,
            Payload::SelectMovie {
                title: "Metropolis".to_string(),
            },
        );
        settle(&mut server, out);
        let out = send(
            &mut server,
            bob,
            1,
            Payload::SelectMovie {
                title: "Metropolis".to_string(),
            },
        );
        settle(&mut server, out);

        let out = send(&mut server, alice, 2, Payload::LeaveMovieRoom);
        assert!(server.directory().user_by_name("alice").unwrap().room.is_main());

        let delivered = settle(&mut server, out);
        // alice is back in the main room and sees the full list
        let to_alice: Vec<_> = delivered.iter().filter(|(to, _)| *to == alice).collect();
        assert_eq!(
            to_alice.last().unwrap().1.payload,
            Payload::UserList(vec![
                UserEntry {
                    name: "alice".to_string(),
                    status: RoomStatus::MainRoom,
                },
                UserEntry {
                    name: "bob".to_string(),
                    status: RoomStatus::Movie(2),
                },
            ])
        );
        // bob, still watching, sees only that room, with alice gone from it
        let to_bob: Vec<_> = delivered.iter().filter(|(to, _)| *to == bob).collect();
        assert_eq!(
            to_bob.last().unwrap().1.payload,
            Payload::UserList(vec![UserEntry {
                name: "bob".to_string(),
                status: RoomStatus::Movie(2),
            }])
        );
    }

    #[test]
    fn leave_app_removes_user_and_notifies_main_room() {
        let mut server = server();
        let (alice, bob) = (addr(1), addr(2));
        login(&mut server, alice, "alice");
        login(&mut server, bob, "bob");

        let out = send(&mut server, alice, 1, Payload::LeaveApp);
        assert_eq!(frame(&out[0]), Frame::new(1, Payload::Ack));
        assert!(!server.directory().user_exists("alice"));
        assert!(!server.is_connected(alice));

        let delivered = settle(&mut server, out);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, bob);
        assert_eq!(
            delivered[0].1.payload,
            Payload::UserList(vec![UserEntry {
                name: "bob".to_string(),
                status: RoomStatus::MainRoom,
            }])
        );
    }

    #[test]
    fn retransmission_exhaustion_evicts_and_rebroadcasts() {
        // bob vanishes; after the retry budget the server gives up,
        // removes the user, and tells the remaining main-room peers.
        let mut server = server();
        let (alice, bob) = (addr(1), addr(2));
        login(&mut server, alice, "alice");
        login(&mut server, bob, "bob");

        // A chat from alice puts a frame in flight towards bob.
        let out = send(
            &mut server,
            alice,
            1,
            Payload::Chat {
                sender: "alice".to_string(),
                text: "anyone there?".to_string(),
            },
        );
        let to_bob = out.iter().find(|o| o.to == bob).expect("chat relayed to bob");
        let seq = to_bob.timer.expect("tracked frame");

        // Seven timer firings retransmit the identical bytes...
        for _ in 0..7 {
            let again = server.handle_timer(bob, seq);
            assert_eq!(again.len(), 1);
            assert_eq!(again[0].bytes, to_bob.bytes);
            assert_eq!(again[0].timer, Some(seq));
        }

        // ...the eighth declares bob gone.
        let out = server.handle_timer(bob, seq);
        assert!(!server.directory().user_exists("bob"));
        assert!(!server.is_connected(bob));

        let delivered = settle(&mut server, out);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, alice);
        assert_eq!(
            delivered[0].1.payload,
            Payload::UserList(vec![UserEntry {
                name: "alice".to_string(),
                status: RoomStatus::MainRoom,
            }])
        );
    }

    #[test]
    fn timer_after_ack_does_nothing() {
        // The frame was acknowledged before the timer fired.
        let mut server = server();
        let alice = addr(1);
        login(&mut server, alice, "alice");

        assert!(server.handle_timer(alice, 0).is_empty());
        assert!(server.handle_timer(alice, 2).is_empty());
    }

    #[test]
    fn tcp_disconnect_is_an_involuntary_leave() {
        let mut server = server();
        let (alice, bob) = (addr(1), addr(2));
        login(&mut server, alice, "alice");
        login(&mut server, bob, "bob");

        let out = server.handle_disconnect(alice);
        assert!(!server.directory().user_exists("alice"));

        let delivered = settle(&mut server, out);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, bob);
    }

    #[test]
    fn frame_from_unknown_peer_is_acked_and_ignored() {
        let mut server = server();
        let out = send(
            &mut server,
            addr(9),
            0,
            Payload::Chat {
                sender: "ghost".to_string(),
                text: "boo".to_string(),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(frame(&out[0]), Frame::new(0, Payload::Ack));
    }

    #[test]
    fn malformed_frame_is_dropped_without_ack() {
        let mut server = server();
        assert!(server.handle_frame(addr(9), &[0x00, 0x10, 0x00]).is_empty());
        // unknown type nibble
        assert!(server
            .handle_frame(addr(9), &[0x00, 0x04, 0x00, 0x0F])
            .is_empty());
    }
}
