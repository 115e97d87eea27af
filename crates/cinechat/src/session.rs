//! Client session state machine.
//!
//! `ClientSession` is the client half of the protocol, kept free of I/O
//! the same way the server's session logic is: the transport loop in
//! `net.rs` owns the socket and the timers, feeds inbound frames and user
//! commands in, and executes the [`Step`]s that come back (frames to
//! write, timers to schedule, [`UiEvent`]s to render).
//!
//! Outbound requests ride the reliability link: login is the first frame
//! (sequence 0), every later user action takes the next sequence and
//! queues behind whatever is still unacknowledged. The client learns that
//! a request succeeded from the ACK alone — the link reports *which kind*
//! of frame was settled, and the session reacts (a settled SELECT_MOVIE
//! confirms the room change, a settled LEAVE_APP means we may exit).

use crate::event::UiEvent;
use cinechat_core::codec::{Frame, MessageType, Payload};
use cinechat_core::reliability::{ack_bytes, Inbound, ReliableLink, TimerAction};
use cinechat_core::types::{Movie, RoomRef, Username};
use tracing::{debug, warn};

/// A frame to write to the server; `timer` asks the driver to schedule a
/// retransmission check for that sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub bytes: Vec<u8>,
    pub timer: Option<u64>,
}

/// Everything one input (frame, command, or timer) caused.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub sends: Vec<Outgoing>,
    pub events: Vec<UiEvent>,
}

impl Step {
    fn none() -> Self {
        Self::default()
    }
}

/// A user action arriving from the front end.
#[derive(Debug, Clone)]
pub enum Command {
    /// Log in with this name. Must be the first command.
    Login(Username),
    /// Say something in the current room.
    Chat(String),
    /// Move to a movie room, or back to the main room.
    Join(RoomRef),
    /// Leave the application.
    Leave,
}

/// Protocol state for one client connection.
#[derive(Debug)]
pub struct ClientSession {
    link: ReliableLink,
    username: Option<Username>,
    /// The confirmed current room. Requests only move it once acknowledged.
    room: RoomRef,
    /// Movie room requested but not yet confirmed by an ACK.
    pending_room: Option<String>,
    movies: Vec<Movie>,
    /// The first user list in the main room completes the login.
    init_done: bool,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            link: ReliableLink::new(),
            username: None,
            room: RoomRef::MainRoom,
            pending_room: None,
            movies: Vec::new(),
            init_done: false,
        }
    }

    /// The confirmed current room.
    #[allow(dead_code)]
    pub fn room(&self) -> &RoomRef {
        &self.room
    }

    // -----------------------------------------------------------------------
    // Commands from the front end
    // -----------------------------------------------------------------------

    pub fn handle_command(&mut self, command: Command) -> Step {
        match command {
            Command::Login(name) => self.login(name),
            Command::Chat(text) => self.chat(text),
            Command::Join(room) => self.join_room(room),
            Command::Leave => self.leave_system(),
        }
    }

    /// Sends the CONNECT request; it always carries sequence 0.
    fn login(&mut self, name: Username) -> Step {
        debug!(user = %name, "sending login request");
        let payload = Payload::Connect {
            username: name.as_str().to_string(),
        };
        self.username = Some(name);
        self.enqueue(payload)
    }

    fn chat(&mut self, text: String) -> Step {
        let Some(name) = &self.username else {
            warn!("chat before login, ignoring");
            return Step::none();
        };
        self.enqueue(Payload::Chat {
            sender: name.as_str().to_string(),
            text,
        })
    }

    /// Requests a room change. Going to a movie is SELECT_MOVIE with the
    /// target remembered until the ACK confirms it; going back to the
    /// main room is LEAVE_MOVIE_ROOM.
    fn join_room(&mut self, room: RoomRef) -> Step {
        match room {
            RoomRef::MainRoom => self.enqueue(Payload::LeaveMovieRoom),
            RoomRef::Movie(title) => {
                self.pending_room = Some(title.clone());
                self.enqueue(Payload::SelectMovie { title })
            }
        }
    }

    fn leave_system(&mut self) -> Step {
        self.enqueue(Payload::LeaveApp)
    }

    fn enqueue(&mut self, payload: Payload) -> Step {
        let sends = self
            .link
            .enqueue(payload)
            .map(|t| Outgoing {
                bytes: t.bytes,
                timer: Some(t.seq),
            })
            .into_iter()
            .collect();
        Step {
            sends,
            events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    /// Processes one raw frame from the server.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Step {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return Step::none();
            }
        };

        match frame.payload {
            Payload::Ack => self.on_ack(frame.sequence),
            payload => {
                // ACK first, before any effect of the frame is visible.
                let mut step = Step {
                    sends: vec![Outgoing {
                        bytes: ack_bytes(frame.sequence),
                        timer: None,
                    }],
                    events: Vec::new(),
                };
                match self.link.classify_inbound(frame.sequence) {
                    Inbound::Deliver => self.on_message(payload, &mut step),
                    Inbound::Duplicate => {
                        debug!(seq = frame.sequence, "duplicate frame, re-acked and dropped");
                    }
                    Inbound::OutOfOrder => {
                        debug!(seq = frame.sequence, "frame ahead of window, dropped");
                    }
                }
                step
            }
        }
    }

    /// The server acknowledged our oldest outstanding frame; react to the
    /// kind of request that was settled and push out the next one.
    fn on_ack(&mut self, seq: u16) -> Step {
        let outcome = self.link.handle_ack(seq);
        let mut step = Step::none();

        match outcome.acked {
            Some(MessageType::LeaveApp) => {
                step.events.push(UiEvent::LeaveSystemOk);
            }
            Some(MessageType::SelectMovie) => {
                if let Some(title) = self.pending_room.take() {
                    self.room = RoomRef::Movie(title);
                }
                step.events.push(UiEvent::JoinRoomOk);
            }
            Some(MessageType::LeaveMovieRoom) => {
                self.room = RoomRef::MainRoom;
                step.events.push(UiEvent::JoinRoomOk);
            }
            Some(_) | None => {}
        }

        if let Some(next) = outcome.next {
            step.sends.push(Outgoing {
                bytes: next.bytes,
                timer: Some(next.seq),
            });
        }
        step
    }

    fn on_message(&mut self, payload: Payload, step: &mut Step) {
        match payload {
            Payload::ConnectAccept => {
                // We're in; the lists follow as their own frames.
                self.room = RoomRef::MainRoom;
            }

            Payload::MovieList(movies) => {
                debug!(count = movies.len(), "movie catalog received");
                self.movies = movies;
            }

            Payload::UserList(users) => self.on_user_list(users, step),

            Payload::ConnectRefuse => {
                // Terminal: the name is taken, this session won't recover.
                step.events.push(UiEvent::ConnectionRejected {
                    reason: "username already in use".to_string(),
                });
                step.events.push(UiEvent::ApplicationQuit);
            }

            Payload::Chat { sender, text } => {
                step.events.push(UiEvent::ChatMessage { sender, text });
            }

            other => {
                warn!(kind = ?other.message_type(), "server sent a client-only message, ignoring");
            }
        }
    }

    /// User lists mean different things depending on where we are: in the
    /// main room the first one completes the login and later ones refresh
    /// the view; in a movie room the list covers only that room and is
    /// surfaced as per-user updates.
    fn on_user_list(&mut self, users: Vec<cinechat_core::types::UserEntry>, step: &mut Step) {
        if self.room.is_main() {
            if self.init_done {
                step.events.push(UiEvent::UserList(users));
            } else {
                self.init_done = true;
                step.events.push(UiEvent::InitComplete {
                    users,
                    movies: self.movies.clone(),
                });
            }
        } else {
            step.events.push(UiEvent::UserList(Vec::new()));
            for user in users {
                step.events.push(UiEvent::UserUpdate {
                    name: user.name,
                    room: self.room.clone(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Handles a retransmission timer scheduled for `seq`.
    pub fn handle_timer(&mut self, seq: u64) -> Step {
        match self.link.on_timer(seq) {
            TimerAction::Settled => Step::none(),
            TimerAction::Resend(bytes) => {
                debug!(seq, "retransmitting");
                Step {
                    sends: vec![Outgoing {
                        bytes,
                        timer: Some(seq),
                    }],
                    events: Vec::new(),
                }
            }
            TimerAction::Exhausted => {
                warn!("server stopped responding, giving up");
                Step {
                    sends: Vec::new(),
                    events: vec![
                        UiEvent::ConnectionRejected {
                            reason: "server is not responding".to_string(),
                        },
                        UiEvent::ApplicationQuit,
                    ],
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
