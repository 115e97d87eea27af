//! Wire codec for the CineChat protocol.
//!
//! This module defines the messages exchanged between the CineChat client
//! and server, over UDP datagrams or a framed TCP stream.
//!
//! # Wire Format
//!
//! Each message is a **frame** with a fixed 4-byte header:
//!
//! ```text
//! +--------------------+--------------------------+------------------+
//! | Length (2 bytes)   | Seq (12 bits) | Type (4) | Payload          |
//! | big-endian u16     | big-endian u16 word      | (variable)       |
//! +--------------------+--------------------------+------------------+
//! ```
//!
//! `Length` covers the header plus the payload. The second word packs the
//! 12-bit sequence number and the 4-bit message type:
//! `word = (sequence << 4) | type`. The 12+4 split does not line up with
//! any native integer, so the header is treated as two big-endian `u16`s
//! and the fields are shifted out.
//!
//! # Message Types
//!
//! | Code | Message          | Payload                                     |
//! |------|------------------|---------------------------------------------|
//! | 0    | ACK              | empty                                       |
//! | 1    | CONNECT          | username (UTF-8, rest of frame)             |
//! | 2    | LEAVE_APP        | empty                                       |
//! | 3    | SELECT_MOVIE     | movie title (UTF-8, rest of frame)          |
//! | 4    | LEAVE_MOVIE_ROOM | empty                                       |
//! | 5    | MOVIE_LIST       | concatenated movie records                  |
//! | 6    | USER_LIST        | concatenated user records                   |
//! | 7    | CONNECT_ACCEPT   | empty                                       |
//! | 8    | CONNECT_REFUSE   | empty                                       |
//! | 9    | CHAT             | `len:u8`, sender, text (rest of frame)      |
//!
//! A **movie record** is `ip(4×u8), port:u16, record_len:u16, id:u8,
//! title`, where `record_len` counts the whole record including itself
//! (9 bytes of fixed fields plus the title). A **user record** is
//! `name_len:u8, status:u8, name`, where status `0` means the main room
//! and any other value is a movie id.
//!
//! All integers are big-endian; all strings are UTF-8 with no trailing
//! NUL and no length prefix except where shown above.

use crate::types::{Movie, RoomStatus, UserEntry};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Size of the frame header: 2-byte length plus the packed seq/type word.
pub const HEADER_LEN: usize = 4;

/// The sequence number occupies 12 bits of the second header word.
pub const SEQ_MASK: u16 = 0x0FFF;

/// Fixed part of a movie record: ip (4) + port (2) + record_len (2) + id (1).
const MOVIE_RECORD_FIXED: usize = 9;

/// Errors that can occur while decoding a frame.
///
/// All of these mean the frame is unusable; per the protocol's error
/// model the receiver drops it silently (in particular, it must NOT be
/// acknowledged).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes, header needs {HEADER_LEN}")]
    Truncated(usize),

    #[error("declared length {declared} overruns the {available}-byte buffer")]
    LengthOverrun { declared: usize, available: usize },

    #[error("declared length {0} is shorter than the frame header")]
    LengthUnderrun(usize),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("truncated {0} field")]
    TruncatedField(&'static str),

    #[error("inconsistent {what} record length {len}")]
    BadRecordLength { what: &'static str, len: usize },

    #[error("invalid UTF-8 in {0} field")]
    Utf8(&'static str),
}

// ---------------------------------------------------------------------------
// Message types and payloads
// ---------------------------------------------------------------------------

/// The 4-bit message type carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ack = 0,
    Connect = 1,
    LeaveApp = 2,
    SelectMovie = 3,
    LeaveMovieRoom = 4,
    MovieList = 5,
    UserList = 6,
    ConnectAccept = 7,
    ConnectRefuse = 8,
    Chat = 9,
}

impl MessageType {
    /// The numeric code written to the wire.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decodes a type code. Returns `None` for the six unassigned values.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MessageType::Ack),
            1 => Some(MessageType::Connect),
            2 => Some(MessageType::LeaveApp),
            3 => Some(MessageType::SelectMovie),
            4 => Some(MessageType::LeaveMovieRoom),
            5 => Some(MessageType::MovieList),
            6 => Some(MessageType::UserList),
            7 => Some(MessageType::ConnectAccept),
            8 => Some(MessageType::ConnectRefuse),
            9 => Some(MessageType::Chat),
            _ => None,
        }
    }
}

/// A decoded frame payload.
///
/// Each variant corresponds to one message type; the empty control
/// messages carry no data beyond their type code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Acknowledges receipt of the frame with the same sequence number.
    Ack,
    /// Login request with the desired username.
    Connect { username: String },
    /// The user is leaving the application.
    LeaveApp,
    /// The user wants to join the chat room of this movie.
    SelectMovie { title: String },
    /// The user is going back to the main room.
    LeaveMovieRoom,
    /// The server's movie catalog.
    MovieList(Vec<Movie>),
    /// The users visible to the receiver, with their room status.
    UserList(Vec<UserEntry>),
    /// Login accepted; the user is now in the main room.
    ConnectAccept,
    /// Login refused (username already taken).
    ConnectRefuse,
    /// A chat line from `sender`.
    Chat { sender: String, text: String },
}

impl Payload {
    /// The message type this payload encodes as.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Ack => MessageType::Ack,
            Payload::Connect { .. } => MessageType::Connect,
            Payload::LeaveApp => MessageType::LeaveApp,
            Payload::SelectMovie { .. } => MessageType::SelectMovie,
            Payload::LeaveMovieRoom => MessageType::LeaveMovieRoom,
            Payload::MovieList(_) => MessageType::MovieList,
            Payload::UserList(_) => MessageType::UserList,
            Payload::ConnectAccept => MessageType::ConnectAccept,
            Payload::ConnectRefuse => MessageType::ConnectRefuse,
            Payload::Chat { .. } => MessageType::Chat,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A complete protocol frame: sequence number plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 12-bit sequence number (masked on encode).
    pub sequence: u16,
    pub payload: Payload,
}

impl Frame {
    /// Builds a frame, masking the sequence to its 12-bit wire width.
    pub fn new(sequence: u16, payload: Payload) -> Self {
        Self {
            sequence: sequence & SEQ_MASK,
            payload,
        }
    }

    /// Encodes this frame into a self-delimited byte buffer.
    ///
    /// Infallible: string lengths that feed one-byte prefixes are
    /// enforced by the types that produce them (`Username`).
    pub fn encode(&self) -> Vec<u8> {
        let payload = encode_payload(&self.payload);
        let length = (payload.len() + HEADER_LEN) as u16;
        let word = (self.sequence << 4) | u16::from(self.payload.message_type().code());

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&word.to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decodes one frame from the start of `bytes`.
    ///
    /// The declared length is authoritative: bytes past it (possible on a
    /// datagram transport with trailing garbage) are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated(bytes.len()));
        }
        let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if declared < HEADER_LEN {
            return Err(CodecError::LengthUnderrun(declared));
        }
        if declared > bytes.len() {
            return Err(CodecError::LengthOverrun {
                declared,
                available: bytes.len(),
            });
        }

        let word = u16::from_be_bytes([bytes[2], bytes[3]]);
        let sequence = word >> 4;
        let code = (word & 0xF) as u8;
        let kind = MessageType::from_code(code).ok_or(CodecError::UnknownType(code))?;

        let body = &bytes[HEADER_LEN..declared];
        let payload = decode_payload(kind, body)?;
        Ok(Self { sequence, payload })
    }
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

fn encode_payload(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Ack
        | Payload::LeaveApp
        | Payload::LeaveMovieRoom
        | Payload::ConnectAccept
        | Payload::ConnectRefuse => Vec::new(),

        Payload::Connect { username } => username.as_bytes().to_vec(),
        Payload::SelectMovie { title } => title.as_bytes().to_vec(),

        Payload::MovieList(movies) => {
            let mut buf = Vec::new();
            for movie in movies {
                debug_assert!(movie.title.len() <= Movie::MAX_TITLE_BYTES);
                // record_len counts the whole record, itself included
                let record_len = (MOVIE_RECORD_FIXED + movie.title.len()) as u16;
                buf.extend_from_slice(&movie.ip.octets());
                buf.extend_from_slice(&movie.port.to_be_bytes());
                buf.extend_from_slice(&record_len.to_be_bytes());
                buf.push(movie.id);
                buf.extend_from_slice(movie.title.as_bytes());
            }
            buf
        }

        Payload::UserList(users) => {
            let mut buf = Vec::new();
            for user in users {
                debug_assert!(user.name.len() <= u8::MAX as usize);
                buf.push(user.name.len() as u8);
                buf.push(user.status.code());
                buf.extend_from_slice(user.name.as_bytes());
            }
            buf
        }

        Payload::Chat { sender, text } => {
            debug_assert!(sender.len() <= u8::MAX as usize);
            let mut buf = Vec::with_capacity(1 + sender.len() + text.len());
            buf.push(sender.len() as u8);
            buf.extend_from_slice(sender.as_bytes());
            buf.extend_from_slice(text.as_bytes());
            buf
        }
    }
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

fn decode_payload(kind: MessageType, body: &[u8]) -> Result<Payload, CodecError> {
    match kind {
        MessageType::Ack => Ok(Payload::Ack),
        MessageType::LeaveApp => Ok(Payload::LeaveApp),
        MessageType::LeaveMovieRoom => Ok(Payload::LeaveMovieRoom),
        MessageType::ConnectAccept => Ok(Payload::ConnectAccept),
        MessageType::ConnectRefuse => Ok(Payload::ConnectRefuse),

        MessageType::Connect => Ok(Payload::Connect {
            username: utf8(body, "username")?,
        }),

        MessageType::SelectMovie => Ok(Payload::SelectMovie {
            title: utf8(body, "movie title")?,
        }),

        MessageType::MovieList => Ok(Payload::MovieList(decode_movie_records(body)?)),
        MessageType::UserList => Ok(Payload::UserList(decode_user_records(body)?)),

        MessageType::Chat => {
            let (&sender_len, rest) = body
                .split_first()
                .ok_or(CodecError::TruncatedField("chat sender length"))?;
            let sender_len = sender_len as usize;
            if rest.len() < sender_len {
                return Err(CodecError::TruncatedField("chat sender"));
            }
            let sender = utf8(&rest[..sender_len], "chat sender")?;
            let text = utf8(&rest[sender_len..], "chat text")?;
            Ok(Payload::Chat { sender, text })
        }
    }
}

fn decode_movie_records(body: &[u8]) -> Result<Vec<Movie>, CodecError> {
    let mut movies = Vec::new();
    let mut at = 0;
    while at < body.len() {
        let record = &body[at..];
        if record.len() < MOVIE_RECORD_FIXED {
            return Err(CodecError::TruncatedField("movie record"));
        }
        let record_len = u16::from_be_bytes([record[6], record[7]]) as usize;
        if record_len < MOVIE_RECORD_FIXED {
            return Err(CodecError::BadRecordLength {
                what: "movie",
                len: record_len,
            });
        }
        if record_len > record.len() {
            return Err(CodecError::TruncatedField("movie title"));
        }

        let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
        let port = u16::from_be_bytes([record[4], record[5]]);
        let id = record[8];
        let title = utf8(&record[MOVIE_RECORD_FIXED..record_len], "movie title")?;

        movies.push(Movie { id, title, ip, port });
        at += record_len;
    }
    Ok(movies)
}

fn decode_user_records(body: &[u8]) -> Result<Vec<UserEntry>, CodecError> {
    let mut users = Vec::new();
    let mut at = 0;
    while at < body.len() {
        let record = &body[at..];
        if record.len() < 2 {
            return Err(CodecError::TruncatedField("user record"));
        }
        let name_len = record[0] as usize;
        let status = RoomStatus::from_code(record[1]);
        if record.len() < 2 + name_len {
            return Err(CodecError::TruncatedField("user name"));
        }
        let name = utf8(&record[2..2 + name_len], "user name")?;

        users.push(UserEntry { name, status });
        at += 2 + name_len;
    }
    Ok(users)
}

fn utf8(bytes: &[u8], what: &'static str) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Utf8(what))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
