//! Domain types for CineChat.
//!
//! The wire format constrains several of these: usernames travel behind a
//! one-byte length prefix in CHAT frames and user-list records, so a
//! `Username` is validated to fit 255 bytes at construction time. Encoding
//! then never has to deal with an oversized name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

// ---------------------------------------------------------------------------
// Username — the identity a user logs in with
// ---------------------------------------------------------------------------

/// The pseudonym a user picks at login.
///
/// Uniqueness is enforced by the server at admission time, not here.
/// An empty name is accepted by the protocol; front ends may be stricter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

/// Errors that can occur when creating a `Username`.
#[derive(Debug, thiserror::Error)]
pub enum UsernameError {
    #[error("username cannot exceed {max} bytes (got {got})")]
    TooLong { max: usize, got: usize },
}

impl Username {
    /// Maximum encoded length in bytes — the wire format stores the name
    /// behind a `u8` length prefix.
    pub const MAX_BYTES: usize = 255;

    /// Creates a new `Username`, validating the encoded length.
    pub fn new(name: impl Into<String>) -> Result<Self, UsernameError> {
        let name = name.into();
        if name.len() > Self::MAX_BYTES {
            return Err(UsernameError::TooLong {
                max: Self::MAX_BYTES,
                got: name.len(),
            });
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Movie — a catalog entry the server offers for streaming
// ---------------------------------------------------------------------------

/// A movie in the server's catalog.
///
/// The address and port tell clients where the media stream for this title
/// would be served from; the chat protocol only carries them, it never
/// opens them.
///
/// Catalog entries deserialize straight from the config file, so the
/// title bound is checked by [`Movie::validate`] on the load path rather
/// than in a constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    /// Small numeric id; doubles as the room status byte in user lists.
    pub id: u8,
    /// Title shown to users; also the key for SELECT_MOVIE requests.
    pub title: String,
    /// IPv4 address of the stream source.
    pub ip: Ipv4Addr,
    /// Port of the stream source.
    pub port: u16,
}

/// Errors that can occur when validating a `Movie` catalog entry.
#[derive(Debug, thiserror::Error)]
pub enum MovieError {
    #[error("movie title cannot exceed {max} bytes (got {got})")]
    TitleTooLong { max: usize, got: usize },
}

impl Movie {
    /// Maximum encoded title length in bytes — a movie-list record's
    /// length field is a `u16` that also counts the record's 9 fixed
    /// bytes (ip, port, length, id).
    pub const MAX_TITLE_BYTES: usize = u16::MAX as usize - 9;

    /// Checks that this entry can be carried in a movie-list record.
    pub fn validate(&self) -> Result<(), MovieError> {
        if self.title.len() > Self::MAX_TITLE_BYTES {
            return Err(MovieError::TitleTooLong {
                max: Self::MAX_TITLE_BYTES,
                got: self.title.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Movie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.title, self.ip, self.port)
    }
}

// ---------------------------------------------------------------------------
// RoomRef — where a user currently is
// ---------------------------------------------------------------------------

/// A chat room reference: the shared lobby or a movie-specific room.
///
/// Movie rooms are keyed by title; the server's directory resolves the
/// title to a catalog entry when it needs the numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRef {
    /// The lobby every user lands in after login.
    MainRoom,
    /// The room attached to a single movie title.
    Movie(String),
}

impl RoomRef {
    /// Returns `true` for the main room.
    pub fn is_main(&self) -> bool {
        matches!(self, RoomRef::MainRoom)
    }
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomRef::MainRoom => write!(f, "main room"),
            RoomRef::Movie(title) => write!(f, "{title}"),
        }
    }
}

// ---------------------------------------------------------------------------
// UserEntry — one element of a decoded USER_LIST frame
// ---------------------------------------------------------------------------

/// The room status byte of a user-list record.
///
/// `0` on the wire means the main room; any other value is the id of the
/// movie whose room the user is in. The id is decoded and kept — clients
/// that only care about the main/movie distinction can ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    MainRoom,
    Movie(u8),
}

impl RoomStatus {
    /// The status byte written to the wire.
    pub fn code(self) -> u8 {
        match self {
            RoomStatus::MainRoom => 0,
            RoomStatus::Movie(id) => id,
        }
    }

    /// Decodes a status byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => RoomStatus::MainRoom,
            id => RoomStatus::Movie(id),
        }
    }
}

/// One user as reported by a USER_LIST frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub name: String,
    pub status: RoomStatus,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
