//! Events the protocol session raises for the user interface.
//!
//! The session state machine never talks to a screen directly; it emits
//! these events and the front end decides how to render them. The
//! terminal front end in `main.rs` prints them as lines; a graphical
//! client would feed them to its widgets instead.

use cinechat_core::types::{Movie, RoomRef, UserEntry};

/// One display-worthy thing that happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Login completed: the first user list arrived, the movie catalog is
    /// known. Raised exactly once per session.
    InitComplete {
        users: Vec<UserEntry>,
        movies: Vec<Movie>,
    },

    /// A fresh user list for the current view.
    UserList(Vec<UserEntry>),

    /// One user's whereabouts, reported while in a movie room.
    UserUpdate { name: String, room: RoomRef },

    /// A chat line from another user in the room.
    ChatMessage { sender: String, text: String },

    /// The server refused the login, or gave up on us.
    ConnectionRejected { reason: String },

    /// The requested room change was confirmed.
    JoinRoomOk,

    /// The server acknowledged our departure; safe to exit.
    LeaveSystemOk,

    /// The session is over and the application should terminate.
    ApplicationQuit,
}
