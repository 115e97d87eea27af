//! In-memory user and movie directory.
//!
//! The directory is the server-wide store that every session consults and
//! mutates: which users are logged in, which room each one is in, and the
//! movie catalog. It owns the `User` records; sessions keep only the
//! peer's socket address as an opaque back-reference into the session
//! table, so there is no ownership cycle between the two.
//!
//! Room changes also drive the streaming hooks. Actual media streaming is
//! outside this server; the hooks keep a per-title viewer count and log,
//! which is the integration point a streamer would attach to.

use cinechat_core::types::{Movie, RoomRef, RoomStatus, UserEntry};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{info, warn};

/// A logged-in user as the directory tracks it.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub room: RoomRef,
    /// Socket address of the session this user logged in from.
    pub address: SocketAddr,
}

/// Server-wide store of users, rooms, and movies.
///
/// Kept in insertion order so user-list broadcasts are deterministic.
#[derive(Debug)]
pub struct Directory {
    users: Vec<User>,
    movies: Vec<Movie>,
    /// Viewer counts for the streaming hooks, keyed by title.
    streaming: HashMap<String, u32>,
}

impl Directory {
    pub fn new(movies: Vec<Movie>) -> Self {
        Self {
            users: Vec::new(),
            movies,
            streaming: HashMap::new(),
        }
    }

    /// Whether a user with this exact name is logged in.
    pub fn user_exists(&self, name: &str) -> bool {
        self.users.iter().any(|u| u.name == name)
    }

    /// Admits a user into the given room.
    pub fn add_user(&mut self, name: String, room: RoomRef, address: SocketAddr) {
        debug_assert!(!self.user_exists(&name), "admission checks uniqueness first");
        info!(user = %name, %address, "user joined");
        self.users.push(User { name, room, address });
    }

    /// Removes a user; a no-op (with a log) if the name is unknown.
    pub fn remove_user(&mut self, name: &str) {
        let before = self.users.len();
        self.users.retain(|u| u.name != name);
        if self.users.len() == before {
            warn!(user = %name, "remove_user: unknown user");
        } else {
            info!(user = %name, "user left");
        }
    }

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    #[allow(dead_code)]
    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn movies(&self) -> &[Movie] {
        &self.movies
    }

    pub fn movie_by_title(&self, title: &str) -> Option<&Movie> {
        self.movies.iter().find(|m| m.title == title)
    }

    /// Moves a user to a different room.
    pub fn update_user_room(&mut self, name: &str, room: RoomRef) {
        match self.users.iter_mut().find(|u| u.name == name) {
            Some(user) => user.room = room,
            None => warn!(user = %name, "update_user_room: unknown user"),
        }
    }

    /// Streaming hook: a viewer entered the movie's room.
    pub fn start_streaming(&mut self, title: &str) {
        let viewers = self.streaming.entry(title.to_string()).or_insert(0);
        *viewers += 1;
        info!(movie = %title, viewers = *viewers, "start streaming");
    }

    /// Streaming hook: a viewer left the movie's room. Idempotent — extra
    /// stops on a title nobody watches are logged and ignored.
    pub fn stop_streaming(&mut self, title: &str) {
        match self.streaming.get_mut(title) {
            Some(viewers) if *viewers > 0 => {
                *viewers -= 1;
                info!(movie = %title, viewers = *viewers, "stop streaming");
            }
            _ => warn!(movie = %title, "stop_streaming: no active viewers"),
        }
    }

    /// Builds the user-list entries for a broadcast to main-room peers:
    /// every user, with status 0 for the main room or the movie id.
    ///
    /// A room referencing a title missing from the catalog cannot be
    /// produced by admission or room changes, but is mapped to the main
    /// room rather than trusted.
    pub fn all_user_entries(&self) -> Vec<UserEntry> {
        self.users
            .iter()
            .map(|u| UserEntry {
                name: u.name.clone(),
                status: match &u.room {
                    RoomRef::MainRoom => RoomStatus::MainRoom,
                    RoomRef::Movie(title) => self
                        .movie_by_title(title)
                        .map(|m| RoomStatus::Movie(m.id))
                        .unwrap_or(RoomStatus::MainRoom),
                },
            })
            .collect()
    }

    /// Builds the user-list entries for a broadcast to one movie room:
    /// only the users currently in it.
    pub fn user_entries_in_movie(&self, title: &str) -> Vec<UserEntry> {
        let id = self.movie_by_title(title).map(|m| m.id).unwrap_or(0);
        self.users
            .iter()
            .filter(|u| matches!(&u.room, RoomRef::Movie(t) if t == title))
            .map(|u| UserEntry {
                name: u.name.clone(),
                status: RoomStatus::Movie(id),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn catalog() -> Vec<Movie> {
        vec![Movie {
            id: 3,
            title: "Metropolis".to_string(),
            ip: Ipv4Addr::new(239, 0, 0, 2),
            port: 8081,
        }]
    }

    #[test]
    fn add_and_lookup_user() {
        let mut dir = Directory::new(catalog());
        dir.add_user("alice".to_string(), RoomRef::MainRoom, addr(1000));

        assert!(dir.user_exists("alice"));
        assert!(!dir.user_exists("bob"));
        assert_eq!(dir.user_by_name("alice").unwrap().address, addr(1000));
    }

    #[test]
    fn remove_user_is_tolerant() {
        let mut dir = Directory::new(vec![]);
        dir.add_user("alice".to_string(), RoomRef::MainRoom, addr(1000));
        dir.remove_user("alice");
        dir.remove_user("alice"); // second removal logs, doesn't panic
        assert!(!dir.user_exists("alice"));
    }

    #[test]
    fn user_entries_carry_movie_ids() {
        let mut dir = Directory::new(catalog());
        dir.add_user("alice".to_string(), RoomRef::MainRoom, addr(1));
        dir.add_user(
            "bob".to_string(),
            RoomRef::Movie("Metropolis".to_string()),
            addr(2),
        );

        let entries = dir.all_user_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, RoomStatus::MainRoom);
        assert_eq!(entries[1].status, RoomStatus::Movie(3));
    }

    #[test]
    fn movie_room_entries_filter_by_title() {
        let mut dir = Directory::new(catalog());
        dir.add_user("alice".to_string(), RoomRef::MainRoom, addr(1));
        dir.add_user(
            "bob".to_string(),
            RoomRef::Movie("Metropolis".to_string()),
            addr(2),
        );

        let entries = dir.user_entries_in_movie("Metropolis");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "bob");
    }

    #[test]
    fn streaming_refcount() {
        let mut dir = Directory::new(catalog());
        dir.start_streaming("Metropolis");
        dir.start_streaming("Metropolis");
        dir.stop_streaming("Metropolis");
        dir.stop_streaming("Metropolis");
        dir.stop_streaming("Metropolis"); // extra stop is ignored
        assert_eq!(dir.streaming.get("Metropolis"), Some(&0));
    }
}
