//! Configuration for the CineChat binaries.
//!
//! Config files live at a platform-appropriate location:
//! - Linux: `~/.config/cinechat/{server,client}.toml`
//! - macOS: `~/Library/Application Support/cinechat/{server,client}.toml`
//!
//! On first run no file exists; the binaries detect this and write one
//! with defaults (the server seeds a small demo movie catalog). All
//! values can be overridden per run from the command line.
//!
//! # Server Config (TOML)
//!
//! ```toml
//! bind_address = "0.0.0.0"
//! port = 1950
//! transport = "udp"
//! loss_probability = 0.0
//!
//! [[movies]]
//! id = 1
//! title = "The Matrix"
//! ip = "239.0.0.1"
//! port = 8080
//! ```

use crate::types::{Movie, MovieError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default port the server listens on and clients dial.
pub const DEFAULT_PORT: u16 = 1950;

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config cannot be rendered as TOML: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("no config directory on this platform")]
    MissingConfigDir,

    #[error("{path}: movie {title:?}: {source}")]
    Movie {
        path: PathBuf,
        title: String,
        source: MovieError,
    },
}

/// Returns the platform-appropriate config directory path.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cinechat"))
}

/// Returns the platform-appropriate data directory (log files).
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("cinechat"))
}

// ---------------------------------------------------------------------------
// Transport selection
// ---------------------------------------------------------------------------

/// Which transport a binary speaks for this run.
///
/// The two interoperate at the frame level; only the delivery layer
/// differs (datagrams with optional simulated loss vs. a framed stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportKind::Udp),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(format!("unknown transport '{other}' (expected udp or tcp)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// The persisted configuration of the CineChat server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the server binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port the server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport to serve.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Probability (0.0–1.0) that an outgoing UDP datagram is dropped,
    /// for exercising the retransmission machinery. Ignored for TCP.
    #[serde(default)]
    pub loss_probability: f64,

    /// The movie catalog offered to clients.
    #[serde(default)]
    pub movies: Vec<Movie>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_transport() -> TransportKind {
    TransportKind::Udp
}

impl ServerConfig {
    /// Returns the full path to the server config file.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()
            .ok_or(ConfigError::MissingConfigDir)?
            .join("server.toml"))
    }

    /// Loads the config from a specific file path, checking every catalog
    /// entry against the wire limits (a title too long for a movie-list
    /// record is rejected here, not discovered mid-broadcast).
    ///
    /// Returns `Ok(None)` if the file doesn't exist yet (first run).
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        let Some(config) = load_toml::<Self>(path)? else {
            return Ok(None);
        };
        for movie in &config.movies {
            movie.validate().map_err(|e| ConfigError::Movie {
                path: path.to_owned(),
                title: movie.title.chars().take(64).collect(),
                source: e,
            })?;
        }
        Ok(Some(config))
    }

    /// Saves this config, creating the parent directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)
    }

    /// Creates a first-run config with a small demo catalog, so a freshly
    /// installed server has something to list.
    pub fn first_run() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: DEFAULT_PORT,
            transport: TransportKind::Udp,
            loss_probability: 0.0,
            movies: vec![
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
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// The persisted configuration of the CineChat client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or IP address.
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Server port.
    #[serde(default = "default_port")]
    pub server_port: u16,

    /// Transport to dial.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Probability (0.0–1.0) that an outgoing UDP datagram is dropped.
    #[serde(default)]
    pub loss_probability: f64,

    /// Username to log in with. Prompted for if absent.
    #[serde(default)]
    pub username: Option<String>,
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            server_port: DEFAULT_PORT,
            transport: TransportKind::Udp,
            loss_probability: 0.0,
            username: None,
        }
    }
}

impl ClientConfig {
    /// Returns the full path to the client config file.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()
            .ok_or(ConfigError::MissingConfigDir)?
            .join("client.toml"))
    }

    /// Loads the config from a specific file path.
    ///
    /// Returns `Ok(None)` if the file doesn't exist yet.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        load_toml(path)
    }

    /// Saves this config, creating the parent directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)
    }
}

// ---------------------------------------------------------------------------
// Shared TOML plumbing
// ---------------------------------------------------------------------------

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_owned(),
        source: e,
    })?;
    let config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_owned(),
        source: e,
    })?;
    Ok(Some(config))
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
            path: path.to_owned(),
            source: e,
        })?;
    }
    let content = toml::to_string_pretty(value)?;
    std::fs::write(path, content).map_err(|e| ConfigError::Write {
        path: path.to_owned(),
        source: e,
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn server_config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.toml");

        let config = ServerConfig::first_run();
        config.save_to(&path).unwrap();
        let loaded = ServerConfig::load_from(&path).unwrap().unwrap();

        assert_eq!(loaded.port, DEFAULT_PORT);
        assert_eq!(loaded.transport, TransportKind::Udp);
        assert_eq!(loaded.movies, config.movies);
    }

    #[test]
    fn client_config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("client.toml");

        let config = ClientConfig {
            server_address: "192.168.1.20".to_string(),
            server_port: 2000,
            transport: TransportKind::Tcp,
            loss_probability: 0.1,
            username: Some("alice".to_string()),
        };
        config.save_to(&path).unwrap();
        let loaded = ClientConfig::load_from(&path).unwrap().unwrap();

        assert_eq!(loaded.server_address, "192.168.1.20");
        assert_eq!(loaded.server_port, 2000);
        assert_eq!(loaded.transport, TransportKind::Tcp);
        assert_eq!(loaded.username.as_deref(), Some("alice"));
    }

    #[test]
    fn missing_file_returns_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nope.toml");
        assert!(ServerConfig::load_from(&path).unwrap().is_none());
        assert!(ClientConfig::load_from(&path).unwrap().is_none());
    }

    #[test]
    fn save_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deep").join("nested").join("client.toml");
        ClientConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn oversized_movie_title_rejected_at_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.toml");

        let mut config = ServerConfig::first_run();
        config.movies[0].title = "a".repeat(Movie::MAX_TITLE_BYTES + 1);
        config.save_to(&path).unwrap();

        assert!(matches!(
            ServerConfig::load_from(&path),
            Err(ConfigError::Movie { .. })
        ));
    }

    #[test]
    fn partial_server_file_gets_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "port = 2042\n").unwrap();

        let loaded = ServerConfig::load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.port, 2042);
        assert_eq!(loaded.bind_address, "0.0.0.0");
        assert_eq!(loaded.transport, TransportKind::Udp);
        assert!(loaded.movies.is_empty());
    }

    #[test]
    fn transport_kind_parses() {
        assert_eq!("udp".parse::<TransportKind>().unwrap(), TransportKind::Udp);
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert!("quic".parse::<TransportKind>().is_err());
    }
}
