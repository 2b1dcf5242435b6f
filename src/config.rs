//! Server configuration file.
//!
//! Every field is optional; a missing file means all defaults. Example:
//!
//! ```json
//! {
//!   "bind": "0.0.0.0:5683",
//!   "keys_dir": "keys/devices",
//!   "server_key": "keys/server_key.pem",
//!   "session": { "socket_timeout": 31 },
//!   "flash": { "chunk_size": 512, "fast_ota": false }
//! }
//! ```

use crate::error::Error;
use serde::{Deserialize, Serialize};
use sparkproto_lib::config::{FlashConfig, HandshakeConfig, SessionConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub keys_dir: PathBuf,
    pub server_key: PathBuf,
    pub handshake: HandshakeConfig,
    pub session: SessionConfig,
    pub flash: FlashConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5683)),
            keys_dir: PathBuf::from("keys/devices"),
            server_key: PathBuf::from("keys/server_key.pem"),
            handshake: HandshakeConfig::default(),
            session: SessionConfig::default(),
            flash: FlashConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::File {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }
}
