// src/error.rs

use sparkproto_lib::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the server shell around the protocol engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot access {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid server key in {path:?}: {reason}")]
    ServerKey { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for ProtocolError {
    fn from(e: Error) -> Self {
        match e {
            Error::Protocol(inner) => inner,
            other => ProtocolError::Repository(other.to_string()),
        }
    }
}
