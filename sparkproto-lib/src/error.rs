use std::io;
use thiserror::Error;

/// The primary error type for the `sparkproto` library.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message name: {0}")]
    UnknownMessage(String),

    #[error("Bad Counter: expected {expected}, got {actual}")]
    BadCounter { expected: u16, actual: u16 },

    #[error("Token {0} is still in flight")]
    TokenInFlight(u8),

    #[error("Session is locked by another owner")]
    SessionLocked,

    #[error("Device is not connected")]
    NotConnected,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid {value_type} value: {value}")]
    InvalidValue { value_type: String, value: String },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error("Unknown Function: {0}")]
    UnknownFunction(String),

    #[error("Invalid introspection data: {0}")]
    Introspection(#[from] serde_json::Error),

    #[error("Device returned error code {code:#04x} for {request}")]
    ErrorResponse { request: String, code: u8 },

    #[error("Flash failed: {0}")]
    Flash(String),

    #[error("Key repository error: {0}")]
    Repository(String),
}

impl From<rsa::Error> for ProtocolError {
    fn from(e: rsa::Error) -> Self {
        ProtocolError::Crypto(e.to_string())
    }
}

impl ProtocolError {
    /// Protocol violations terminate the connection; everything else is
    /// reported to the caller and the session stays up.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Handshake(_)
                | ProtocolError::Crypto(_)
                | ProtocolError::BadCounter { .. }
                | ProtocolError::Disconnected
                | ProtocolError::Io(_)
        )
    }
}
