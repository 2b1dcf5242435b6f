pub mod chunking;
pub mod codec;
pub mod config;
pub mod constants;
pub mod counter;
pub mod crypto;
pub mod device;
pub mod error;
pub mod events;
pub mod flasher;
pub mod handshake;
pub mod introspection;
pub mod message;
pub mod packet;
pub mod repository;

// Re-export the main types for easy access
pub use device::{DeviceIdentity, DeviceSession};
pub use error::ProtocolError;
pub use handshake::{Handshake, HandshakeContext};
pub use message::MessageName;
