//! Key storage used by the handshake.

use crate::constants::PENDING_KEY_SUFFIX;
use crate::error::ProtocolError;
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Where the server looks up device keys and its own private key.
pub trait KeyRepository: Send + Sync {
    /// PEM public key registered for a hex device ID.
    fn get_public_key(&self, device_id: &str) -> Result<Option<String>, ProtocolError>;

    /// Store a key a device offered but that is not registered yet, so an
    /// operator can review and approve it.
    fn save_pending_key(&self, device_id: &str, pem: &str) -> Result<(), ProtocolError>;

    fn server_private_key(&self) -> Result<RsaPrivateKey, ProtocolError>;
}

/// Name a pending key is stored under.
pub fn pending_key_name(device_id: &str) -> String {
    format!("{device_id}{PENDING_KEY_SUFFIX}")
}

/// Keys held in memory.
pub struct MemoryKeyRepository {
    server_key: RsaPrivateKey,
    keys: Mutex<HashMap<String, String>>,
}

impl MemoryKeyRepository {
    pub fn new(server_key: RsaPrivateKey) -> Self {
        Self {
            server_key,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, device_id: &str, pem: impl Into<String>) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_lowercase(), pem.into());
    }

    pub fn pending_key(&self, device_id: &str) -> Option<String> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pending_key_name(&device_id.to_lowercase()))
            .cloned()
    }
}

impl KeyRepository for MemoryKeyRepository {
    fn get_public_key(&self, device_id: &str) -> Result<Option<String>, ProtocolError> {
        Ok(self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id.to_lowercase())
            .cloned())
    }

    fn save_pending_key(&self, device_id: &str, pem: &str) -> Result<(), ProtocolError> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pending_key_name(&device_id.to_lowercase()), pem.to_string());
        Ok(())
    }

    fn server_private_key(&self) -> Result<RsaPrivateKey, ProtocolError> {
        Ok(self.server_key.clone())
    }
}
