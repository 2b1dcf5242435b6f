//! Device keys stored as PEM files in a directory.
//!
//! `<device_id>.pub.pem` holds an approved key. Keys offered by unknown
//! devices land in `<device_id>_handshake.pub.pem` until an operator renames
//! them.

use crate::error::Error;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use sparkproto_lib::ProtocolError;
use sparkproto_lib::repository::{KeyRepository, pending_key_name};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PUBLIC_KEY_EXTENSION: &str = "pub.pem";

pub struct FileKeyRepository {
    dir: PathBuf,
    server_key: RsaPrivateKey,
}

impl FileKeyRepository {
    /// Open `dir`, loading the server's private key (PKCS#8 or PKCS#1 PEM).
    pub fn open(dir: impl Into<PathBuf>, server_key_path: &Path) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| Error::File {
            path: dir.clone(),
            source,
        })?;
        let server_key = load_private_key(server_key_path)?;
        info!("Loaded server key from {:?}", server_key_path);
        Ok(Self { dir, server_key })
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name.to_lowercase(), PUBLIC_KEY_EXTENSION))
    }
}

pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, Error> {
    let pem = fs::read_to_string(path).map_err(|source| Error::File {
        path: path.to_path_buf(),
        source,
    })?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| Error::ServerKey {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

impl KeyRepository for FileKeyRepository {
    fn get_public_key(&self, device_id: &str) -> Result<Option<String>, ProtocolError> {
        let path = self.key_path(device_id);
        match fs::read_to_string(&path) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No key file at {:?}", path);
                Ok(None)
            }
            Err(source) => Err(Error::File { path, source }.into()),
        }
    }

    fn save_pending_key(&self, device_id: &str, pem: &str) -> Result<(), ProtocolError> {
        let path = self.key_path(&pending_key_name(device_id));
        fs::write(&path, pem).map_err(|source| Error::File {
            path: path.clone(),
            source,
        })?;
        info!("Saved offered key to {:?}", path);
        Ok(())
    }

    fn server_private_key(&self) -> Result<RsaPrivateKey, ProtocolError> {
        Ok(self.server_key.clone())
    }
}
