//! Cryptographic primitives for the handshake and the session channel.
//!
//! # Handshake primitives
//!
//! - RSA PKCS#1 v1.5 decryption of the device's hello block with the server key
//! - RSA PKCS#1 v1.5 encryption of the session key with the device key
//! - HMAC-SHA1 over the encrypted session key, keyed by the plaintext key
//! - Raw private-key signature (PKCS#1 type 1 padding, no digest prefix)
//!
//! # Session cipher
//!
//! Every protocol message is encrypted on its own with AES-128-CBC and
//! PKCS#7 padding. After each message the IV for that direction becomes the
//! first ciphertext block of the message just processed, so both sides must
//! see exactly the same message boundaries.

use crate::constants::{AES_BLOCK_SIZE, AES_KEY_SIZE, SESSION_KEY_SIZE};
use crate::error::ProtocolError;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::der::{self, AnyRef, Decode, Reader, SliceReader, Tag, Tagged};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Fill a fixed-size array from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_u16() -> u16 {
    u16::from_be_bytes(random_bytes::<2>())
}

/// Compare two byte strings without exiting early on the first mismatch.
///
/// Every byte of the longer input is examined regardless of where (or
/// whether) the inputs differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq_counted(a, b).0
}

/// Same as [`constant_time_eq`], also reporting how many byte positions were
/// examined.
pub fn constant_time_eq_counted(a: &[u8], b: &[u8]) -> (bool, usize) {
    let len = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());
    let mut examined = 0;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
        examined += 1;
    }
    (diff == 0, examined)
}

/// 40 bytes of server-generated session material.
///
/// Bytes 0..16 are the AES key, 16..32 the IV and 32..40 a salt that is
/// transmitted but not used by the cipher.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeyMaterial([u8; SESSION_KEY_SIZE]);

impl SessionKeyMaterial {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    pub fn key(&self) -> [u8; AES_KEY_SIZE] {
        let mut key = [0u8; AES_KEY_SIZE];
        key.copy_from_slice(&self.0[..AES_KEY_SIZE]);
        key
    }

    pub fn iv(&self) -> [u8; AES_BLOCK_SIZE] {
        let mut iv = [0u8; AES_BLOCK_SIZE];
        iv.copy_from_slice(&self.0[AES_KEY_SIZE..AES_KEY_SIZE + AES_BLOCK_SIZE]);
        iv
    }

    pub fn salt(&self) -> &[u8] {
        &self.0[AES_KEY_SIZE + AES_BLOCK_SIZE..]
    }
}

impl std::fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeyMaterial(..)")
    }
}

/// Which way a [`MessageCipher`] transforms data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}

/// Per-direction AES-128-CBC state with IV chaining across messages.
pub struct MessageCipher {
    direction: CipherDirection,
    key: [u8; AES_KEY_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
}

impl MessageCipher {
    pub fn new(direction: CipherDirection, material: &SessionKeyMaterial) -> Self {
        Self {
            direction,
            key: material.key(),
            iv: material.iv(),
        }
    }

    pub fn direction(&self) -> CipherDirection {
        self.direction
    }

    /// Encrypt or decrypt one whole message, advancing the IV.
    pub fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self.direction {
            CipherDirection::Encrypt => Ok(self.encrypt(data)),
            CipherDirection::Decrypt => self.decrypt(data),
        }
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext =
            Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        self.iv.copy_from_slice(&ciphertext[..AES_BLOCK_SIZE]);
        ciphertext
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(ProtocolError::Crypto(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }
        let plaintext = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ProtocolError::Crypto("bad padding in decrypted message".to_string()))?;
        self.iv.copy_from_slice(&ciphertext[..AES_BLOCK_SIZE]);
        Ok(plaintext)
    }
}

/// Decrypt a PKCS#1 v1.5 block with the server's private key.
pub fn decrypt_with_private_key(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Ok(key.decrypt(Pkcs1v15Encrypt, ciphertext)?)
}

/// Encrypt with a device public key using PKCS#1 v1.5 padding.
pub fn encrypt_with_public_key(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Ok(key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)?)
}

/// Raw private-key encryption of `data` with PKCS#1 type 1 padding.
///
/// The output is the size of the key modulus.
pub fn sign_raw(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Ok(key.sign(Pkcs1v15Sign::new_unprefixed(), data)?)
}

pub fn verify_raw(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<(), ProtocolError> {
    Ok(key.verify(Pkcs1v15Sign::new_unprefixed(), data, signature)?)
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).map_err(|e| ProtocolError::Crypto(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// The leading DER SEQUENCE in `bytes`, without whatever follows it.
fn leading_sequence(bytes: &[u8]) -> der::Result<&[u8]> {
    let mut reader = SliceReader::new(bytes)?;
    AnyRef::decode(&mut reader)?.tag().assert_eq(Tag::Sequence)?;
    let len = usize::try_from(reader.position())?;
    Ok(&bytes[..len])
}

/// Parse the public key a device offers during the handshake.
///
/// The key may be SubjectPublicKeyInfo or bare PKCS#1 and may be followed by
/// padding, so only the leading DER element is decoded.
pub fn parse_device_public_key(der: &[u8]) -> Result<RsaPublicKey, ProtocolError> {
    let der = leading_sequence(der)
        .map_err(|e| ProtocolError::Crypto(format!("device key is not a DER sequence: {e}")))?;
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|e| ProtocolError::Crypto(format!("cannot parse device key: {e}")))
}

pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, ProtocolError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| ProtocolError::Crypto(format!("cannot parse public key PEM: {e}")))
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, ProtocolError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| ProtocolError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;

    #[test]
    fn constant_time_eq_examines_every_byte() {
        let a = [7u8; 40];
        let mut early = a;
        early[0] ^= 1;
        let mut late = a;
        late[39] ^= 1;

        assert_eq!(constant_time_eq_counted(&a, &a), (true, 40));
        assert_eq!(constant_time_eq_counted(&a, &early), (false, 40));
        assert_eq!(constant_time_eq_counted(&a, &late), (false, 40));
        assert!(!constant_time_eq(&a, &a[..39]));
    }

    #[test]
    fn key_material_layout() {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let material = SessionKeyMaterial::from_bytes(bytes);
        assert_eq!(material.key().to_vec(), (0..16).collect::<Vec<u8>>());
        assert_eq!(material.iv().to_vec(), (16..32).collect::<Vec<u8>>());
        assert_eq!(material.salt().to_vec(), (32..40).collect::<Vec<u8>>());
    }

    #[test]
    fn cipher_pair_stays_in_sync_across_messages() {
        let material = SessionKeyMaterial::generate();
        let mut enc = MessageCipher::new(CipherDirection::Encrypt, &material);
        let mut dec = MessageCipher::new(CipherDirection::Decrypt, &material);

        for msg in [&b"hello"[..], &[0u8; 16][..], &[0xAB; 100][..], &b""[..]] {
            let ciphertext = enc.process(msg).unwrap();
            assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);
            assert_eq!(dec.process(&ciphertext).unwrap(), msg);
        }
    }

    #[test]
    fn iv_advances_between_messages() {
        let material = SessionKeyMaterial::generate();
        let mut enc = MessageCipher::new(CipherDirection::Encrypt, &material);
        let first = enc.process(b"same").unwrap();
        let second = enc.process(b"same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn decrypt_rejects_partial_blocks() {
        let material = SessionKeyMaterial::generate();
        let mut dec = MessageCipher::new(CipherDirection::Decrypt, &material);
        assert!(matches!(dec.process(&[0u8; 15]), Err(ProtocolError::Crypto(_))));
    }

    #[test]
    fn hmac_matches_known_vector() {
        // RFC 2202 test case 2
        let mac = hmac_sha1(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(hex::encode(mac), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn device_key_is_read_from_padded_blocks() {
        let key = public_key_from_pem(include_str!("../tests/fixtures/device_key.pub.pem")).unwrap();

        let mut spki = key.to_public_key_der().unwrap().as_bytes().to_vec();
        spki.extend_from_slice(&[0u8; 40]);
        assert_eq!(parse_device_public_key(&spki).unwrap(), key);

        let mut pkcs1 = key.to_pkcs1_der().unwrap().as_bytes().to_vec();
        pkcs1.extend_from_slice(&[0xAA; 12]);
        assert_eq!(parse_device_public_key(&pkcs1).unwrap(), key);
    }

    #[test]
    fn device_key_must_start_with_a_sequence() {
        assert!(matches!(parse_device_public_key(&[0x02, 0x01, 0x05]), Err(ProtocolError::Crypto(_))));
        assert!(matches!(parse_device_public_key(&[0x30, 0x82, 0x01]), Err(ProtocolError::Crypto(_))));
        assert!(matches!(parse_device_public_key(&[]), Err(ProtocolError::Crypto(_))));
    }
}
