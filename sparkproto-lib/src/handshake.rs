//! Key exchange that turns a raw socket into an encrypted session.
//!
//! ```text
//! server -> device   nonce (40)
//! device -> server   RSA(server pub, nonce ‖ device id (12) ‖ device pub DER)   256 bytes
//! server -> device   RSA(device pub, session key (40)) ‖ sign(server priv, HMAC-SHA1(key, ciphertext))
//! device -> server   Hello       (first encrypted frame)
//! server -> device   Hello
//! ```
//!
//! After the third step both directions carry `[u16 len][AES-128-CBC message]`
//! frames. Two tasks pump the socket: one reads, reassembles and decrypts
//! into a channel, the other encrypts and writes whatever the session sends.
//! Frames the device sends right after its Hello wait in the inbound channel
//! until the session starts routing.

use crate::chunking::{ChunkDecoder, encode_chunk};
use crate::config::{HandshakeConfig, SessionConfig};
use crate::constants::{DEVICE_ID_SIZE, HANDSHAKE_CIPHERTEXT_SIZE, MIN_HANDSHAKE_PLAINTEXT, NONCE_SIZE};
use crate::crypto::{self, CipherDirection, MessageCipher, SessionKeyMaterial};
use crate::device::{DeviceIdentity, DeviceSession, HelloMetadata, Request, SessionParts};
use crate::error::ProtocolError;
use crate::events::EventPublisher;
use crate::message::{self, MessageName};
use crate::packet::Message;
use crate::repository::KeyRepository;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Frames buffered between the reader task and the session.
const INCOMING_QUEUE: usize = 64;

/// Everything a handshake needs besides the socket.
#[derive(Clone)]
pub struct HandshakeContext {
    pub repository: Arc<dyn KeyRepository>,
    pub publisher: Arc<dyn EventPublisher>,
    pub handshake: HandshakeConfig,
    pub session: SessionConfig,
    /// Unique per connection, used in logs and as the publisher owner.
    pub connection_key: String,
}

/// A session ready to run, and the frames it has to route.
pub struct Handshake {
    pub session: Arc<DeviceSession>,
    pub incoming: mpsc::Receiver<Bytes>,
}

/// Run the handshake on a freshly accepted socket, bounded by the global
/// handshake timeout. Any failure means the connection must be closed.
pub async fn perform<S>(socket: S, ctx: &HandshakeContext) -> Result<Handshake, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match timeout(ctx.handshake.global_timeout, run(socket, ctx)).await {
        Ok(Ok(handshake)) => Ok(handshake),
        Ok(Err(e)) => {
            error!(connection_key = %ctx.connection_key, "Handshake failed: {}", e);
            Err(e)
        }
        Err(_) => {
            error!(connection_key = %ctx.connection_key, "Handshake timed out");
            Err(ProtocolError::Timeout("handshake".to_string()))
        }
    }
}

async fn run<S>(mut socket: S, ctx: &HandshakeContext) -> Result<Handshake, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let key = ctx.connection_key.as_str();

    let nonce = crypto::random_bytes::<NONCE_SIZE>();
    socket.write_all(&nonce).await?;
    socket.flush().await?;
    debug!(connection_key = %key, "Sent nonce");

    let mut ciphertext = [0u8; HANDSHAKE_CIPHERTEXT_SIZE];
    socket.read_exact(&mut ciphertext).await?;

    let server_key = ctx.repository.server_private_key()?;
    let plaintext = crypto::decrypt_with_private_key(&server_key, &ciphertext)
        .map_err(|e| ProtocolError::Handshake(format!("cannot decrypt device block: {e}")))?;
    if plaintext.len() < MIN_HANDSHAKE_PLAINTEXT {
        return Err(ProtocolError::Handshake(format!(
            "device block too short: {} bytes",
            plaintext.len()
        )));
    }
    if !crypto::constant_time_eq(&plaintext[..NONCE_SIZE], &nonce) {
        return Err(ProtocolError::Handshake("nonce mismatch".to_string()));
    }
    let device_id = hex::encode(&plaintext[NONCE_SIZE..NONCE_SIZE + DEVICE_ID_SIZE]);
    let offered_key = &plaintext[MIN_HANDSHAKE_PLAINTEXT..];
    debug!(connection_key = %key, device_id = %device_id, "Nonce verified");

    let device_key = match ctx.repository.get_public_key(&device_id)? {
        Some(pem) => crypto::public_key_from_pem(&pem)?,
        None => {
            save_offered_key(ctx, &device_id, offered_key);
            return Err(ProtocolError::Handshake(format!("no public key registered for {device_id}")));
        }
    };

    let material = SessionKeyMaterial::generate();
    let session_ciphertext = crypto::encrypt_with_public_key(&device_key, material.as_bytes())?;
    let hmac = crypto::hmac_sha1(material.as_bytes(), &session_ciphertext)?;
    let signature = crypto::sign_raw(&server_key, &hmac)?;
    socket.write_all(&session_ciphertext).await?;
    socket.write_all(&signature).await?;
    socket.flush().await?;
    debug!(connection_key = %key, device_id = %device_id, "Sent session key");

    let (reader, writer) = tokio::io::split(socket);
    let (shutdown, _) = watch::channel(false);
    let (incoming_tx, mut incoming) = mpsc::channel(INCOMING_QUEUE);
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_frames(
        reader,
        MessageCipher::new(CipherDirection::Decrypt, &material),
        incoming_tx,
        shutdown.subscribe(),
        key.to_string(),
    ));
    tokio::spawn(write_frames(
        writer,
        MessageCipher::new(CipherDirection::Encrypt, &material),
        outgoing_rx,
        shutdown.subscribe(),
        key.to_string(),
    ));

    let frame = timeout(ctx.handshake.hello_timeout, incoming.recv())
        .await
        .map_err(|_| ProtocolError::Timeout("device Hello".to_string()))?
        .ok_or_else(|| ProtocolError::Handshake("connection closed before Hello".to_string()))?;
    let hello = Message::try_from(frame)?;
    if message::route(hello.code, &hello.first_segment()) != Some(MessageName::Hello) {
        return Err(ProtocolError::Handshake(format!(
            "expected Hello, got code {:#04x} path '{}'",
            hello.code,
            hello.path_str()
        )));
    }

    let identity = DeviceIdentity {
        device_id,
        public_key: device_key,
        metadata: HelloMetadata::parse(&hello.payload),
    };
    let session = DeviceSession::new(
        SessionParts {
            identity,
            connection_key: key.to_string(),
            outgoing,
            shutdown,
            send_counter: crypto::random_u16(),
            receive_counter: hello.id,
        },
        Arc::clone(&ctx.publisher),
        ctx.session,
    );
    session.send_message(MessageName::Hello, &Request::new())?;

    info!(
        connection_key = %key,
        device_id = %session.device_id(),
        product_id = ?session.identity().product_id(),
        firmware_version = ?session.identity().firmware_version(),
        "Handshake complete"
    );
    Ok(Handshake { session, incoming })
}

/// Keep an unknown device's key for an operator to review.
fn save_offered_key(ctx: &HandshakeContext, device_id: &str, der: &[u8]) {
    let pem = crypto::parse_device_public_key(der).and_then(|key| crypto::public_key_to_pem(&key));
    match pem.and_then(|pem| ctx.repository.save_pending_key(device_id, &pem)) {
        Ok(()) => warn!(
            connection_key = %ctx.connection_key,
            device_id = %device_id,
            "Unknown device, offered key saved for review"
        ),
        Err(e) => warn!(
            connection_key = %ctx.connection_key,
            device_id = %device_id,
            "Unknown device, offered key unusable: {}",
            e
        ),
    }
}

/// Socket -> reassemble -> decrypt -> channel.
async fn read_frames<R>(
    mut reader: R,
    mut cipher: MessageCipher,
    frames: mpsc::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    connection_key: String,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = ChunkDecoder::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                debug!(connection_key = %connection_key, "Device closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(connection_key = %connection_key, "Socket read failed: {}", e);
                break;
            }
        };
        for frame in decoder.feed(&buf[..n]) {
            let plaintext = match cipher.process(&frame) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(connection_key = %connection_key, "Cannot decrypt frame: {}", e);
                    return;
                }
            };
            if frames.send(Bytes::from(plaintext)).await.is_err() {
                return;
            }
        }
    }
}

/// Channel -> encrypt -> length prefix -> socket.
async fn write_frames<W>(
    mut writer: W,
    mut cipher: MessageCipher,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    connection_key: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let chunk = match cipher.process(&frame).and_then(|ciphertext| encode_chunk(&ciphertext)) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(connection_key = %connection_key, "Cannot encrypt frame: {}", e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&chunk).await {
            debug!(connection_key = %connection_key, "Socket write failed: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(connection_key = %connection_key, "Socket flush failed: {}", e);
            break;
        }
        trace!(connection_key = %connection_key, "Wrote {} byte frame", chunk.len());
    }
    let _ = writer.shutdown().await;
}
