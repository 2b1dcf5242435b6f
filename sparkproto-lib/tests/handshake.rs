//! Full key exchange over an in-memory socket, with the test playing the
//! device side.

mod common;

use common::*;
use rsa::pkcs8::EncodePublicKey;
use sparkproto_lib::chunking::encode_chunk;
use sparkproto_lib::crypto::{self, CipherDirection, MessageCipher, SessionKeyMaterial};
use sparkproto_lib::events::LocalPublisher;
use sparkproto_lib::handshake::{self, Handshake, HandshakeContext};
use sparkproto_lib::repository::MemoryKeyRepository;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const HELLO_PAYLOAD: [u8; 8] = [0x00, 0x06, 0x00, 0x41, 0x00, 0x01, 0x00, 0x06];

fn context(repository: Arc<MemoryKeyRepository>, handshake: HandshakeConfig) -> HandshakeContext {
    HandshakeContext {
        repository,
        publisher: Arc::new(LocalPublisher::new()),
        handshake,
        session: SessionConfig::default(),
        connection_key: "1_127.0.0.1:50000".to_string(),
    }
}

fn registered_repository() -> Arc<MemoryKeyRepository> {
    let repository = MemoryKeyRepository::new(server_key());
    repository.insert(&hex::encode(DEVICE_ID), DEVICE_PUBLIC_KEY_PEM);
    Arc::new(repository)
}

fn spawn_server(
    repository: Arc<MemoryKeyRepository>,
    config: HandshakeConfig,
) -> (DuplexStream, JoinHandle<Result<Handshake, ProtocolError>>) {
    init_tracing();
    let (device_end, server_end) = tokio::io::duplex(64 * 1024);
    let ctx = context(repository, config);
    let server = tokio::spawn(async move { handshake::perform(server_end, &ctx).await });
    (device_end, server)
}

/// The device half of an established connection.
struct DeviceEnd {
    stream: DuplexStream,
    encrypt: MessageCipher,
    decrypt: MessageCipher,
}

impl DeviceEnd {
    async fn send(&mut self, message: Message) {
        let plaintext = message.to_bytes().unwrap();
        let ciphertext = self.encrypt.process(&plaintext).unwrap();
        self.stream.write_all(&encode_chunk(&ciphertext).unwrap()).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await.unwrap();
        let mut body = vec![0u8; u16::from_be_bytes(header) as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        let plaintext = self.decrypt.process(&body).unwrap();
        Message::try_from(plaintext.as_slice()).unwrap()
    }
}

/// Steps one and two from the device's side. Returns the nonce it received.
async fn send_device_block(stream: &mut DuplexStream, tamper_nonce: bool) -> [u8; 40] {
    let mut nonce = [0u8; 40];
    stream.read_exact(&mut nonce).await.unwrap();

    let mut block = nonce.to_vec();
    if tamper_nonce {
        block[0] ^= 0xff;
    }
    block.extend_from_slice(&DEVICE_ID);
    block.extend_from_slice(device_public_key().to_public_key_der().unwrap().as_bytes());

    let server_public = server_key().to_public_key();
    let ciphertext = crypto::encrypt_with_public_key(&server_public, &block).unwrap();
    assert_eq!(ciphertext.len(), 256);
    stream.write_all(&ciphertext).await.unwrap();
    nonce
}

/// Step three: decrypt the session key and check the server's signature.
async fn receive_session_key(stream: &mut DuplexStream) -> SessionKeyMaterial {
    let mut ciphertext = [0u8; 128];
    stream.read_exact(&mut ciphertext).await.unwrap();
    let mut signature = [0u8; 256];
    stream.read_exact(&mut signature).await.unwrap();

    let key = crypto::decrypt_with_private_key(&device_key(), &ciphertext).unwrap();
    let key: [u8; 40] = key.as_slice().try_into().expect("session key is 40 bytes");

    let hmac = crypto::hmac_sha1(&key, &ciphertext).unwrap();
    crypto::verify_raw(&server_key().to_public_key(), &hmac, &signature).expect("server signature");
    SessionKeyMaterial::from_bytes(key)
}

async fn connect_device(mut stream: DuplexStream) -> DeviceEnd {
    send_device_block(&mut stream, false).await;
    let material = receive_session_key(&mut stream).await;
    DeviceEnd {
        stream,
        encrypt: MessageCipher::new(CipherDirection::Encrypt, &material),
        decrypt: MessageCipher::new(CipherDirection::Decrypt, &material),
    }
}

#[tokio::test]
async fn handshake_establishes_an_encrypted_session() {
    let (stream, server) = spawn_server(registered_repository(), HandshakeConfig::default());

    let mut device = connect_device(stream).await;
    device
        .send(Message::build(MessageName::Hello, 777, &UriParams::new()).with_payload(Bytes::from_static(&HELLO_PAYLOAD)))
        .await;
    // Sent before the session starts routing; must not be lost.
    device
        .send(Message::build(MessageName::GetTime, 778, &UriParams::new()))
        .await;

    let Handshake { session, incoming } = server.await.unwrap().unwrap();
    assert_eq!(session.device_id(), hex::encode(DEVICE_ID));
    assert_eq!(session.receive_counter(), 777);
    let metadata = session.identity().metadata.expect("hello metadata");
    assert_eq!(metadata.product_id, 6);
    assert_eq!(metadata.firmware_version, 0x41);
    assert_eq!(metadata.flags, 0x01);
    assert_eq!(metadata.platform_id, 6);

    let hello = device.recv().await;
    assert_eq!(hello.path_str(), "h");
    assert_eq!(hello.kind, MessageKind::NonConfirmable);
    assert_eq!(hello.id, session.send_counter());

    tokio::spawn(Arc::clone(&session).run(incoming));
    let time = device.recv().await;
    assert!(time.is_acknowledgement());
    assert_eq!(time.id, 778);
    assert_eq!(time.payload.len(), 4);
}

#[tokio::test]
async fn unknown_device_key_is_saved_for_review() {
    let repository = Arc::new(MemoryKeyRepository::new(server_key()));
    let (mut stream, server) = spawn_server(Arc::clone(&repository), HandshakeConfig::default());

    send_device_block(&mut stream, false).await;
    let err = server.await.unwrap().err().expect("handshake should fail");
    assert!(matches!(err, ProtocolError::Handshake(_)), "{err}");

    let pending = repository.pending_key(&hex::encode(DEVICE_ID)).expect("pending key saved");
    let saved = crypto::public_key_from_pem(&pending).unwrap();
    assert_eq!(saved, device_public_key());
}

#[tokio::test]
async fn nonce_mismatch_aborts() {
    let (mut stream, server) = spawn_server(registered_repository(), HandshakeConfig::default());

    send_device_block(&mut stream, true).await;
    match server.await.unwrap() {
        Err(ProtocolError::Handshake(reason)) => assert!(reason.contains("nonce"), "{reason}"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("handshake accepted a bad nonce"),
    }
}

#[tokio::test]
async fn missing_hello_times_out() {
    let config = HandshakeConfig {
        hello_timeout: Duration::from_millis(500),
        ..HandshakeConfig::default()
    };
    let (stream, server) = spawn_server(registered_repository(), config);

    let _device = connect_device(stream).await;
    let err = server.await.unwrap().err().expect("handshake should fail");
    assert!(matches!(err, ProtocolError::Timeout(_)), "{err}");
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let (stream, server) = spawn_server(registered_repository(), HandshakeConfig::default());

    let mut device = connect_device(stream).await;
    device
        .send(Message::build(MessageName::GetTime, 1, &UriParams::new()))
        .await;
    let err = server.await.unwrap().err().expect("handshake should fail");
    assert!(err.to_string().contains("expected Hello"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn stalled_device_hits_the_global_timeout() {
    let config = HandshakeConfig {
        global_timeout: Duration::from_secs(5),
        ..HandshakeConfig::default()
    };
    let (mut stream, server) = spawn_server(registered_repository(), config);

    // Take the nonce, then go quiet instead of sending the key block.
    let mut nonce = [0u8; 40];
    stream.read_exact(&mut nonce).await.unwrap();
    let started = tokio::time::Instant::now();

    let err = server.await.unwrap().err().expect("handshake should fail");
    match err {
        ProtocolError::Timeout(step) => assert_eq!(step, "handshake"),
        other => panic!("unexpected error {other}"),
    }
    assert!(started.elapsed() <= Duration::from_secs(5));
    drop(stream);
}
