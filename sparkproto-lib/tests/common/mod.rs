//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use sparkproto_lib::config::{FlashConfig, HandshakeConfig, SessionConfig};
#[allow(unused_imports)]
pub use sparkproto_lib::device::{DeviceIdentity, DeviceSession, Request, SessionParts};
#[allow(unused_imports)]
pub use sparkproto_lib::error::ProtocolError;
#[allow(unused_imports)]
pub use sparkproto_lib::events::{EventPublisher, LocalPublisher, SessionEvent};
#[allow(unused_imports)]
pub use sparkproto_lib::message::{MessageKind, MessageName, UriParams};
#[allow(unused_imports)]
pub use sparkproto_lib::packet::Message;
#[allow(unused_imports)]
pub use std::sync::Arc;
#[allow(unused_imports)]
pub use std::time::Duration;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::{mpsc, watch};

pub const SERVER_KEY_PEM: &str = include_str!("../fixtures/server_key.pem");
pub const DEVICE_KEY_PEM: &str = include_str!("../fixtures/device_key.pem");
pub const DEVICE_PUBLIC_KEY_PEM: &str = include_str!("../fixtures/device_key.pub.pem");

/// 12-byte hardware ID used by the scripted device.
pub const DEVICE_ID: [u8; 12] = [0x53, 0xff, 0x6f, 0x06, 0x50, 0x75, 0x55, 0x35, 0x28, 0x51, 0x14, 0x87];

#[allow(dead_code)]
pub fn server_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(SERVER_KEY_PEM).expect("server key fixture")
}

#[allow(dead_code)]
pub fn device_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(DEVICE_KEY_PEM).expect("device key fixture")
}

#[allow(dead_code)]
pub fn device_public_key() -> RsaPublicKey {
    RsaPublicKey::from_public_key_pem(DEVICE_PUBLIC_KEY_PEM).expect("device public key fixture")
}

/// Send library logs to the test harness. Set `RUST_LOG=debug` to see them.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Session settings that keep the socket timeout out of the way of long
/// flasher waits.
#[allow(dead_code)]
pub fn quiet_session_config() -> SessionConfig {
    SessionConfig {
        socket_timeout: Duration::from_secs(3600),
        ..SessionConfig::default()
    }
}

/// The device end of an in-memory session: plaintext frames both ways.
#[allow(dead_code)]
pub struct FakeDevice {
    pub to_server: mpsc::Sender<Bytes>,
    pub from_server: mpsc::UnboundedReceiver<Bytes>,
    /// Id of the last non-ack message the device sent.
    pub counter: u16,
}

#[allow(dead_code)]
impl FakeDevice {
    pub async fn send(&mut self, message: Message) {
        let bytes = message.to_bytes().expect("encode device message");
        self.to_server.send(bytes).await.expect("session gone");
    }

    /// Send a catalog message with the next counter value.
    pub async fn send_next(&mut self, name: MessageName, params: &UriParams, payload: &[u8]) -> u16 {
        self.counter = self.counter.wrapping_add(1);
        let message = Message::build(name, self.counter, params).with_payload(Bytes::copy_from_slice(payload));
        self.send(message).await;
        self.counter
    }

    /// Answer a server request with an ack carrying its id and token.
    pub async fn reply(&mut self, request: &Message, name: MessageName, payload: &[u8]) {
        let message = Message::build(name, request.id, &UriParams::new())
            .with_token(request.token)
            .with_payload(Bytes::copy_from_slice(payload));
        self.send(message).await;
    }

    /// Answer with an explicit response code.
    pub async fn reply_with_code(&mut self, request: &Message, code: u8, payload: &[u8]) {
        let mut message = Message::build(MessageName::ChunkReceived, request.id, &UriParams::new())
            .with_token(request.token)
            .with_payload(Bytes::copy_from_slice(payload));
        message.code = code;
        self.send(message).await;
    }

    pub async fn recv(&mut self) -> Message {
        let bytes = tokio::time::timeout(Duration::from_secs(300), self.from_server.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("server side closed");
        Message::try_from(bytes).expect("server sent a malformed message")
    }

    /// Next message that is not a bare ack.
    pub async fn recv_request(&mut self) -> Message {
        loop {
            let message = self.recv().await;
            if !message.is_acknowledgement() {
                return message;
            }
        }
    }
}

/// A running session wired to a [`FakeDevice`].
#[allow(dead_code)]
pub struct TestSession {
    pub session: Arc<DeviceSession>,
    pub device: FakeDevice,
    pub publisher: Arc<LocalPublisher>,
    pub events: tokio::sync::broadcast::Receiver<SessionEvent>,
}

#[allow(dead_code)]
pub fn start_session(config: SessionConfig) -> TestSession {
    start_session_with_counters(config, 100, 5000)
}

#[allow(dead_code)]
pub fn start_session_with_counters(config: SessionConfig, device_counter: u16, server_counter: u16) -> TestSession {
    init_tracing();
    let (to_server, incoming) = mpsc::channel(64);
    let (outgoing, from_server) = mpsc::unbounded_channel();
    let (shutdown, _) = watch::channel(false);
    let publisher = Arc::new(LocalPublisher::new());

    let session = DeviceSession::new(
        SessionParts {
            identity: DeviceIdentity {
                device_id: hex::encode(DEVICE_ID),
                public_key: device_public_key(),
                metadata: None,
            },
            connection_key: "1_test".to_string(),
            outgoing,
            shutdown,
            send_counter: server_counter,
            receive_counter: device_counter,
        },
        Arc::clone(&publisher) as Arc<dyn EventPublisher>,
        config,
    );
    let events = session.subscribe_events();
    tokio::spawn(Arc::clone(&session).run(incoming));

    TestSession {
        session,
        device: FakeDevice {
            to_server,
            from_server,
            counter: device_counter,
        },
        publisher,
        events,
    }
}

/// Introspection JSON describing a `temp` double, a `name` string and a
/// legacy `digitalwrite` function.
#[allow(dead_code)]
pub const DESCRIBE_JSON: &str = r#"{"f":["digitalwrite"],"v":{"temp":9,"name":"string"}}"#;
