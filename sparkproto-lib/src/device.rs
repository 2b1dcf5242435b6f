//! One connected device: message routing, correlation and the device API.
//!
//! A [`DeviceSession`] sits on top of the decrypted frame channels the
//! handshake sets up. Inbound frames are processed strictly in arrival order
//! by [`DeviceSession::run`]; everything that waits for the device does so
//! through a [`Subscription`], which is closed when the session disconnects
//! so no caller is left waiting.

use crate::codec::{self, Value};
use crate::config::{FlashConfig, SessionConfig};
use crate::counter::{MessageCounter, TokenTable};
use crate::error::ProtocolError;
use crate::events::{DeviceEvent, EventPublisher, SessionEvent, SubscriptionFilter};
use crate::flasher::FirmwareFlasher;
use crate::introspection::DeviceFunctionState;
use crate::message::{self, MessageKind, MessageName, UriParams};
use crate::packet::Message;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use rsa::RsaPublicKey;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Product and firmware details a device announces in its Hello.
///
/// Layout: `[u16 product_id][u16 firmware_version][u8 reserved][u8 flags][u16 platform_id]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloMetadata {
    pub product_id: u16,
    pub firmware_version: u16,
    pub flags: u8,
    pub platform_id: u16,
}

impl HelloMetadata {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < crate::constants::HELLO_PAYLOAD_SIZE {
            return None;
        }
        Some(Self {
            product_id: BigEndian::read_u16(&payload[0..2]),
            firmware_version: BigEndian::read_u16(&payload[2..4]),
            flags: payload[5],
            platform_id: BigEndian::read_u16(&payload[6..8]),
        })
    }
}

/// Who the device is, fixed once the handshake completes.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    /// Lowercase hex of the 12-byte hardware ID.
    pub device_id: String,
    pub public_key: RsaPublicKey,
    pub metadata: Option<HelloMetadata>,
}

impl DeviceIdentity {
    pub fn product_id(&self) -> Option<u16> {
        self.metadata.map(|m| m.product_id)
    }

    pub fn firmware_version(&self) -> Option<u16> {
        self.metadata.map(|m| m.firmware_version)
    }

    pub fn platform_id(&self) -> Option<u16> {
        self.metadata.map(|m| m.platform_id)
    }
}

/// Identifies whoever holds exclusive use of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for an outbound message.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub params: UriParams,
    pub payload: Option<Bytes>,
    pub owner: Option<OwnerId>,
    pub max_age: Option<u32>,
    /// Send with a token but do not keep it in flight; nobody awaits the answer.
    pub untracked: bool,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.params.set(name, value);
        self
    }

    pub fn params(mut self, params: UriParams) -> Self {
        self.params = params;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn untracked(mut self) -> Self {
        self.untracked = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Disconnected,
}

struct Listener {
    id: u64,
    names: Vec<MessageName>,
    uri_prefix: Option<Vec<u8>>,
    token: Option<u8>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Listener {
    fn matches(&self, name: MessageName, message: &Message) -> bool {
        self.names.contains(&name)
            && self.token.is_none_or(|t| message.token == Some(t))
            && self
                .uri_prefix
                .as_deref()
                .is_none_or(|prefix| message.path.starts_with(prefix))
    }
}

struct SessionState {
    send_counter: MessageCounter,
    receive_counter: MessageCounter,
    tokens: TokenTable,
    owner: Option<OwnerId>,
    listeners: Vec<Listener>,
    next_listener_id: u64,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    last_ping: Option<Instant>,
    status: SessionStatus,
}

type SharedState = Arc<Mutex<SessionState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered wait for inbound messages.
///
/// Dropping it removes the listener and releases the request token it
/// guards, if any.
pub struct Subscription {
    id: u64,
    token: Option<u8>,
    label: String,
    state: SharedState,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Token of the request this subscription answers.
    pub fn token(&self) -> Option<u8> {
        self.token
    }

    pub async fn recv(&mut self) -> Result<Message, ProtocolError> {
        self.rx.recv().await.ok_or(ProtocolError::Disconnected)
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Message, ProtocolError> {
        timeout(wait, self.recv())
            .await
            .map_err(|_| ProtocolError::Timeout(self.label.clone()))?
    }

    /// A message that already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.listeners.retain(|l| l.id != self.id);
        if let Some(token) = self.token {
            state.tokens.clear(token);
        }
    }
}

/// Everything the handshake hands over to a new session.
pub struct SessionParts {
    pub identity: DeviceIdentity,
    pub connection_key: String,
    /// Plaintext frames to encrypt and write.
    pub outgoing: mpsc::UnboundedSender<Bytes>,
    /// Stops the I/O pumps when set.
    pub shutdown: watch::Sender<bool>,
    pub send_counter: u16,
    pub receive_counter: u16,
}

pub struct DeviceSession {
    identity: DeviceIdentity,
    connection_key: String,
    config: SessionConfig,
    state: SharedState,
    events: broadcast::Sender<SessionEvent>,
    publisher: Arc<dyn EventPublisher>,
    introspection: tokio::sync::Mutex<Option<Arc<DeviceFunctionState>>>,
    shutdown: watch::Sender<bool>,
    disconnect_count: AtomicU32,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.identity.device_id)
            .field("connection_key", &self.connection_key)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(parts: SessionParts, publisher: Arc<dyn EventPublisher>, config: SessionConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            identity: parts.identity,
            connection_key: parts.connection_key,
            config,
            state: Arc::new(Mutex::new(SessionState {
                send_counter: MessageCounter::new(parts.send_counter),
                receive_counter: MessageCounter::new(parts.receive_counter),
                tokens: TokenTable::new(),
                owner: None,
                listeners: Vec::new(),
                next_listener_id: 0,
                outgoing: Some(parts.outgoing),
                last_ping: None,
                status: SessionStatus::Active,
            })),
            events,
            publisher,
            introspection: tokio::sync::Mutex::new(None),
            shutdown: parts.shutdown,
            disconnect_count: AtomicU32::new(0),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn last_ping(&self) -> Option<Instant> {
        lock(&self.state).last_ping
    }

    pub fn send_counter(&self) -> u16 {
        lock(&self.state).send_counter.value()
    }

    pub fn receive_counter(&self) -> u16 {
        lock(&self.state).receive_counter.value()
    }

    /// Lifecycle events. Subscribe before calling [`run`](Self::run) to see `Ready`.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // --- Inbound -----------------------------------------------------------

    /// Process inbound frames until the device goes away or the session is
    /// disconnected.
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::Receiver<Bytes>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        info!(
            device_id = %self.identity.device_id,
            connection_key = %self.connection_key,
            "Session ready"
        );
        self.emit(SessionEvent::Ready);

        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = timeout(self.config.socket_timeout, incoming.recv()) => frame,
            };
            match frame {
                Err(_) => {
                    self.disconnect("socket timeout");
                    break;
                }
                Ok(None) => {
                    self.disconnect("socket closed");
                    break;
                }
                Ok(Some(frame)) => {
                    if let Err(e) = self.route_frame(frame) {
                        self.disconnect(&e.to_string());
                        break;
                    }
                }
            }
        }
    }

    /// Work out which catalog message an inbound frame is.
    ///
    /// Requests are routed by code and first path segment. Anything else is
    /// taken to be the answer to whatever request its token belongs to.
    pub fn classify(&self, message: &Message) -> Option<MessageName> {
        if let Some(name) = message::route(message.code, &message.first_segment()) {
            return Some(name);
        }
        let token = message.token?;
        let request = lock(&self.state).tokens.request_for(token)?;
        message::response_for(request, message.code)
    }

    /// Handle one decrypted frame. An error means the session must end.
    pub fn route_frame(self: &Arc<Self>, frame: Bytes) -> Result<(), ProtocolError> {
        let message = match Message::try_from(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %self.identity.device_id, "Dropping malformed frame: {}", e);
                return Ok(());
            }
        };
        let name = self.classify(&message);

        if message.is_acknowledgement() {
            let name = name.unwrap_or(MessageName::PingAck);
            trace!(device_id = %self.identity.device_id, "Received {} (id {})", name, message.id);
            self.dispatch(name, &message);
            return Ok(());
        }

        let expected = lock(&self.state).receive_counter.increment();

        if message.is_empty() && message.kind == MessageKind::Confirmable {
            lock(&self.state).last_ping = Some(Instant::now());
            trace!(device_id = %self.identity.device_id, "Keepalive {}", message.id);
            self.send_reply(MessageName::PingAck, message.id, None, None, None)?;
            return Ok(());
        }

        // Unknown and ignored messages are held to the counter as well.
        if message.id != expected {
            warn!(
                device_id = %self.identity.device_id,
                connection_key = %self.connection_key,
                expected,
                actual = message.id,
                message = ?name,
                "Receive counter mismatch"
            );
            return Err(ProtocolError::BadCounter {
                expected,
                actual: message.id,
            });
        }

        let Some(name) = name else {
            debug!(
                device_id = %self.identity.device_id,
                "Unroutable message code {:#04x} path '{}'",
                message.code,
                message.path_str()
            );
            return Ok(());
        };

        trace!(device_id = %self.identity.device_id, "Received {} (id {})", name, message.id);
        self.dispatch(name, &message);
        self.handle_request(name, &message)
    }

    fn dispatch(&self, name: MessageName, message: &Message) -> bool {
        let state = lock(&self.state);
        let mut delivered = false;
        for listener in state.listeners.iter().filter(|l| l.matches(name, message)) {
            delivered |= listener.tx.send(message.clone()).is_ok();
        }
        delivered
    }

    /// Requests the session answers itself.
    fn handle_request(self: &Arc<Self>, name: MessageName, message: &Message) -> Result<(), ProtocolError> {
        match name {
            MessageName::GetTime => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or_default();
                let payload = codec::encode(&Value::Uint32(now));
                self.send_reply(MessageName::GetTimeReturn, message.id, message.token, Some(&payload), None)
                    .or_else(log_locked)
            }
            MessageName::PublicEvent | MessageName::PrivateEvent => {
                self.publish_device_event(name == MessageName::PublicEvent, message);
                if message.kind == MessageKind::Confirmable {
                    self.send_reply(MessageName::EventAck, message.id, message.token, None, None)
                        .or_else(log_locked)?;
                }
                Ok(())
            }
            MessageName::Subscribe => self.handle_subscribe(message).or_else(log_locked),
            _ => Ok(()),
        }
    }

    fn publish_device_event(&self, is_public: bool, message: &Message) {
        let Some(event_name) = message.path_remainder().filter(|n| !n.is_empty()) else {
            debug!(device_id = %self.identity.device_id, "Event without a name");
            return;
        };
        let data = (!message.payload.is_empty()).then(|| String::from_utf8_lossy(&message.payload).into_owned());
        let mut event = DeviceEvent::new(event_name.into_owned(), data, is_public).from_device(&self.identity.device_id);
        if let Some(ttl) = message.max_age {
            event = event.with_ttl(ttl);
        }
        debug!(device_id = %self.identity.device_id, "Device published '{}'", event.name);
        self.publisher.publish(event);
    }

    fn handle_subscribe(self: &Arc<Self>, message: &Message) -> Result<(), ProtocolError> {
        let prefix = message.path_remainder().map(|p| p.into_owned()).unwrap_or_default();
        if prefix.is_empty() {
            return self.send_reply(MessageName::SubscribeFail, message.id, message.token, None, None);
        }

        let session: Weak<Self> = Arc::downgrade(self);
        let filter = SubscriptionFilter {
            include_private: true,
            ..SubscriptionFilter::owned_by(self.connection_key.clone())
        };
        self.publisher.subscribe(
            &prefix,
            filter,
            Arc::new(move |event: &DeviceEvent| {
                if let Some(session) = session.upgrade() {
                    if let Err(e) = session.send_event(event) {
                        debug!(device_id = %session.identity.device_id, "Event not forwarded: {}", e);
                    }
                }
            }),
        );
        debug!(device_id = %self.identity.device_id, "Subscribed to '{}'", prefix);
        self.send_reply(MessageName::SubscribeAck, message.id, message.token, None, None)
    }

    /// Register a wait for `names`, optionally narrowed to a URI path prefix
    /// and a token.
    pub fn listen(
        &self,
        names: &[MessageName],
        uri_prefix: Option<&str>,
        token: Option<u8>,
    ) -> Result<Subscription, ProtocolError> {
        let mut state = lock(&self.state);
        if state.outgoing.is_none() {
            return Err(ProtocolError::Disconnected);
        }
        Ok(self.register(&mut state, names, uri_prefix, token, None))
    }

    fn register(
        &self,
        state: &mut SessionState,
        names: &[MessageName],
        uri_prefix: Option<&str>,
        token: Option<u8>,
        owned_token: Option<u8>,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push(Listener {
            id,
            names: names.to_vec(),
            uri_prefix: uri_prefix.map(|p| p.as_bytes().to_vec()),
            token,
            tx,
        });
        let label = names.iter().map(ToString::to_string).collect::<Vec<_>>().join("|");
        Subscription {
            id,
            token: owned_token,
            label,
            state: Arc::clone(&self.state),
            rx,
        }
    }

    // --- Outbound ----------------------------------------------------------

    fn check_owner(state: &SessionState, owner: Option<OwnerId>) -> Result<(), ProtocolError> {
        match state.owner {
            Some(current) if owner != Some(current) => Err(ProtocolError::SessionLocked),
            _ => Ok(()),
        }
    }

    /// Send a catalog message, returning its id and the token assigned to it.
    ///
    /// When `awaiting` is set, a listener for the answer is registered under
    /// the same lock as the send so the reply cannot slip past it.
    fn send_inner(
        &self,
        name: MessageName,
        request: &Request,
        awaiting: bool,
    ) -> Result<(u16, Option<u8>, Option<Subscription>), ProtocolError> {
        let spec = message::spec(name);
        let mut state = lock(&self.state);
        Self::check_owner(&state, request.owner)?;
        let outgoing = state.outgoing.clone().ok_or(ProtocolError::NotConnected)?;

        let id = state.send_counter.increment();
        let token = if spec.expects_response() {
            Some(state.tokens.allocate(name)?)
        } else {
            None
        };

        let mut message = Message::build(name, id, &request.params).with_token(token);
        if let Some(payload) = &request.payload {
            message = message.with_payload(payload.clone());
        }
        if let Some(max_age) = request.max_age {
            message = message.with_max_age(max_age);
        }
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(token) = token {
                    state.tokens.clear(token);
                }
                return Err(e);
            }
        };

        // No Subscription may exist yet: dropping one locks `state` again.
        if outgoing.send(bytes).is_err() {
            if let Some(token) = token {
                state.tokens.clear(token);
            }
            return Err(ProtocolError::NotConnected);
        }

        // Still under the lock, so the reply cannot be routed before this.
        let subscription = match (awaiting, token) {
            (true, Some(token)) => {
                let names: Vec<MessageName> = spec.response.into_iter().chain(spec.error_response).collect();
                Some(self.register(&mut state, &names, None, Some(token), Some(token)))
            }
            (_, Some(token)) if request.untracked => {
                state.tokens.clear(token);
                None
            }
            _ => None,
        };
        trace!(device_id = %self.identity.device_id, "Sent {} (id {}, token {:?})", name, id, token);
        Ok((id, token, subscription))
    }

    /// Send a message nobody waits on. Returns the token it carries.
    ///
    /// The token is released straight away, so any answer is classified as
    /// a bare ack. Use [`request`](Self::request) when the answer matters.
    pub fn send_message(&self, name: MessageName, request: &Request) -> Result<Option<u8>, ProtocolError> {
        let request = if message::spec(name).expects_response() && !request.untracked {
            request.clone().untracked()
        } else {
            request.clone()
        };
        self.send_inner(name, &request, false).map(|(_, token, _)| token)
    }

    /// Send a request and subscribe to its answer.
    pub fn request(&self, name: MessageName, request: &Request) -> Result<Subscription, ProtocolError> {
        match self.send_inner(name, request, true)? {
            (_, _, Some(subscription)) => Ok(subscription),
            _ => Err(ProtocolError::UnknownMessage(format!("{name} expects no response"))),
        }
    }

    /// Answer a device request, reusing its message id and token.
    ///
    /// Keepalive acks are transport-level and go out even while the session
    /// is owned.
    pub fn send_reply(
        &self,
        name: MessageName,
        id: u16,
        token: Option<u8>,
        payload: Option<&[u8]>,
        owner: Option<OwnerId>,
    ) -> Result<(), ProtocolError> {
        let state = lock(&self.state);
        if name != MessageName::PingAck {
            Self::check_owner(&state, owner)?;
        }
        let outgoing = state.outgoing.clone().ok_or(ProtocolError::NotConnected)?;
        drop(state);

        let mut message = Message::build(name, id, &UriParams::new()).with_token(token);
        if let Some(payload) = payload {
            message = message.with_payload(Bytes::copy_from_slice(payload));
        }
        outgoing
            .send(message.to_bytes()?)
            .map_err(|_| ProtocolError::NotConnected)
    }

    // --- Ownership ---------------------------------------------------------

    pub fn take_ownership(&self, owner: OwnerId) -> Result<(), ProtocolError> {
        let mut state = lock(&self.state);
        if state.owner.is_some() {
            return Err(ProtocolError::SessionLocked);
        }
        state.owner = Some(owner);
        Ok(())
    }

    pub fn release_ownership(&self, owner: OwnerId) {
        let mut state = lock(&self.state);
        match state.owner {
            Some(current) if current == owner => state.owner = None,
            current => warn!(
                device_id = %self.identity.device_id,
                "Ownership release by {:?} but owner is {:?}",
                owner,
                current
            ),
        }
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.state).owner.is_some()
    }

    // --- Device API --------------------------------------------------------

    /// Fetch the function and variable description once per session.
    ///
    /// Concurrent callers share a single `Describe` round trip.
    pub async fn ensure_introspection_data(&self) -> Result<Arc<DeviceFunctionState>, ProtocolError> {
        let mut cached = self.introspection.lock().await;
        if let Some(state) = cached.as_ref() {
            return Ok(Arc::clone(state));
        }
        let state = Arc::new(self.fetch_description().await?);
        *cached = Some(Arc::clone(&state));
        Ok(state)
    }

    pub async fn get_description(&self) -> Result<Arc<DeviceFunctionState>, ProtocolError> {
        self.ensure_introspection_data().await
    }

    async fn fetch_description(&self) -> Result<DeviceFunctionState, ProtocolError> {
        let mut pending = self.request(MessageName::Describe, &Request::new())?;
        let first = pending.recv_timeout(self.config.keepalive_timeout).await?;
        ensure_success(MessageName::Describe, &first)?;

        let mut state = DeviceFunctionState::parse(&first.payload)?;
        if state.has_functions_and_variables() {
            return Ok(state);
        }

        // Newer firmware sends the application description separately.
        match pending.recv_timeout(self.config.describe_followup_timeout).await {
            Ok(second) if second.is_success() => state.merge(DeviceFunctionState::parse(&second.payload)?),
            Ok(second) => debug!(
                device_id = %self.identity.device_id,
                "Second DescribeReturn carried error {:#04x}",
                second.code
            ),
            Err(ProtocolError::Timeout(_)) => {
                debug!(device_id = %self.identity.device_id, "Only one DescribeReturn arrived")
            }
            Err(e) => return Err(e),
        }
        Ok(state)
    }

    pub async fn get_variable_value(&self, name: &str) -> Result<Value, ProtocolError> {
        let description = self.ensure_introspection_data().await?;
        let ty = description
            .variable_type(name)
            .ok_or_else(|| ProtocolError::VariableNotFound(name.to_string()))?;

        let mut pending = self.request(MessageName::VariableRequest, &Request::new().param("name", name))?;
        let reply = pending.recv_timeout(self.config.keepalive_timeout).await?;
        ensure_success(MessageName::VariableRequest, &reply)?;
        codec::decode(ty, &reply.payload)
    }

    pub async fn call_function(&self, name: &str, args: &[&str]) -> Result<Value, ProtocolError> {
        let description = self.ensure_introspection_data().await?;
        let signature = description
            .function_signature(name)
            .ok_or_else(|| ProtocolError::UnknownFunction(name.to_string()))?;
        let encoded = codec::build_arguments(args, &signature.args)?;

        let request = Request::new().param("name", &signature.name).param("args", encoded);
        let mut pending = self.request(MessageName::FunctionCall, &request)?;
        let reply = pending.recv_timeout(self.config.keepalive_timeout).await?;
        ensure_success(MessageName::FunctionCall, &reply)?;
        codec::decode(signature.returns, &reply.payload)
    }

    /// Ask the device to show (or stop showing) its signal LED pattern.
    pub async fn raise_hand(&self, show: bool) -> Result<(), ProtocolError> {
        let request = Request::new().params(UriParams::new().raw_query(vec![u8::from(show)]));
        let mut pending = self.request(MessageName::SignalStart, &request)?;
        let reply = pending.recv_timeout(self.config.keepalive_timeout).await?;
        ensure_success(MessageName::SignalStart, &reply)
    }

    /// Round-trip an empty confirmable message.
    pub async fn ping(&self) -> Result<Duration, ProtocolError> {
        let mut acks = self.listen(&[MessageName::PingAck], None, None)?;
        let started = Instant::now();
        let (id, _, _) = self.send_inner(MessageName::Ping, &Request::new(), false)?;
        let deadline = self.config.keepalive_timeout;
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            let ack = acks.recv_timeout(remaining).await?;
            if ack.id == id {
                return Ok(started.elapsed());
            }
        }
    }

    /// Forward a published event to the device. Events the device published
    /// itself are not echoed back.
    pub fn send_event(&self, event: &DeviceEvent) -> Result<(), ProtocolError> {
        if event.device_id.as_deref() == Some(self.identity.device_id.as_str()) {
            return Ok(());
        }
        let name = if event.is_public {
            MessageName::PublicEvent
        } else {
            MessageName::PrivateEvent
        };
        let mut request = Request::new().param("event_name", &event.name).max_age(event.ttl);
        if let Some(data) = &event.data {
            request = request.payload(Bytes::copy_from_slice(data.as_bytes()));
        }
        self.send_message(name, &request).map(|_| ())
    }

    /// Transfer firmware to the device, announcing progress as session events.
    pub async fn flash(self: &Arc<Self>, binary: Bytes, config: FlashConfig) -> Result<(), ProtocolError> {
        if self.is_busy() {
            return Err(ProtocolError::SessionLocked);
        }
        info!(device_id = %self.identity.device_id, "Flashing {} bytes", binary.len());
        self.emit(SessionEvent::FlashStarted);

        let result = FirmwareFlasher::new(Arc::clone(self), config).run(binary).await;
        match &result {
            Ok(()) => {
                info!(device_id = %self.identity.device_id, "Flash succeeded");
                self.emit(SessionEvent::FlashSucceeded);
            }
            Err(e) => {
                warn!(device_id = %self.identity.device_id, "Flash failed: {}", e);
                self.emit(SessionEvent::FlashFailed { reason: e.to_string() });
            }
        }
        result
    }

    // --- Teardown ----------------------------------------------------------

    /// End the session. Only the first call does anything.
    pub fn disconnect(&self, reason: &str) {
        let count = self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        if count > 0 {
            debug!(device_id = %self.identity.device_id, "Disconnect #{} ignored: {}", count + 1, reason);
            return;
        }
        info!(
            device_id = %self.identity.device_id,
            connection_key = %self.connection_key,
            reason,
            "Session disconnected"
        );

        // Closes the socket and both cipher pumps.
        self.shutdown.send_replace(true);
        {
            let mut state = lock(&self.state);
            state.outgoing = None;
            state.status = SessionStatus::Disconnected;
        }
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
        {
            // Dropping the senders wakes every pending wait with Disconnected.
            let mut state = lock(&self.state);
            state.listeners.clear();
            state.tokens.clear_all();
        }
        self.publisher.unsubscribe_by_owner(&self.connection_key);
    }
}

fn ensure_success(request: MessageName, reply: &Message) -> Result<(), ProtocolError> {
    if reply.is_success() {
        Ok(())
    } else {
        Err(ProtocolError::ErrorResponse {
            request: request.to_string(),
            code: reply.code,
        })
    }
}

/// Built-in replies are skipped while a flasher owns the session.
fn log_locked(e: ProtocolError) -> Result<(), ProtocolError> {
    match e {
        ProtocolError::SessionLocked => {
            debug!("Reply suppressed while session is owned");
            Ok(())
        }
        other => Err(other),
    }
}
