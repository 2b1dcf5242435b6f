//! TCP front end: accepts device connections and runs one session per socket.

use crate::config::ServerConfig;
use crate::error::Error;
use bytes::Bytes;
use sparkproto_lib::events::{DeviceEvent, EventPublisher, SessionEvent};
use sparkproto_lib::handshake::{self, Handshake, HandshakeContext};
use sparkproto_lib::repository::KeyRepository;
use sparkproto_lib::DeviceSession;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Event name announcing a device going online or offline.
pub const STATUS_EVENT: &str = "spark/status";

/// Live sessions by device ID. A reconnecting device replaces its old session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `session`, returning the one it replaces.
    pub fn insert(&self, session: Arc<DeviceSession>) -> Option<Arc<DeviceSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(session.device_id().to_string(), session)
    }

    /// Forget `session`, unless a newer connection already took its place.
    pub fn remove(&self, session: &Arc<DeviceSession>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(session.device_id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.device_id());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct Server {
    config: ServerConfig,
    repository: Arc<dyn KeyRepository>,
    publisher: Arc<dyn EventPublisher>,
    registry: SessionRegistry,
    /// Flashed to every device once its session is ready.
    firmware: Option<Bytes>,
    connections: AtomicU64,
}

impl Server {
    pub fn new(config: ServerConfig, repository: Arc<dyn KeyRepository>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            config,
            repository,
            publisher,
            registry: SessionRegistry::new(),
            firmware: None,
            connections: AtomicU64::new(0),
        }
    }

    pub fn with_firmware(mut self, firmware: Bytes) -> Self {
        self.firmware = Some(firmware);
        self
    }

    pub async fn bind(&self) -> Result<TcpListener, Error> {
        let listener = TcpListener::bind(self.config.bind).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.handle_connection(socket, addr).await });
        }
    }

    fn next_connection_key(&self, addr: SocketAddr) -> String {
        let n = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{n}_{addr}")
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(%addr, "Cannot set TCP_NODELAY: {}", e);
        }
        let ctx = HandshakeContext {
            repository: Arc::clone(&self.repository),
            publisher: Arc::clone(&self.publisher),
            handshake: self.config.handshake,
            session: self.config.session,
            connection_key: self.next_connection_key(addr),
        };
        debug!(connection_key = %ctx.connection_key, "New connection");

        // perform() logs its own failures.
        let Ok(Handshake { session, incoming }) = handshake::perform(socket, &ctx).await else {
            return;
        };

        if let Some(previous) = self.registry.insert(Arc::clone(&session)) {
            previous.disconnect("replaced by a new connection");
        }
        info!(device_id = %session.device_id(), "{} devices online", self.registry.len());
        // Subscribed before run() so Ready is not missed.
        let events = session.subscribe_events();
        tokio::spawn(Arc::clone(&self).watch_session(Arc::clone(&session), events));
        Arc::clone(&session).run(incoming).await;
        self.registry.remove(&session);
    }

    /// Publish status changes and start the configured flash.
    async fn watch_session(self: Arc<Self>, session: Arc<DeviceSession>, mut events: broadcast::Receiver<SessionEvent>) {
        let device_id = session.device_id().to_string();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(device_id = %device_id, "Missed {} session events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                SessionEvent::Ready => {
                    self.publish_status(&device_id, "online");
                    if let Some(firmware) = self.firmware.clone() {
                        let session = Arc::clone(&session);
                        let config = self.config.flash;
                        // The outcome arrives here as FlashSucceeded or FlashFailed.
                        tokio::spawn(async move {
                            let _ = session.flash(firmware, config).await;
                        });
                    }
                }
                SessionEvent::Disconnected { reason } => {
                    debug!(device_id = %device_id, %reason, "Session closed");
                    self.publish_status(&device_id, "offline");
                    break;
                }
                SessionEvent::FlashStarted => info!(device_id = %device_id, "Flash started"),
                SessionEvent::FlashSucceeded => info!(device_id = %device_id, "Flash succeeded"),
                SessionEvent::FlashFailed { reason } => warn!(device_id = %device_id, %reason, "Flash failed"),
            }
        }
    }

    fn publish_status(&self, device_id: &str, status: &str) {
        self.publisher
            .publish(DeviceEvent::new(STATUS_EVENT, Some(status.to_string()), false).from_device(device_id));
    }
}
