//! The root STOMP connection: handshake, frame pump, heartbeats.
//!
//! A [`Connection`] sits at the bottom of the layering chain. It owns the
//! transport collaborator, performs the CONNECT/CONNECTED handshake, runs
//! the read pump that decodes raw messages into the frame broadcast, and
//! keeps the heartbeat timers armed. Subscriptions and transactions stack
//! on top through the [`StompClient`] trait.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::client::{RequestHandler, StompClient};
use crate::codec::{self, StompItem};
use crate::config::{ConnectConfig, DisconnectConfig};
use crate::error::StompError;
use crate::frame::{Frame, FrameType, StompVersion, headers};
use crate::heartbeat::{
    ActivityClock, HeartbeatTimers, format_heartbeat_header, negotiate_heartbeats,
    parse_heartbeat_header,
};
use crate::receipt::await_receipt;
use crate::session::SessionInfo;
use crate::state::{StatusCell, StatusStream};
use crate::transport::{RawMessage, Transport, TransportError};

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a STOMP session over one connection.
///
/// `Disconnected` is terminal for the session, not for the object: a new
/// `connect` call starts a fresh handshake on the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Uninitialized,
    Connected,
    Disconnected,
}

/// A STOMP client connection over a message-framed transport.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: String,
    transport: Arc<dyn Transport>,
    accepted_versions: Vec<StompVersion>,
    status: StatusCell<ConnectionStatus>,
    /// Sender side of the frame broadcast; present while the pump runs.
    messages: StdMutex<Option<broadcast::Sender<Frame>>>,
    session: StdMutex<Option<Arc<SessionInfo>>>,
    pump: StdMutex<Option<CancellationToken>>,
    heartbeats: StdMutex<Option<HeartbeatTimers>>,
    send_clock: ActivityClock,
    receive_clock: ActivityClock,
    request_handler: OnceLock<RequestHandler>,
    /// Serializes connect/disconnect sequences.
    op_lock: AsyncMutex<()>,
}

impl Connection {
    /// Create a connection accepting the given protocol versions. An empty
    /// list defaults to 1.1 and 1.2.
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        accepted_versions: Vec<StompVersion>,
    ) -> Self {
        let mut versions = accepted_versions;
        if versions.is_empty() {
            versions = vec![StompVersion::V1_1, StompVersion::V1_2];
        }
        versions.sort();
        versions.dedup();

        let inner = Arc::new(ConnectionInner {
            id: id.into(),
            transport,
            accepted_versions: versions,
            status: StatusCell::new(ConnectionStatus::Uninitialized),
            messages: StdMutex::new(None),
            session: StdMutex::new(None),
            pump: StdMutex::new(None),
            heartbeats: StdMutex::new(None),
            send_clock: ActivityClock::new(),
            receive_clock: ActivityClock::new(),
            request_handler: OnceLock::new(),
            op_lock: AsyncMutex::new(()),
        });
        inner.clone().spawn_transport_watcher();
        Self { inner }
    }

    /// A legacy STOMP 1.0 connection: no version negotiation, trimmed
    /// header values.
    pub fn v10(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::new(id, transport, vec![StompVersion::V1_0])
    }

    /// A modern connection negotiating 1.1 or 1.2.
    pub fn v11(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            id,
            transport,
            vec![StompVersion::V1_1, StompVersion::V1_2],
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Install the caller hook applied to every outgoing frame after the
    /// connection's own header injection. Only the first call takes effect.
    pub fn set_request_handler(&self, handler: RequestHandler) {
        if self.inner.request_handler.set(handler).is_err() {
            tracing::warn!(connection = %self.inner.id, "request handler already installed");
        }
    }

    /// Perform the CONNECT handshake.
    ///
    /// Returns the negotiated session, or `Ok(None)` when already connected
    /// (the call is an idempotent no-op). Any failure leaves the connection
    /// `Disconnected`.
    pub async fn connect(
        &self,
        config: &ConnectConfig,
    ) -> Result<Option<Arc<SessionInfo>>, StompError> {
        let _op = self.inner.op_lock.lock().await;
        if self.inner.status.get() == ConnectionStatus::Connected {
            tracing::debug!(connection = %self.inner.id, "connect ignored: already connected");
            return Ok(None);
        }

        let versions = if config.accepted_versions.is_empty() {
            self.inner.accepted_versions.clone()
        } else {
            let mut v = config.accepted_versions.clone();
            v.sort();
            v.dedup();
            v
        };
        // header trimming is a property of the client generation: a set of
        // accepted versions that is exactly {1.0} makes this a legacy client
        let legacy = versions.iter().all(|v| *v == StompVersion::V1_0);

        // subscribe before sending so the CONNECTED frame cannot slip past
        let mut raw_rx = self.inner.transport.message_stream();
        let mut status_rx = self.inner.transport.status_stream();

        let mut connect = Frame::new(FrameType::Connect);
        if !legacy {
            if let Some((send, receive)) = config.heartbeat {
                connect.headers.set(
                    headers::HEARTBEAT,
                    format_heartbeat_header(send.as_millis() as u64, receive.as_millis() as u64),
                );
            }
            if let Some(host) = &config.host {
                connect.headers.set(headers::HOST, host.clone());
            }
            let accept: Vec<&str> = versions.iter().map(|v| v.as_str()).collect();
            connect.headers.set(headers::ACCEPT_VERSION, accept.join(","));
        }
        if let Some(login) = &config.login {
            connect.headers.set(headers::LOGIN, login.clone());
        }
        if let Some(passcode) = &config.passcode {
            connect.headers.set(headers::PASSCODE, passcode.clone());
        }

        let connect = self.inner.send_populated(connect).await.inspect_err(|_| {
            self.inner.set_disconnected();
        })?;

        let handshake = async {
            loop {
                tokio::select! {
                    raw = raw_rx.recv() => match raw {
                        Ok(raw) => match codec::decode(&raw, legacy)? {
                            StompItem::Heartbeat => continue,
                            StompItem::Frame(frame) => match frame.frame_type {
                                FrameType::Connected => return Ok(frame),
                                FrameType::Error => {
                                    return Err(StompError::ConnectFailed {
                                        error_frame: Some(Box::new(frame)),
                                    });
                                }
                                other => {
                                    tracing::debug!(
                                        connection = %self.inner.id,
                                        frame_type = %other,
                                        "ignoring frame during handshake"
                                    );
                                    continue;
                                }
                            },
                        },
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(StompError::StreamClosed);
                        }
                    },
                    changed = status_rx.changed() => {
                        let terminal = changed.is_err()
                            || status_rx.borrow_and_update().is_terminal();
                        if terminal {
                            return Err(StompError::ConnectFailed { error_frame: None });
                        }
                    }
                }
            }
        };

        let connected = match tokio::time::timeout(config.connect_timeout, handshake).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.inner.set_disconnected();
                return Err(e);
            }
            Err(_) => {
                self.inner.set_disconnected();
                return Err(StompError::Timeout("CONNECTED frame"));
            }
        };

        let version = if legacy {
            StompVersion::V1_0
        } else {
            let declared = connected.get_header(headers::VERSION).unwrap_or_default();
            match StompVersion::parse(declared) {
                Some(v) if versions.contains(&v) => v,
                _ => {
                    self.inner.set_disconnected();
                    return Err(StompError::UnsupportedVersion(declared.to_string()));
                }
            }
        };

        let (client_send, client_receive) = config
            .heartbeat
            .map(|(s, r)| (s.as_millis() as u64, r.as_millis() as u64))
            .unwrap_or((0, 0));
        let (server_send, server_receive) = connected
            .get_header(headers::HEARTBEAT)
            .map(parse_heartbeat_header)
            .unwrap_or((0, 0));
        let (send_interval, receive_interval) =
            negotiate_heartbeats(client_send, client_receive, server_send, server_receive);

        let session = Arc::new(SessionInfo {
            version,
            session_id: connected.get_header(headers::SESSION).map(str::to_string),
            server: connected.get_header(headers::SERVER).map(str::to_string),
            client_heartbeat: config.heartbeat,
            server_heartbeat: if server_send > 0 || server_receive > 0 {
                Some((
                    std::time::Duration::from_millis(server_send),
                    std::time::Duration::from_millis(server_receive),
                ))
            } else {
                None
            },
            connect_frame: connect,
            connected_frame: connected,
        });
        // the transport can die between the CONNECTED frame and this point;
        // the watcher has already torn down, so do not overwrite its verdict
        if status_rx.borrow_and_update().is_terminal() {
            self.inner.set_disconnected();
            return Err(StompError::ConnectFailed { error_frame: None });
        }

        tracing::info!(
            connection = %self.inner.id,
            version = %version,
            session = session.session_id.as_deref().unwrap_or("-"),
            "connected"
        );

        *self.inner.lock_slot(&self.inner.session) = Some(session.clone());
        self.inner.receive_clock.touch();
        self.inner.status.set(ConnectionStatus::Connected);
        self.inner.clone().start_pump(raw_rx, legacy);
        if version.supports_heartbeat() {
            self.inner.start_heartbeats(send_interval, receive_interval);
        }
        Ok(Some(session))
    }

    /// Tear the session down, optionally sending DISCONNECT and waiting for
    /// its receipt.
    ///
    /// Returns the RECEIPT frame when one was requested and confirmed;
    /// `Ok(None)` otherwise, including when already disconnected. The local
    /// teardown always happens, even when the DISCONNECT send or the receipt
    /// wait fails.
    pub async fn disconnect(
        &self,
        config: &DisconnectConfig,
    ) -> Result<Option<Frame>, StompError> {
        let _op = self.inner.op_lock.lock().await;
        if self.inner.status.get() != ConnectionStatus::Connected {
            tracing::debug!(connection = %self.inner.id, "disconnect ignored: not connected");
            return Ok(None);
        }

        let mut receipt_frame = None;
        if config.send_disconnect {
            let mut frame = Frame::new(FrameType::Disconnect);
            let receipt_rx = match &config.receipt {
                Some(receipt) => {
                    frame.headers.set(headers::RECEIPT, receipt.clone());
                    Some(self.message_stream())
                }
                None => None,
            };
            match self.inner.send_populated(frame).await {
                Ok(_) => {
                    if let (Some(rx), Some(receipt)) = (receipt_rx, &config.receipt) {
                        match await_receipt(rx, receipt, Some(config.receipt_wait)).await {
                            Ok(frame) => receipt_frame = Some(frame),
                            Err(e) => tracing::warn!(
                                connection = %self.inner.id,
                                error = %e,
                                "disconnect receipt not confirmed"
                            ),
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    connection = %self.inner.id,
                    error = %e,
                    "failed to send DISCONNECT frame"
                ),
            }
        }

        self.inner.set_disconnected();
        Ok(receipt_frame)
    }
}

impl ConnectionInner {
    fn lock_slot<'a, T>(&self, slot: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Populate, encode, and send one frame. Returns the frame as sent.
    async fn send_populated(&self, frame: Frame) -> Result<Frame, StompError> {
        let frame = self.populate(frame);
        self.transport.send(codec::encode(&frame)).await?;
        self.send_clock.touch();
        Ok(frame)
    }

    /// The root of the population chain: `content-type` when a body type was
    /// declared, `content-length` always (from the UTF-8 byte length of the
    /// body), then the caller's request handler.
    fn populate(&self, mut frame: Frame) -> Frame {
        if let Some(content_type) = frame.content_type.clone() {
            frame.headers.set(headers::CONTENT_TYPE, content_type);
        }
        frame
            .headers
            .set(headers::CONTENT_LENGTH, frame.content_length().to_string());
        match self.request_handler.get() {
            Some(handler) => handler(frame),
            None => frame,
        }
    }

    /// Force the disconnected state and stop all background work. Safe to
    /// call from any path, any number of times.
    fn set_disconnected(&self) {
        *self.lock_slot(&self.session) = None;
        if let Some(timers) = self.lock_slot(&self.heartbeats).take() {
            timers.cancel();
        }
        if let Some(token) = self.lock_slot(&self.pump).take() {
            token.cancel();
        }
        // dropping the sender closes the broadcast so layers cascade
        self.lock_slot(&self.messages).take();
        if self.status.set(ConnectionStatus::Disconnected) {
            tracing::info!(connection = %self.id, "disconnected");
        }
    }

    /// Mirror terminal transport states into the connection status.
    fn spawn_transport_watcher(self: Arc<Self>) {
        let mut status_rx = self.transport.status_stream();
        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                let terminal = status_rx.borrow_and_update().is_terminal();
                if terminal {
                    if let Some(inner) = weak.upgrade() {
                        inner.set_disconnected();
                    }
                    break;
                }
                if status_rx.changed().await.is_err() {
                    if let Some(inner) = weak.upgrade() {
                        inner.set_disconnected();
                    }
                    break;
                }
            }
        });
    }

    /// Start the read pump over the raw stream carried through the
    /// handshake, so no frame between CONNECTED and pump start is lost.
    fn start_pump(self: Arc<Self>, mut raw_rx: broadcast::Receiver<RawMessage>, trim: bool) {
        let token = CancellationToken::new();
        let (tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        *self.lock_slot(&self.pump) = Some(token.clone());
        *self.lock_slot(&self.messages) = Some(tx.clone());

        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    raw = raw_rx.recv() => match raw {
                        Ok(raw) => {
                            let inner = match weak.upgrade() {
                                Some(inner) => inner,
                                None => break,
                            };
                            match codec::decode(&raw, trim) {
                                Ok(StompItem::Heartbeat) => inner.receive_clock.touch(),
                                Ok(StompItem::Frame(frame)) => {
                                    inner.receive_clock.touch();
                                    if frame.frame_type == FrameType::Error {
                                        tracing::warn!(
                                            connection = %inner.id,
                                            message = frame.get_header("message").unwrap_or("-"),
                                            "ERROR frame received"
                                        );
                                        if let Some(timers) =
                                            inner.lock_slot(&inner.heartbeats).take()
                                        {
                                            timers.cancel();
                                        }
                                    }
                                    let _ = tx.send(frame);
                                }
                                Err(e) => {
                                    tracing::error!(
                                        connection = %inner.id,
                                        error = %e,
                                        "undecodable payload, stopping read pump"
                                    );
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            if let Some(inner) = weak.upgrade() {
                                tracing::warn!(
                                    connection = %inner.id,
                                    skipped,
                                    "read pump lagged behind transport"
                                );
                            }
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            // a pump that died on its own takes the session down with it
            if !token.is_cancelled() {
                if let Some(inner) = weak.upgrade() {
                    inner.set_disconnected();
                }
            }
        });
    }

    fn start_heartbeats(
        self: &Arc<Self>,
        send_interval: Option<std::time::Duration>,
        receive_interval: Option<std::time::Duration>,
    ) {
        if send_interval.is_none() && receive_interval.is_none() {
            return;
        }
        tracing::debug!(
            connection = %self.id,
            send_ms = send_interval.map(|d| d.as_millis() as u64),
            receive_ms = receive_interval.map(|d| d.as_millis() as u64),
            "starting heartbeat timers"
        );
        let weak = Arc::downgrade(self);
        let id = self.id.clone();
        let timers = HeartbeatTimers::start(
            send_interval,
            receive_interval,
            self.send_clock.clone(),
            self.receive_clock.clone(),
            self.transport.clone(),
            Box::new(move || {
                tracing::warn!(connection = %id, "heartbeat allowance exceeded");
                if let Some(inner) = weak.upgrade() {
                    inner.set_disconnected();
                }
            }),
        );
        let mut slot = self.lock_slot(&self.heartbeats);
        if let Some(old) = slot.take() {
            old.cancel();
        }
        *slot = Some(timers);
    }

    fn frames(&self) -> broadcast::Receiver<Frame> {
        match self.lock_slot(&self.messages).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // a pre-closed receiver: recv() resolves to Closed at once
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }
}

impl StompClient for Connection {
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), StompError>> {
        Box::pin(async move {
            if self.inner.status.get() != ConnectionStatus::Connected {
                return Err(StompError::Transport(TransportError::NotOpen));
            }
            self.inner.send_populated(frame).await.map(|_| ())
        })
    }

    fn populate_request(&self, frame: Frame) -> Frame {
        self.inner.populate(frame)
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    fn status_stream(&self) -> StatusStream<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    fn message_stream(&self) -> broadcast::Receiver<Frame> {
        self.inner.frames()
    }

    fn receipt_stream(&self) -> broadcast::Receiver<Frame> {
        self.inner.frames()
    }

    fn session_info(&self) -> Option<Arc<SessionInfo>> {
        self.inner.lock_slot(&self.inner.session).clone()
    }

    fn accepted_versions(&self) -> Vec<StompVersion> {
        self.inner.accepted_versions.clone()
    }

    fn describe(&self) -> String {
        format!("connection[{}]", self.inner.id)
    }
}
