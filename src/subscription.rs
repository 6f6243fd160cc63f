//! Destination subscriptions layered on a connection.
//!
//! A [`Subscription`] decorates any [`StompClient`] delegate. It injects
//! `destination`/`id`/`ack` headers into the frames that need them, filters
//! the delegate's inbound broadcast down to its own MESSAGE deliveries, and
//! drives the version-specific acknowledgement protocol.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::client::{RequestHandler, ResponseHandler, StompClient};
use crate::connection::ConnectionStatus;
use crate::error::StompError;
use crate::frame::{Frame, FrameType, StompVersion, headers};
use crate::receipt::await_receipt;
use crate::session::SessionInfo;
use crate::state::{StatusCell, StatusStream};

const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of one subscription. `Unsubscribed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Uninitialized,
    Subscribed,
    Unsubscribed,
}

/// STOMP acknowledgement modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

/// A subscription to one destination, stacked on a delegate client.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    delegate: Arc<dyn StompClient>,
    destination: String,
    /// Subscription id; required by 1.1/1.2 brokers to route deliveries.
    id: Option<String>,
    ack_mode: AckMode,
    status: StatusCell<SubscriptionStatus>,
    messages: StdMutex<Option<broadcast::Sender<Frame>>>,
    pump: StdMutex<Option<CancellationToken>>,
    request_handler: OnceLock<RequestHandler>,
    response_handler: OnceLock<ResponseHandler>,
    op_lock: AsyncMutex<()>,
}

impl Subscription {
    pub fn new(
        delegate: Arc<dyn StompClient>,
        destination: impl Into<String>,
        id: Option<String>,
        ack_mode: AckMode,
    ) -> Self {
        let inner = Arc::new(SubscriptionInner {
            delegate,
            destination: destination.into(),
            id,
            ack_mode,
            status: StatusCell::new(SubscriptionStatus::Uninitialized),
            messages: StdMutex::new(None),
            pump: StdMutex::new(None),
            request_handler: OnceLock::new(),
            response_handler: OnceLock::new(),
            op_lock: AsyncMutex::new(()),
        });
        inner.clone().spawn_connection_watcher();
        Self { inner }
    }

    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }

    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    pub fn subscription_status(&self) -> SubscriptionStatus {
        self.inner.status.get()
    }

    pub fn subscription_status_stream(&self) -> StatusStream<SubscriptionStatus> {
        self.inner.status.subscribe()
    }

    /// Install the hook run on outgoing frames after this layer's header
    /// injection. Only the first call takes effect.
    pub fn set_request_handler(&self, handler: RequestHandler) {
        if self.inner.request_handler.set(handler).is_err() {
            tracing::warn!(subscription = %self.inner.destination, "request handler already installed");
        }
    }

    /// Install the hook run on each delivered MESSAGE; its result drives
    /// the ack/nack decision. Only the first call takes effect.
    pub fn set_response_handler(&self, handler: ResponseHandler) {
        if self.inner.response_handler.set(handler).is_err() {
            tracing::warn!(subscription = %self.inner.destination, "response handler already installed");
        }
    }

    /// Send SUBSCRIBE and start delivering messages.
    ///
    /// With a receipt id the subscription only becomes `Subscribed` once the
    /// broker confirms; without one it is assumed immediately. `Ok(None)`
    /// when already subscribed.
    pub async fn subscribe(&self, receipt: Option<&str>) -> Result<Option<Frame>, StompError> {
        let _op = self.inner.op_lock.lock().await;
        if self.inner.status.get() == SubscriptionStatus::Subscribed {
            tracing::debug!(subscription = %self.inner.destination, "subscribe ignored: already subscribed");
            return Ok(None);
        }

        let mut frame = Frame::new(FrameType::Subscribe);
        let receipt_rx = match receipt {
            Some(receipt) => {
                frame.headers.set(headers::RECEIPT, receipt);
                Some(self.inner.delegate.receipt_stream())
            }
            None => None,
        };

        if let Err(e) = self.send(frame).await {
            self.inner.force_unsubscribed();
            return Err(e);
        }

        match (receipt_rx, receipt) {
            (Some(rx), Some(receipt)) => match await_receipt(rx, receipt, None).await {
                Ok(confirmation) => {
                    self.inner.status.set(SubscriptionStatus::Subscribed);
                    self.inner.clone().connect_pump();
                    Ok(Some(confirmation))
                }
                Err(e) => {
                    self.inner.force_unsubscribed();
                    Err(e)
                }
            },
            _ => {
                self.inner.status.set(SubscriptionStatus::Subscribed);
                self.inner.clone().connect_pump();
                Ok(None)
            }
        }
    }

    /// Send UNSUBSCRIBE. The subscription ends `Unsubscribed` on every
    /// outcome, confirmed or not. `Ok(None)` when not currently subscribed.
    pub async fn unsubscribe(&self, receipt: Option<&str>) -> Result<Option<Frame>, StompError> {
        let _op = self.inner.op_lock.lock().await;
        if self.inner.status.get() != SubscriptionStatus::Subscribed {
            tracing::debug!(subscription = %self.inner.destination, "unsubscribe ignored: not subscribed");
            return Ok(None);
        }

        let mut frame = Frame::new(FrameType::Unsubscribe);
        let receipt_rx = match receipt {
            Some(receipt) => {
                frame.headers.set(headers::RECEIPT, receipt);
                Some(self.inner.delegate.receipt_stream())
            }
            None => None,
        };

        let sent = self.send(frame).await;
        let result = match (sent, receipt_rx, receipt) {
            (Err(e), _, _) => Err(e),
            (Ok(()), Some(rx), Some(receipt)) => {
                await_receipt(rx, receipt, None).await.map(Some)
            }
            (Ok(()), _, _) => Ok(None),
        };
        self.inner.force_unsubscribed();
        result
    }
}

impl SubscriptionInner {
    fn lock_slot<'a, T>(&self, slot: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// This layer's header injection and request handler. Frames the layer
    /// has no stake in pass through untouched.
    fn populate_own(&self, mut frame: Frame) -> Frame {
        match frame.frame_type {
            FrameType::Send => {
                frame.headers.set(headers::DESTINATION, self.destination.clone());
            }
            FrameType::Subscribe => {
                if let Some(id) = &self.id {
                    frame.headers.set(headers::ID, id.clone());
                }
                frame.headers.set(headers::DESTINATION, self.destination.clone());
                frame.headers.set(headers::ACK, self.ack_mode.as_str());
            }
            FrameType::Unsubscribe => match &self.id {
                Some(id) => frame.headers.set(headers::ID, id.clone()),
                None => frame.headers.set(headers::DESTINATION, self.destination.clone()),
            },
            _ => return frame,
        }
        match self.request_handler.get() {
            Some(handler) => handler(frame),
            None => frame,
        }
    }

    /// Whether a broker frame belongs to this subscription.
    fn matches(&self, frame: &Frame, version: StompVersion) -> bool {
        if !frame.frame_type.from_server() || frame.get_header(headers::MESSAGE_ID).is_none() {
            return false;
        }
        if frame.get_header(headers::DESTINATION) != Some(self.destination.as_str()) {
            return false;
        }
        let subscription = frame.get_header(headers::SUBSCRIPTION);
        match version {
            // 1.0 brokers may omit the subscription header entirely
            StompVersion::V1_0 => match (subscription, self.id.as_deref()) {
                (None, None) => true,
                (Some(s), Some(id)) => s == id,
                _ => false,
            },
            _ => subscription.is_some() && subscription == self.id.as_deref(),
        }
    }

    /// Run the response handler and the version-specific ack protocol,
    /// republishing the frame to this subscription's broadcast when the
    /// delivery is considered consumed.
    async fn process_delivery(
        &self,
        frame: Frame,
        version: StompVersion,
        tx: &broadcast::Sender<Frame>,
    ) {
        let handled = match self.response_handler.get() {
            Some(handler) => match handler(&frame) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        subscription = %self.destination,
                        error = %e,
                        "response handler rejected delivery"
                    );
                    false
                }
            },
            None => true,
        };

        if self.ack_mode == AckMode::Auto {
            let _ = tx.send(frame);
            return;
        }

        match version {
            StompVersion::V1_0 => {
                // withholding the ack leaves redelivery to the broker
                if !handled {
                    return;
                }
                if let Some(message_id) = frame.get_header(headers::MESSAGE_ID) {
                    let ack = Frame::new(FrameType::Ack)
                        .header(headers::MESSAGE_ID, message_id);
                    if let Err(e) = self.delegate.send(ack).await {
                        tracing::warn!(
                            subscription = %self.destination,
                            error = %e,
                            "failed to send ACK"
                        );
                    }
                }
                let _ = tx.send(frame);
            }
            _ => {
                let Some(ack_id) = frame.get_header(headers::ACK).map(str::to_string) else {
                    // broker did not ask for an ack on this delivery
                    let _ = tx.send(frame);
                    return;
                };
                let (frame_type, republish) = if handled {
                    (FrameType::Ack, true)
                } else {
                    (FrameType::Nack, false)
                };
                let response = Frame::new(frame_type).header(headers::ID, ack_id);
                if let Err(e) = self.delegate.send(response).await {
                    tracing::warn!(
                        subscription = %self.destination,
                        error = %e,
                        "failed to send {}",
                        frame_type
                    );
                }
                if republish {
                    let _ = tx.send(frame);
                }
            }
        }
    }

    /// Terminal local teardown: stop the pump, close the delivery
    /// broadcast, and land the state machine in Unsubscribed.
    fn force_unsubscribed(&self) {
        if let Some(token) = self.lock_slot(&self.pump).take() {
            token.cancel();
        }
        self.lock_slot(&self.messages).take();
        if self.status.set(SubscriptionStatus::Unsubscribed) {
            tracing::info!(subscription = %self.destination, "unsubscribed");
        }
    }

    /// Cascade connection loss into this subscription.
    fn spawn_connection_watcher(self: Arc<Self>) {
        let mut stream = self.delegate.status_stream();
        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(ConnectionStatus::Disconnected) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if inner.status.get() == SubscriptionStatus::Subscribed {
                            inner.force_unsubscribed();
                        }
                    }
                    Some(_) => continue,
                    None => {
                        if let Some(inner) = weak.upgrade() {
                            if inner.status.get() == SubscriptionStatus::Subscribed {
                                inner.force_unsubscribed();
                            }
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Start filtering the delegate's broadcast into this subscription's
    /// own. Idempotent while a pump is live.
    fn connect_pump(self: Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut pump = self.lock_slot(&self.pump);
            if pump.is_some() {
                return;
            }
            *pump = Some(token.clone());
        }
        let (tx, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        *self.lock_slot(&self.messages) = Some(tx.clone());
        let mut rx = self.delegate.message_stream();

        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Ok(frame) => {
                            let Some(inner) = weak.upgrade() else { break };
                            if inner.status.get() != SubscriptionStatus::Subscribed {
                                continue;
                            }
                            let Some(session) = inner.delegate.session_info() else {
                                continue;
                            };
                            if inner.matches(&frame, session.version) {
                                inner.process_delivery(frame, session.version, &tx).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            if let Some(inner) = weak.upgrade() {
                                tracing::warn!(
                                    subscription = %inner.destination,
                                    skipped,
                                    "delivery pump lagged behind connection"
                                );
                            }
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            if !token.is_cancelled() {
                if let Some(inner) = weak.upgrade() {
                    if inner.status.get() == SubscriptionStatus::Subscribed {
                        inner.force_unsubscribed();
                    }
                }
            }
        });
    }

    fn deliveries(&self) -> broadcast::Receiver<Frame> {
        match self.lock_slot(&self.messages).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }
}

impl StompClient for Subscription {
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), StompError>> {
        Box::pin(async move {
            let frame = self.inner.populate_own(frame);
            self.inner.delegate.send(frame).await
        })
    }

    fn populate_request(&self, frame: Frame) -> Frame {
        self.inner
            .delegate
            .populate_request(self.inner.populate_own(frame))
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.delegate.status()
    }

    fn status_stream(&self) -> StatusStream<ConnectionStatus> {
        self.inner.delegate.status_stream()
    }

    fn message_stream(&self) -> broadcast::Receiver<Frame> {
        self.inner.deliveries()
    }

    fn receipt_stream(&self) -> broadcast::Receiver<Frame> {
        self.inner.delegate.receipt_stream()
    }

    fn session_info(&self) -> Option<Arc<SessionInfo>> {
        self.inner.delegate.session_info()
    }

    fn accepted_versions(&self) -> Vec<StompVersion> {
        self.inner.delegate.accepted_versions()
    }

    fn describe(&self) -> String {
        format!(
            "subscription[{}] -> {}",
            self.inner.destination,
            self.inner.delegate.describe()
        )
    }
}
