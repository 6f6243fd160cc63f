use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// A single message exchanged with the transport, as delivered by a
/// WebSocket-style message-framed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Text(String),
    Binary(Bytes),
}

impl RawMessage {
    pub fn text(data: impl Into<String>) -> Self {
        RawMessage::Text(data.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        RawMessage::Binary(data.into())
    }
}

/// Lifecycle states of the underlying transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl TransportStatus {
    /// `Open` is the only state in which the transport accepts traffic.
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportStatus::Open)
    }

    /// `Closed` and `Failed` are terminal for this transport instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportStatus::Closed | TransportStatus::Failed)
    }
}

/// Errors reported by the transport collaborator.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,
    #[error("transport send failed: {0}")]
    SendFailed(String),
}

/// The interface the engine consumes from its transport collaborator.
///
/// Opening and closing the socket, authentication hooks, and reconnect
/// policy all live behind this boundary; the engine only sends raw
/// messages and observes the lifecycle and inbound message streams.
pub trait Transport: Send + Sync + 'static {
    /// Send one raw message over the wire.
    fn send(&self, message: RawMessage) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Lifecycle stream; new observers see the current state immediately.
    fn status_stream(&self) -> watch::Receiver<TransportStatus>;

    /// Raw inbound messages in wire arrival order.
    fn message_stream(&self) -> broadcast::Receiver<RawMessage>;
}
