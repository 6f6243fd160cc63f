//! The layering seam of the engine.
//!
//! A [`StompClient`] is anything that can populate and send frames: the
//! [`Connection`](crate::connection::Connection) at the root, with
//! [`Subscription`](crate::subscription::Subscription) and
//! [`Transaction`](crate::transaction::Transaction) layers stacked on top.
//! Each layer holds its delegate as `Arc<dyn StompClient>`, injects its own
//! headers during [`StompClient::populate_request`], and forwards the rest.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::connection::ConnectionStatus;
use crate::error::StompError;
use crate::frame::{Frame, StompVersion};
use crate::session::SessionInfo;
use crate::state::StatusStream;

/// Caller hook run on outgoing frames after a layer's own header injection
/// and before delegation. Must return the (possibly rewritten) frame.
pub type RequestHandler = Box<dyn Fn(Frame) -> Frame + Send + Sync>;

/// Caller hook run on inbound frames a layer delivers. An `Err` marks the
/// delivery as failed, which drives the version-specific ack decision.
pub type ResponseHandler =
    Box<dyn Fn(&Frame) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Object-safe client interface shared by the connection and every layer
/// stacked on it.
pub trait StompClient: Send + Sync + 'static {
    /// Populate `frame` through this layer's chain, encode it, and hand it
    /// to the transport.
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), StompError>>;

    /// Run this layer's header injection and request handler on `frame`,
    /// then the delegate's, bottoming out at the connection.
    fn populate_request(&self, frame: Frame) -> Frame;

    /// Current connection status as seen from this layer.
    fn status(&self) -> ConnectionStatus;

    /// Connection status transitions, starting with the current value.
    fn status_stream(&self) -> StatusStream<ConnectionStatus>;

    /// This layer's inbound frame broadcast.
    fn message_stream(&self) -> broadcast::Receiver<Frame>;

    /// The root connection's frame broadcast, for receipt correlation.
    /// Layers forward this unfiltered.
    fn receipt_stream(&self) -> broadcast::Receiver<Frame>;

    /// Negotiated session details; `None` while disconnected.
    fn session_info(&self) -> Option<Arc<SessionInfo>>;

    /// The protocol versions the root connection accepts.
    fn accepted_versions(&self) -> Vec<StompVersion>;

    /// Human-readable identity for log lines.
    fn describe(&self) -> String;
}
