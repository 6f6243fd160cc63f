use thiserror::Error;

use crate::frame::Frame;
use crate::transport::TransportError;

/// Errors surfaced by the protocol engine.
///
/// Cascading state transitions (connection loss forcing a subscription or
/// transaction into a terminal status) are never reported through this type;
/// they only appear on the status streams.
#[derive(Error, Debug)]
pub enum StompError {
    /// The payload could not be decoded as a STOMP frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The CONNECT handshake failed, optionally with the broker's ERROR frame.
    #[error("connect failed")]
    ConnectFailed { error_frame: Option<Box<Frame>> },
    /// The broker negotiated a protocol version this engine did not accept.
    #[error("unsupported STOMP version: {0}")]
    UnsupportedVersion(String),
    /// An ERROR frame arrived while an operation was pending.
    #[error("ERROR frame received from server")]
    Protocol(Box<Frame>),
    /// A caller-supplied wait bound was exceeded.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// Failure reported by the transport collaborator.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// The observed stream completed before the operation could resolve.
    #[error("stream closed")]
    StreamClosed,
}
