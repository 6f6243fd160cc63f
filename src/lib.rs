//! Client-side STOMP protocol engine over a message-framed transport.
//!
//! The engine speaks STOMP 1.0, 1.1, and 1.2 on top of any transport that
//! delivers whole messages (a WebSocket connection being the usual one).
//! Opening the socket, TLS, and reconnects belong to the [`Transport`]
//! collaborator; this crate owns the frames, the handshake, heartbeats,
//! subscriptions, and transactions.
//!
//! Layers compose through the [`StompClient`] trait: a [`Connection`] at
//! the root, [`Subscription`] and [`Transaction`] decorators above it, each
//! injecting its own headers into outgoing frames and filtering inbound
//! ones.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod receipt;
pub mod session;
pub mod state;
pub mod subscription;
pub mod transaction;
pub mod transport;

pub use client::{RequestHandler, ResponseHandler, StompClient};
pub use codec::StompItem;
pub use config::{ConnectConfig, DisconnectConfig};
pub use connection::{Connection, ConnectionStatus};
pub use error::StompError;
pub use frame::{Frame, FrameType, Headers, StompVersion};
pub use heartbeat::{format_heartbeat_header, negotiate_heartbeats, parse_heartbeat_header};
pub use receipt::{await_receipt, send_with_receipt};
pub use session::SessionInfo;
pub use state::{StatusCell, StatusStream};
pub use subscription::{AckMode, Subscription, SubscriptionStatus};
pub use transaction::{Transaction, TransactionStatus};
pub use transport::{RawMessage, Transport, TransportError, TransportStatus};
