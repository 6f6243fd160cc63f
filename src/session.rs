use std::time::Duration;

use crate::frame::{Frame, StompVersion};

/// Immutable record of a negotiated STOMP session.
///
/// Owned exclusively by the connection: replaced wholesale on each
/// successful handshake, cleared on disconnect. `server` and the heartbeat
/// pairs are populated for 1.1/1.2 sessions only.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub version: StompVersion,
    pub session_id: Option<String>,
    pub server: Option<String>,
    /// Client-advertised (send interval, desired receive interval).
    pub client_heartbeat: Option<(Duration, Duration)>,
    /// Broker-advertised (send interval, desired receive interval).
    pub server_heartbeat: Option<(Duration, Duration)>,
    /// The CONNECT frame as sent (after request population).
    pub connect_frame: Frame,
    /// The broker's CONNECTED frame.
    pub connected_frame: Frame,
}
