use std::time::Duration;

use crate::frame::StompVersion;

/// Configuration for the STOMP CONNECT handshake.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Versions to advertise in `accept-version`; empty means the engine's
    /// own accepted set.
    pub accepted_versions: Vec<StompVersion>,
    /// Client heartbeat suggestion as (send interval, desired receive
    /// interval). Only sent for 1.1/1.2.
    pub heartbeat: Option<(Duration, Duration)>,
    /// Bound on the wait for the broker's CONNECTED (or ERROR) frame.
    pub connect_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: None,
            login: None,
            passcode: None,
            accepted_versions: Vec::new(),
            heartbeat: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn login(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn accepted_versions(mut self, versions: Vec<StompVersion>) -> Self {
        self.accepted_versions = versions;
        self
    }

    pub fn heartbeat(mut self, send: Duration, receive: Duration) -> Self {
        self.heartbeat = Some((send, receive));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Configuration for the DISCONNECT sequence.
#[derive(Debug, Clone)]
pub struct DisconnectConfig {
    /// Whether to send a DISCONNECT frame at all.
    pub send_disconnect: bool,
    /// Receipt id to tag the DISCONNECT with; confirmation is best-effort.
    pub receipt: Option<String>,
    /// Bound on the receipt confirmation wait.
    pub receipt_wait: Duration,
}

impl Default for DisconnectConfig {
    fn default() -> Self {
        Self {
            send_disconnect: true,
            receipt: None,
            receipt_wait: Duration::from_secs(10),
        }
    }
}

impl DisconnectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_disconnect(mut self, send: bool) -> Self {
        self.send_disconnect = send;
        self
    }

    pub fn receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    pub fn receipt_wait(mut self, wait: Duration) -> Self {
        self.receipt_wait = wait;
        self
    }
}
