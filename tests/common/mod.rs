//! Shared test harness: an in-memory transport and handshake helpers.

// not every suite uses every helper
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};

use osmium_stomp::{
    ConnectConfig, Connection, RawMessage, SessionInfo, Transport, TransportError, TransportStatus,
};

/// In-memory transport double: records outgoing messages, lets the test
/// inject inbound ones and drive the lifecycle stream.
pub struct MockTransport {
    status_tx: watch::Sender<TransportStatus>,
    message_tx: broadcast::Sender<RawMessage>,
    sent: Mutex<Vec<RawMessage>>,
}

impl MockTransport {
    /// A transport that starts out `Open`.
    pub fn open() -> Arc<Self> {
        let (status_tx, _) = watch::channel(TransportStatus::Open);
        let (message_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            status_tx,
            message_tx,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Deliver one inbound raw message to all subscribers.
    pub fn inject_text(&self, payload: &str) {
        let _ = self.message_tx.send(RawMessage::text(payload));
    }

    pub fn set_status(&self, status: TransportStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Every message sent so far, as text.
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| match m {
                RawMessage::Text(s) => s.clone(),
                RawMessage::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            })
            .collect()
    }

    pub fn last_sent_text(&self) -> Option<String> {
        self.sent_text().pop()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Transport for MockTransport {
    fn send(&self, message: RawMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.status_tx.borrow().is_connected() {
                return Err(TransportError::NotOpen);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn status_stream(&self) -> watch::Receiver<TransportStatus> {
        self.status_tx.subscribe()
    }

    fn message_stream(&self) -> broadcast::Receiver<RawMessage> {
        self.message_tx.subscribe()
    }
}

/// Let spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// A minimal CONNECTED wire payload for the given extra headers.
pub fn connected_payload(extra_headers: &[(&str, &str)]) -> String {
    let mut out = String::from("CONNECTED\n");
    for (k, v) in extra_headers {
        out.push_str(&format!("{k}:{v}\n"));
    }
    out.push('\n');
    out.push('\0');
    out
}

/// Run the handshake to completion: start `connect`, let the CONNECT frame
/// go out, answer with `connected`, and return the negotiated session.
pub async fn establish(
    connection: &Connection,
    transport: &Arc<MockTransport>,
    config: ConnectConfig,
    connected: &str,
) -> Arc<SessionInfo> {
    let conn = connection.clone();
    let task = tokio::spawn(async move { conn.connect(&config).await });
    settle().await;
    transport.inject_text(connected);
    task.await
        .expect("connect task panicked")
        .expect("handshake failed")
        .expect("handshake was a no-op")
}
