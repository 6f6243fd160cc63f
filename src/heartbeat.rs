//! Heartbeat negotiation and the send/health-check timer pair.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::transport::Transport;

/// Parse a STOMP `heart-beat` header value (format: `"sx,sy"`, milliseconds).
///
/// Missing or invalid fields default to `0` (heartbeats disabled in that
/// direction).
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let sx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let sy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (sx, sy)
}

/// Format a `heart-beat` header value from millisecond intervals.
pub fn format_heartbeat_header(send_ms: u64, receive_ms: u64) -> String {
    format!("{send_ms},{receive_ms}")
}

/// Negotiate heartbeat intervals between client and server.
///
/// Inputs are the four `heart-beat` fields in milliseconds: what the client
/// can send (`client_send`) and wants to receive (`client_receive`), and the
/// server's counterparts. A direction is enabled only when both sides
/// advertise a non-zero value; the effective interval is the maximum of the
/// two, per the STOMP negotiation rule.
///
/// Returns `(outgoing, incoming)` intervals, `None` meaning disabled.
pub fn negotiate_heartbeats(
    client_send: u64,
    client_receive: u64,
    server_send: u64,
    server_receive: u64,
) -> (Option<Duration>, Option<Duration>) {
    let outgoing = if client_send > 0 && server_receive > 0 {
        Some(Duration::from_millis(client_send.max(server_receive)))
    } else {
        None
    };
    let incoming = if client_receive > 0 && server_send > 0 {
        Some(Duration::from_millis(client_receive.max(server_send)))
    } else {
        None
    };
    (outgoing, incoming)
}

/// Last-activity clock shared between the connection and its timers.
///
/// Backed by `tokio::time::Instant` so paused-clock tests drive it.
#[derive(Clone)]
pub(crate) struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record activity now.
    pub(crate) fn touch(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub(crate) fn idle(&self) -> Duration {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed()
    }
}

/// One send timer and one receive health check, owned by a single
/// cancellation token so rearming is an atomic cancel-old-start-new.
pub(crate) struct HeartbeatTimers {
    cancel: CancellationToken,
}

impl HeartbeatTimers {
    /// Start the enabled timer tasks.
    ///
    /// The send side emits a bare LF once one interval has passed since the
    /// last raw send; every raw send re-arms the deadline through
    /// `send_clock`, so wire silence never exceeds one interval. The
    /// receive side polls at half the interval and calls
    /// `on_dead` once nothing has arrived within twice the interval.
    pub(crate) fn start(
        send_interval: Option<Duration>,
        receive_interval: Option<Duration>,
        send_clock: ActivityClock,
        receive_clock: ActivityClock,
        transport: Arc<dyn Transport>,
        on_dead: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        let cancel = CancellationToken::new();

        if let Some(interval) = send_interval {
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    // sleep until one interval past the last raw send; the
                    // clock is re-read after every wake so real traffic
                    // pushes the deadline instead of skipping a fixed tick
                    let wait = interval.saturating_sub(send_clock.idle());
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    if send_clock.idle() < interval {
                        continue;
                    }
                    if let Err(e) = transport.send(codec::heartbeat()).await {
                        tracing::warn!(error = %e, "failed to send heartbeat");
                        break;
                    }
                    send_clock.touch();
                }
            });
        }

        if let Some(interval) = receive_interval {
            let token = cancel.clone();
            let poll = (interval / 2).max(Duration::from_millis(1));
            let allowance = interval * 2;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval_at(Instant::now() + poll, poll);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            if receive_clock.idle() > allowance {
                                tracing::warn!(
                                    idle_ms = receive_clock.idle().as_millis() as u64,
                                    "no traffic within heartbeat allowance"
                                );
                                on_dead();
                                break;
                            }
                        }
                    }
                }
            });
        }

        Self { cancel }
    }

    /// Stop both timers. Idempotent.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatTimers {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
