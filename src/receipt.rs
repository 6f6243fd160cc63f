//! Receipt correlation.
//!
//! Callers subscribe to the connection's frame broadcast *before* sending a
//! receipt-tagged request, then hand the receiver here; that ordering closes
//! the window in which a fast broker could answer before the wait begins.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::client::StompClient;
use crate::error::StompError;
use crate::frame::{Frame, FrameType, headers};

/// Tag `frame` with a receipt id, send it through `client`, and wait for the
/// broker's confirmation. Works at any layer of the delegation chain.
pub async fn send_with_receipt(
    client: &dyn StompClient,
    frame: Frame,
    receipt_id: &str,
    timeout: Option<Duration>,
) -> Result<Frame, StompError> {
    let rx = client.receipt_stream();
    let frame = frame.header(headers::RECEIPT, receipt_id);
    client.send(frame).await?;
    await_receipt(rx, receipt_id, timeout).await
}

/// Wait on `rx` for the RECEIPT frame whose `receipt-id` equals
/// `receipt_id`.
///
/// An ERROR frame observed while waiting fails the wait with
/// [`StompError::Protocol`]; the frame itself stays on the broadcast for
/// other observers. A closed stream means the connection's read pump
/// stopped, which resolves as [`StompError::StreamClosed`]. `timeout`
/// bounds the whole wait; `None` waits indefinitely.
pub async fn await_receipt(
    mut rx: broadcast::Receiver<Frame>,
    receipt_id: &str,
    timeout: Option<Duration>,
) -> Result<Frame, StompError> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(frame) => match frame.frame_type {
                    FrameType::Receipt
                        if frame.get_header(headers::RECEIPT_ID) == Some(receipt_id) =>
                    {
                        return Ok(frame);
                    }
                    FrameType::Error => return Err(StompError::Protocol(Box::new(frame))),
                    _ => continue,
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "receipt wait lagged behind frame broadcast");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StompError::StreamClosed),
            }
        }
    };

    match timeout {
        Some(bound) => tokio::time::timeout(bound, wait)
            .await
            .map_err(|_| StompError::Timeout("receipt"))?,
        None => wait.await,
    }
}
