//! STOMP transactions layered on a connection or subscription.
//!
//! A [`Transaction`] decorates any [`StompClient`] delegate with a
//! `transaction` header on the frames that take part in it, and tracks the
//! BEGIN/COMMIT/ABORT lifecycle. Both `Committed` and `Aborted` are
//! terminal; a new unit of work means a new `Transaction`.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::client::{RequestHandler, StompClient};
use crate::connection::ConnectionStatus;
use crate::error::StompError;
use crate::frame::{Frame, FrameType, StompVersion, headers};
use crate::receipt::await_receipt;
use crate::session::SessionInfo;
use crate::state::{StatusCell, StatusStream};

const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Uninitialized,
    InProgress,
    Committed,
    Aborted,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }
}

/// One named transaction, stacked on a delegate client.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    delegate: Arc<dyn StompClient>,
    id: String,
    status: StatusCell<TransactionStatus>,
    messages: StdMutex<Option<broadcast::Sender<Frame>>>,
    pump: StdMutex<Option<CancellationToken>>,
    request_handler: OnceLock<RequestHandler>,
    op_lock: AsyncMutex<()>,
}

impl Transaction {
    pub fn new(delegate: Arc<dyn StompClient>, id: impl Into<String>) -> Self {
        let inner = Arc::new(TransactionInner {
            delegate,
            id: id.into(),
            status: StatusCell::new(TransactionStatus::Uninitialized),
            messages: StdMutex::new(None),
            pump: StdMutex::new(None),
            request_handler: OnceLock::new(),
            op_lock: AsyncMutex::new(()),
        });
        inner.clone().spawn_connection_watcher();
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.status.get()
    }

    pub fn transaction_status_stream(&self) -> StatusStream<TransactionStatus> {
        self.inner.status.subscribe()
    }

    /// Install the hook run on outgoing SEND/ACK/NACK frames after the
    /// transaction header injection. Only the first call takes effect.
    pub fn set_request_handler(&self, handler: RequestHandler) {
        if self.inner.request_handler.set(handler).is_err() {
            tracing::warn!(transaction = %self.inner.id, "request handler already installed");
        }
    }

    /// Send BEGIN. With a receipt the transaction only becomes
    /// `InProgress` once confirmed; a failed begin leaves it
    /// `Uninitialized` so the caller can retry. `Ok(None)` when the
    /// transaction already started.
    pub async fn begin(&self, receipt: Option<&str>) -> Result<Option<Frame>, StompError> {
        let _op = self.inner.op_lock.lock().await;
        if self.inner.status.get() != TransactionStatus::Uninitialized {
            tracing::debug!(transaction = %self.inner.id, "begin ignored: already started");
            return Ok(None);
        }

        let mut frame = Frame::new(FrameType::Begin);
        let receipt_rx = match receipt {
            Some(receipt) => {
                frame.headers.set(headers::RECEIPT, receipt);
                Some(self.inner.delegate.receipt_stream())
            }
            None => None,
        };
        frame.headers.set(headers::TRANSACTION, self.inner.id.clone());

        self.send(frame).await?;

        let confirmation = match (receipt_rx, receipt) {
            (Some(rx), Some(receipt)) => Some(await_receipt(rx, receipt, None).await?),
            _ => None,
        };
        self.inner.status.set(TransactionStatus::InProgress);
        self.inner.clone().connect_pump();
        Ok(confirmation)
    }

    /// Send COMMIT. A confirmed commit ends `Committed`; any failure after
    /// the transaction was in progress ends `Aborted` so the outcome is
    /// never ambiguous. `Ok(None)` when not in progress.
    pub async fn commit(&self, receipt: Option<&str>) -> Result<Option<Frame>, StompError> {
        let _op = self.inner.op_lock.lock().await;
        if self.inner.status.get() != TransactionStatus::InProgress {
            tracing::debug!(transaction = %self.inner.id, "commit ignored: not in progress");
            return Ok(None);
        }
        let result = self.finish(FrameType::Commit, receipt).await;
        match result {
            Ok(confirmation) => {
                self.inner.set_terminal(TransactionStatus::Committed);
                Ok(confirmation)
            }
            Err(e) => {
                self.inner.set_terminal(TransactionStatus::Aborted);
                Err(e)
            }
        }
    }

    /// Send ABORT. The transaction ends `Aborted` on every outcome.
    /// `Ok(None)` when not in progress.
    pub async fn abort(&self, receipt: Option<&str>) -> Result<Option<Frame>, StompError> {
        let _op = self.inner.op_lock.lock().await;
        if self.inner.status.get() != TransactionStatus::InProgress {
            tracing::debug!(transaction = %self.inner.id, "abort ignored: not in progress");
            return Ok(None);
        }
        let result = self.finish(FrameType::Abort, receipt).await;
        self.inner.set_terminal(TransactionStatus::Aborted);
        result
    }

    async fn finish(
        &self,
        frame_type: FrameType,
        receipt: Option<&str>,
    ) -> Result<Option<Frame>, StompError> {
        let mut frame = Frame::new(frame_type);
        let receipt_rx = match receipt {
            Some(receipt) => {
                frame.headers.set(headers::RECEIPT, receipt);
                Some(self.inner.delegate.receipt_stream())
            }
            None => None,
        };
        frame.headers.set(headers::TRANSACTION, self.inner.id.clone());
        self.send(frame).await?;
        match (receipt_rx, receipt) {
            (Some(rx), Some(receipt)) => await_receipt(rx, receipt, None).await.map(Some),
            _ => Ok(None),
        }
    }
}

impl TransactionInner {
    fn lock_slot<'a, T>(&self, slot: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inject the `transaction` header where the protocol expects it.
    ///
    /// Lifecycle frames pass through untouched: the op that builds them
    /// stamps its own id, and a transaction stacked over another must not
    /// overwrite it. ACK/NACK only carry the header from 1.1 onward.
    fn populate_own(&self, mut frame: Frame) -> Frame {
        match frame.frame_type {
            FrameType::Begin | FrameType::Commit | FrameType::Abort => return frame,
            FrameType::Send => {
                frame.headers.set(headers::TRANSACTION, self.id.clone());
            }
            FrameType::Ack | FrameType::Nack => {
                let version = self.delegate.session_info().map(|s| s.version);
                if version.is_some_and(|v| v != StompVersion::V1_0) {
                    frame.headers.set(headers::TRANSACTION, self.id.clone());
                }
            }
            _ => return frame,
        }
        match self.request_handler.get() {
            Some(handler) => handler(frame),
            None => frame,
        }
    }

    /// Terminal transition: stop the pump, close the broadcast, publish
    /// the final status.
    fn set_terminal(&self, status: TransactionStatus) {
        if let Some(token) = self.lock_slot(&self.pump).take() {
            token.cancel();
        }
        self.lock_slot(&self.messages).take();
        if self.status.set(status) {
            tracing::info!(transaction = %self.id, status = ?status, "transaction finished");
        }
    }

    fn abort_if_in_progress(&self) {
        if self.status.get() == TransactionStatus::InProgress {
            self.set_terminal(TransactionStatus::Aborted);
        }
    }

    /// Cascade connection loss: an in-flight transaction can never commit
    /// once the session is gone.
    fn spawn_connection_watcher(self: Arc<Self>) {
        let mut stream = self.delegate.status_stream();
        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(ConnectionStatus::Disconnected) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.abort_if_in_progress();
                    }
                    Some(_) => continue,
                    None => {
                        if let Some(inner) = weak.upgrade() {
                            inner.abort_if_in_progress();
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Republish the delegate's frames that carry this transaction's id.
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
                            if inner.status.get() != TransactionStatus::InProgress {
                                continue;
                            }
                            if frame.get_header(headers::TRANSACTION)
                                == Some(inner.id.as_str())
                            {
                                let _ = tx.send(frame);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            if let Some(inner) = weak.upgrade() {
                                tracing::warn!(
                                    transaction = %inner.id,
                                    skipped,
                                    "transaction pump lagged behind delegate"
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
                    inner.abort_if_in_progress();
                }
            }
        });
    }

    fn frames(&self) -> broadcast::Receiver<Frame> {
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

impl StompClient for Transaction {
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
        self.inner.frames()
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
            "transaction[{}] -> {}",
            self.inner.id,
            self.inner.delegate.describe()
        )
    }
}
