//! Replay-latest status cells.
//!
//! Every state machine in the engine publishes its status through a
//! [`StatusCell`]: a last-value cache plus a broadcast fan-out. A new
//! observer immediately receives the current value, then every subsequent
//! transition in order. Re-emitting the current value is suppressed.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

pub struct StatusCell<T> {
    current: Mutex<T>,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + PartialEq + Send + 'static> StatusCell<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            current: Mutex::new(initial),
            tx,
        }
    }

    pub fn get(&self) -> T {
        self.lock().clone()
    }

    /// Transition to `value`. Returns `false` (and emits nothing) when the
    /// cell already holds that value.
    pub fn set(&self, value: T) -> bool {
        // the send happens under the cache lock so subscribers constructed
        // by `subscribe` cannot miss a transition
        let mut current = self.lock();
        if *current == value {
            return false;
        }
        *current = value.clone();
        let _ = self.tx.send(value);
        true
    }

    /// Observe the current value and all subsequent transitions.
    pub fn subscribe(&self) -> StatusStream<T> {
        let current = self.lock();
        StatusStream {
            replay: Some(current.clone()),
            rx: self.tx.subscribe(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Observer side of a [`StatusCell`].
pub struct StatusStream<T> {
    replay: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + PartialEq + Send + 'static> StatusStream<T> {
    /// Next status value, starting with the value current at subscribe time.
    /// Returns `None` once the owning cell has been dropped.
    pub async fn next(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait until `target` is observed. Returns `false` when the stream
    /// completes first.
    pub async fn wait_for(&mut self, target: T) -> bool {
        while let Some(value) = self.next().await {
            if value == target {
                return true;
            }
        }
        false
    }
}
