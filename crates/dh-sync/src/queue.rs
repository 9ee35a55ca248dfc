//! Bounded hand-off queues between pipeline stages.
//!
//! Pushes and pops block with a liveness timeout: each time the timeout lapses a
//! warning is logged and the wait starts over. Both ends give up when shutdown is raised.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::gate::ShutdownSignal;
use crate::HarvestError;

pub fn bounded<T>(
    name: &'static str,
    capacity: usize,
    liveness: Duration,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender { name, tx, liveness },
        QueueReceiver {
            name,
            rx: Arc::new(Mutex::new(rx)),
            liveness,
        },
    )
}

#[derive(Debug)]
pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    liveness: Duration,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            liveness: self.liveness,
        }
    }
}

impl<T> QueueSender<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Blocks until there is room. `Ok(false)` means shutdown arrived first and the item was
    /// not queued.
    pub async fn push(&self, item: T, signal: &ShutdownSignal) -> Result<bool, HarvestError> {
        if signal.is_set() {
            return Ok(false);
        }
        loop {
            let reserve = tokio::time::timeout(self.liveness, self.tx.reserve());
            tokio::select! {
                reserved = reserve => match reserved {
                    Ok(Ok(permit)) => {
                        permit.send(item);
                        return Ok(true);
                    }
                    Ok(Err(_)) => return Err(HarvestError::QueueClosed(self.name)),
                    Err(_) => warn!(
                        queue = self.name,
                        waited_secs = self.liveness.as_secs_f64(),
                        depth = self.depth(),
                        "queue full, producer cannot push"
                    ),
                },
                _ = signal.wait() => return Ok(false),
            }
        }
    }

    /// Non-blocking push; a full queue drops the item with a warning.
    pub fn offer(&self, item: T) -> Result<bool, HarvestError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(queue = self.name, depth = self.depth(), "queue full, item dropped");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HarvestError::QueueClosed(self.name)),
        }
    }
}

/// Receiving end; clones share one underlying receiver so several workers can drain it.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    name: &'static str,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    liveness: Duration,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            rx: Arc::clone(&self.rx),
            liveness: self.liveness,
        }
    }
}

impl<T> QueueReceiver<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queued item count, or `None` while another consumer is parked on the queue.
    pub fn depth(&self) -> Option<usize> {
        self.rx.try_lock().ok().map(|rx| rx.len())
    }

    /// Blocks until an item arrives. `Ok(None)` means shutdown arrived first.
    pub async fn pop(&self, signal: &ShutdownSignal) -> Result<Option<T>, HarvestError> {
        if signal.is_set() {
            return Ok(None);
        }
        loop {
            let receive =
                tokio::time::timeout(self.liveness, async { self.rx.lock().await.recv().await });
            tokio::select! {
                received = receive => match received {
                    Ok(Some(item)) => return Ok(Some(item)),
                    Ok(None) => return Err(HarvestError::QueueClosed(self.name)),
                    Err(_) => warn!(
                        queue = self.name,
                        waited_secs = self.liveness.as_secs_f64(),
                        "queue empty, consumer has nothing to pull"
                    ),
                },
                _ = signal.wait() => return Ok(None),
            }
        }
    }
}
