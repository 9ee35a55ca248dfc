use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Shared exit flag plus a count of live workers.
///
/// Every worker holds a [`WorkerSlot`] for as long as it runs; `request_shutdown`
/// raises the flag and returns once the count drops to zero.
#[derive(Debug, Clone)]
pub struct WorkerGate {
    exit: Arc<watch::Sender<bool>>,
    active: Arc<watch::Sender<usize>>,
}

impl Default for WorkerGate {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerGate {
    pub fn new() -> Self {
        let (exit, _) = watch::channel(false);
        let (active, _) = watch::channel(0usize);
        Self {
            exit: Arc::new(exit),
            active: Arc::new(active),
        }
    }

    pub fn register(&self, name: impl Into<String>) -> WorkerSlot {
        let name = name.into();
        self.active.send_modify(|n| *n += 1);
        debug!(worker = %name, active = self.active(), "worker registered");
        WorkerSlot {
            name,
            active: self.active.clone(),
            signal: self.signal(),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.exit.subscribe(),
        }
    }

    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.exit.borrow()
    }

    /// Raises the exit flag and waits until every registered worker has returned.
    pub async fn request_shutdown(&self) {
        self.exit.send_replace(true);
        info!(active = self.active(), "shutdown requested, waiting for workers");
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
        info!("all workers stopped");
    }
}

#[derive(Debug)]
pub struct WorkerSlot {
    name: String,
    active: Arc<watch::Sender<usize>>,
    signal: ShutdownSignal,
}

impl WorkerSlot {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        debug!(worker = %self.name, "worker released");
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested, or when the gate is gone.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|exit| *exit).await;
    }

    /// Sleeps for `duration` unless shutdown comes first. Returns `false` when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_set() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

/// Rate-limits "still alive" log lines.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True on the first call and then at most once per interval.
    pub fn due(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
