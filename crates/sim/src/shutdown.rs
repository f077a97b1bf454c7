//! Broadcast stop signalling.
//!
//! The engine owns two controllers: a drain signal (clients stop generating
//! but keep resolving in-flight requests) and a hard shutdown signal
//! (workers abandon long sleeps and exit). Both are thin wrappers over a
//! `watch` channel.

use tokio::sync::watch;

/// Sender half; `trigger` flips the flag for every subscriber.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        ShutdownController { tx }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver half held by each task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once the signal has been triggered. Cancel-safe, and keeps
    /// resolving immediately on every call after the trigger.
    pub async fn signaled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Controller dropped: treat as triggered.
                return;
            }
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }
}
