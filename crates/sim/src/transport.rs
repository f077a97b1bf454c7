//! Identifier-addressed in-process transport.
//!
//! Stage-2 processors address responses to the originating client's node id;
//! the transport delivers them into the client's mailbox. Channels are
//! unbounded so delivery never blocks a processor. Delivery counters are
//! plain atomics exposed through a handle that stays readable after the
//! transport's owners have shut down.

use qnet_types::{NodeId, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from transport sends. A failed send only loses one response leg;
/// the affected client resolves it through its timeout.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no endpoint registered for node {0}")]
    UnknownNode(NodeId),

    #[error("endpoint for node {0} is closed")]
    Closed(NodeId),
}

/// Receiving end of a node's mailbox.
pub type Mailbox = mpsc::UnboundedReceiver<Response>;

/// In-process message delivery between nodes.
pub struct Transport {
    endpoints: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Response>>>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl Transport {
    pub fn new() -> Self {
        Transport {
            endpoints: Mutex::new(HashMap::new()),
            delivered: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a node and return its mailbox. Re-registering replaces the
    /// previous endpoint.
    pub fn register(&self, node: NodeId) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .expect("transport lock poisoned")
            .insert(node, tx);
        rx
    }

    /// Deliver a response to `to`'s mailbox.
    pub fn send(&self, to: &NodeId, response: Response) -> Result<(), TransportError> {
        let endpoints = self.endpoints.lock().expect("transport lock poisoned");
        let Some(tx) = endpoints.get(to) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::UnknownNode(to.clone()));
        };
        match tx.send(response) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Closed(to.clone()))
            }
        }
    }

    /// Handle for reading delivery counters, usable after shutdown.
    pub fn stats(&self) -> TransportStatsHandle {
        TransportStatsHandle {
            delivered: Arc::clone(&self.delivered),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transport delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub delivered: u64,
    pub dropped: u64,
}

/// Clonable view onto the transport's counters.
#[derive(Debug, Clone)]
pub struct TransportStatsHandle {
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl TransportStatsHandle {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            delivered: self.delivered(),
            dropped: self.dropped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qnet_types::{RequestId, RequestKind};
    use std::time::Instant;

    fn response(id: u64) -> Response {
        Response {
            request_id: RequestId(id),
            producer_kind: RequestKind::Z1,
            ok: true,
            completed_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_endpoint() {
        let transport = Transport::new();
        let mut mailbox = transport.register(NodeId::from("K1"));

        transport.send(&NodeId::from("K1"), response(1)).unwrap();
        let got = mailbox.recv().await.unwrap();
        assert_eq!(got.request_id.0, 1);
        assert_eq!(transport.stats().delivered(), 1);
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let transport = Transport::new();
        let err = transport.send(&NodeId::from("K9"), response(1)).unwrap_err();
        assert!(matches!(err, TransportError::UnknownNode(_)));
        assert_eq!(transport.stats().dropped(), 1);
    }

    #[tokio::test]
    async fn closed_mailbox_is_an_error() {
        let transport = Transport::new();
        let mailbox = transport.register(NodeId::from("K1"));
        drop(mailbox);
        let err = transport.send(&NodeId::from("K1"), response(1)).unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
    }

    #[tokio::test]
    async fn stats_handle_outlives_the_transport() {
        let transport = Transport::new();
        let mut mailbox = transport.register(NodeId::from("K1"));
        transport.send(&NodeId::from("K1"), response(1)).unwrap();
        let stats = transport.stats();
        drop(transport);

        assert_eq!(stats.snapshot(), TransportStats { delivered: 1, dropped: 0 });
        assert!(mailbox.recv().await.is_some());
    }
}
