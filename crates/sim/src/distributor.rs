//! Broadcast distributor (D).
//!
//! Stateless fan-out between stage 1 and stage 2: every submitted request
//! is delivered once to each of the three stage-2 queues. The queues are
//! unbounded, so `submit` never blocks.

use qnet_types::Request;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

pub struct Distributor {
    outputs: [mpsc::UnboundedSender<Request>; 3],
    submitted: AtomicU64,
}

impl Distributor {
    /// Build a distributor over the three stage-2 queue senders, indexed by
    /// kind.
    pub fn new(outputs: [mpsc::UnboundedSender<Request>; 3]) -> Self {
        Distributor {
            outputs,
            submitted: AtomicU64::new(0),
        }
    }

    /// Fan one request out to every stage-2 queue.
    ///
    /// A closed downstream queue (stage-2 shut down) loses that leg only;
    /// the originating client resolves it through its timeout.
    pub fn submit(&self, request: &Request) {
        for output in &self.outputs {
            if output.send(request.clone()).is_err() {
                debug!(id = %request.id, "stage-2 queue closed, leg dropped");
            }
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of requests fanned out so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qnet_types::{NodeId, RequestId, RequestKind};
    use std::time::Instant;

    fn request(id: u64) -> Request {
        Request {
            id: RequestId(id),
            kind: RequestKind::Z2,
            origin: NodeId::from("K1"),
            created_at: Instant::now(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn each_submit_produces_three_downstream_items() {
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        let distributor = Distributor::new([tx1, tx2, tx3]);

        for i in 0..5 {
            distributor.submit(&request(i));
        }
        assert_eq!(distributor.submitted(), 5);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let mut ids = Vec::new();
            while let Ok(req) = rx.try_recv() {
                ids.push(req.id.0);
            }
            assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn closed_queue_drops_only_that_leg() {
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        drop(rx2);
        let distributor = Distributor::new([tx1, tx2, tx3]);

        distributor.submit(&request(7));
        assert_eq!(distributor.submitted(), 1);
        assert_eq!(rx1.try_recv().unwrap().id.0, 7);
        assert_eq!(rx3.try_recv().unwrap().id.0, 7);
    }
}
