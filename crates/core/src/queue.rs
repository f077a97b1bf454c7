//! Priority FIFO with per-kind subqueues (Q₁).
//!
//! One FIFO per request kind rather than a single heap: the priority
//! structure is discrete (three levels) and dispatch is per-kind, so each
//! subqueue gets its own wakeup signal. Workers of kind `k` block in
//! [`PriorityQueue::dequeue_for`] on their own subqueue; priority across
//! kinds is honored because higher-priority kinds have dedicated capacity
//! that never waits behind lower-priority items. No cross-priority
//! preemption: an in-flight low-priority request is not cancelled when a
//! high-priority one arrives.

use qnet_types::{Request, RequestKind};
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

/// Errors from queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed; no further enqueues are accepted.
    #[error("queue is closed")]
    Closed,
}

struct WaitSample {
    dequeued_at: Instant,
    wait: Duration,
}

#[derive(Default)]
struct SubQueue {
    items: VecDeque<(Request, Instant)>,
    samples: Vec<WaitSample>,
}

struct Inner {
    queues: [SubQueue; 3],
    closed: bool,
}

/// Thread-safe priority FIFO feeding the stage-1 pools.
///
/// FIFO order is preserved within each kind. After [`close`](Self::close),
/// remaining items drain and further dequeues return `None`.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    available: [Notify; 3],
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner {
                queues: [SubQueue::default(), SubQueue::default(), SubQueue::default()],
                closed: false,
            }),
            available: [Notify::new(), Notify::new(), Notify::new()],
        }
    }

    /// Insert a request at the tail of its kind's subqueue. Never blocks.
    pub fn enqueue(&self, request: Request) -> Result<(), QueueError> {
        let kind = request.kind;
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.closed {
                return Err(QueueError::Closed);
            }
            inner.queues[kind.index()]
                .items
                .push_back((request, Instant::now()));
        }
        self.available[kind.index()].notify_one();
        Ok(())
    }

    /// Wait for the next request of `kind`, in FIFO order.
    ///
    /// Returns `None` once the queue has been closed and the subqueue is
    /// drained.
    pub async fn dequeue_for(&self, kind: RequestKind) -> Option<Request> {
        loop {
            let mut notified = pin!(self.available[kind.index()].notified());
            // Register for a wakeup before inspecting state, so a
            // notification racing with the check is not lost.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                let sub = &mut inner.queues[kind.index()];
                if let Some((request, enqueued_at)) = sub.items.pop_front() {
                    let now = Instant::now();
                    sub.samples.push(WaitSample {
                        dequeued_at: now,
                        wait: now.duration_since(enqueued_at),
                    });
                    return Some(request);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue and wake every waiter. Remaining items stay
    /// dequeuable; once drained, `dequeue_for` returns `None`.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.closed = true;
        }
        for notify in &self.available {
            notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").closed
    }

    /// Mean wait time of items of `kind` dequeued within `window` of now.
    pub fn avg_wait(&self, kind: RequestKind, window: Duration) -> Duration {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let now = Instant::now();
        let mut total = Duration::ZERO;
        let mut count = 0u32;
        for sample in inner.queues[kind.index()].samples.iter().rev() {
            if now.duration_since(sample.dequeued_at) > window {
                break;
            }
            total += sample.wait;
            count += 1;
        }
        if count == 0 {
            Duration::ZERO
        } else {
            total / count
        }
    }

    /// Number of wait samples of `kind` recorded within `window` of now.
    pub fn wait_sample_count(&self, kind: RequestKind, window: Duration) -> usize {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let now = Instant::now();
        inner.queues[kind.index()]
            .samples
            .iter()
            .rev()
            .take_while(|s| now.duration_since(s.dequeued_at) <= window)
            .count()
    }

    /// Full wait history for `kind` in seconds, for end-of-run percentiles.
    pub fn wait_samples(&self, kind: RequestKind) -> Vec<f64> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.queues[kind.index()]
            .samples
            .iter()
            .map(|s| s.wait.as_secs_f64())
            .collect()
    }

    /// Current depth of one kind's subqueue.
    pub fn len(&self, kind: RequestKind) -> usize {
        self.inner.lock().expect("queue lock poisoned").queues[kind.index()]
            .items
            .len()
    }

    /// Total queued items across all kinds.
    pub fn total_len(&self) -> usize {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.queues.iter().map(|q| q.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
