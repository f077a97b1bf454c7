//! Stage-1 processor pools (P1x).
//!
//! One pool per request kind. The pool runs a dispatcher task that pulls
//! from its kind's subqueue of Q1 and hands each request to the next worker
//! in round-robin order. The hand-off channel has capacity 1 and the
//! dispatcher reserves a slot before pulling the next item, so over any
//! window of consecutive dequeues the per-worker dispatch counts differ by
//! at most one.
//!
//! The autoscaler holds a [`PoolHandle`] and only ever calls
//! [`spawn_worker`](PoolHandle::spawn_worker) /
//! [`retire_worker`](PoolHandle::retire_worker); the worker list itself is
//! owned by the dispatcher. Retiring drops the worker's hand-off sender:
//! the worker finishes what it holds and exits before its next dequeue.

use crate::distributor::Distributor;
use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;
use qnet_core::{sub_seed, PriorityQueue, ServiceTimes};
use qnet_types::{NodeId, Request, RequestKind};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for one kind's pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub kind: RequestKind,
    pub initial_workers: usize,
    pub service_times: ServiceTimes,
    pub seed: u64,
}

/// Scaling commands accepted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCommand {
    Spawn,
    Retire,
}

/// Control handle for a pool, held by the autoscaler and the engine.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    kind: RequestKind,
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
    size: Arc<AtomicUsize>,
}

impl PoolHandle {
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Current number of workers in rotation.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Ask the pool to add one worker.
    pub fn spawn_worker(&self) {
        let _ = self.cmd_tx.send(PoolCommand::Spawn);
    }

    /// Ask the pool to gracefully retire one worker.
    pub fn retire_worker(&self) {
        let _ = self.cmd_tx.send(PoolCommand::Retire);
    }

    /// Detached handle for autoscaler tests.
    #[cfg(test)]
    pub(crate) fn stub(
        kind: RequestKind,
        size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<PoolCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            PoolHandle {
                kind,
                cmd_tx,
                size: Arc::new(AtomicUsize::new(size)),
            },
            cmd_rx,
        )
    }
}

struct WorkerSlot {
    id: NodeId,
    tx: mpsc::Sender<Request>,
}

/// Dispatcher for one kind's worker pool.
pub struct Pool {
    config: PoolConfig,
    queue: Arc<PriorityQueue>,
    distributor: Arc<Distributor>,
    metrics: Arc<MetricsCollector>,
    shutdown: Shutdown,
    workers: Vec<WorkerSlot>,
    cursor: usize,
    next_slot: usize,
    size: Arc<AtomicUsize>,
    cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
    cmds_open: bool,
}

enum Step {
    Command(Option<PoolCommand>),
    Item(Option<Request>),
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        queue: Arc<PriorityQueue>,
        distributor: Arc<Distributor>,
        metrics: Arc<MetricsCollector>,
        shutdown: Shutdown,
    ) -> (Self, PoolHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let size = Arc::new(AtomicUsize::new(0));
        let handle = PoolHandle {
            kind: config.kind,
            cmd_tx,
            size: Arc::clone(&size),
        };
        let pool = Pool {
            config,
            queue,
            distributor,
            metrics,
            shutdown,
            workers: Vec::new(),
            cursor: 0,
            next_slot: 1,
            size,
            cmd_rx,
            cmds_open: true,
        };
        (pool, handle)
    }

    /// Run the dispatch loop until the queue closes and drains.
    pub async fn run(mut self) {
        for _ in 0..self.config.initial_workers {
            self.add_worker();
        }
        info!(
            kind = %self.config.kind,
            workers = self.workers.len(),
            "stage-1 pool started"
        );

        let kind = self.config.kind;
        loop {
            let step = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv(), if self.cmds_open => Step::Command(cmd),
                item = self.queue.dequeue_for(kind) => Step::Item(item),
            };
            match step {
                Step::Command(Some(PoolCommand::Spawn)) => self.add_worker(),
                Step::Command(Some(PoolCommand::Retire)) => self.retire_worker(),
                Step::Command(None) => self.cmds_open = false,
                Step::Item(Some(request)) => self.dispatch(request).await,
                Step::Item(None) => break,
            }
        }

        // Queue closed and drained: release the workers and let each finish
        // what it already holds.
        info!(kind = %self.config.kind, "stage-1 pool stopping");
        self.workers.clear();
        self.size.store(0, Ordering::Relaxed);
    }

    /// Hand a request to the next worker in rotation.
    async fn dispatch(&mut self, request: Request) {
        loop {
            if self.workers.is_empty() {
                // Nothing in rotation; put the request back for a future
                // worker. Lost only if the queue is already closed.
                if self.queue.enqueue(request).is_err() {
                    debug!(kind = %self.config.kind, "dropping request, pool empty and queue closed");
                }
                return;
            }
            let idx = self.cursor % self.workers.len();
            let tx = self.workers[idx].tx.clone();
            match tx.reserve().await {
                Ok(permit) => {
                    self.cursor = self.cursor.wrapping_add(1);
                    permit.send(request);
                    return;
                }
                Err(_) => {
                    // Worker exited outside the retire path (shutdown race).
                    let slot = self.workers.remove(idx);
                    warn!(worker = %slot.id, "stage-1 worker vanished from rotation");
                    self.size.store(self.workers.len(), Ordering::Relaxed);
                }
            };
        }
    }

    fn add_worker(&mut self) {
        let slot = self.next_slot;
        self.next_slot += 1;
        let id = worker_node_id(self.config.kind, slot);
        let (tx, rx) = mpsc::channel(1);

        let worker = Stage1Worker {
            id: id.clone(),
            kind: self.config.kind,
            service_times: self.config.service_times,
            rng: ChaCha8Rng::seed_from_u64(sub_seed(
                self.config.seed,
                (self.config.kind.index() as u64 + 1) * 1_000 + slot as u64,
            )),
            distributor: Arc::clone(&self.distributor),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.clone(),
        };
        let _task: JoinHandle<()> = tokio::spawn(worker.run(rx));

        self.workers.push(WorkerSlot { id: id.clone(), tx });
        self.size.store(self.workers.len(), Ordering::Relaxed);
        info!(worker = %id, kind = %self.config.kind, "stage-1 worker added");
    }

    fn retire_worker(&mut self) {
        // Hard floor of one worker; the autoscaler enforces the configured
        // minimum above this.
        if self.workers.len() <= 1 {
            warn!(kind = %self.config.kind, "ignoring retire, pool at floor");
            return;
        }
        // Retire the most recently added worker.
        let slot = self.workers.pop().expect("pool checked non-empty");
        self.size.store(self.workers.len(), Ordering::Relaxed);
        info!(worker = %slot.id, kind = %self.config.kind, "stage-1 worker retiring");
        // Dropping the sender lets the worker finish its current request
        // and exit before its next dequeue.
        drop(slot.tx);
    }
}

fn worker_node_id(kind: RequestKind, slot: usize) -> NodeId {
    let n = kind.index() + 1;
    if slot == 1 {
        NodeId::from(format!("P1{n}"))
    } else {
        NodeId::from(format!("P1{n}_{slot}"))
    }
}

struct Stage1Worker {
    id: NodeId,
    kind: RequestKind,
    service_times: ServiceTimes,
    rng: ChaCha8Rng,
    distributor: Arc<Distributor>,
    metrics: Arc<MetricsCollector>,
    shutdown: Shutdown,
}

impl Stage1Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.recv().await {
            let service = self.service_times.sample(&mut self.rng);
            tokio::select! {
                biased;
                _ = self.shutdown.signaled() => {
                    debug!(worker = %self.id, "interrupted during service");
                    return;
                }
                _ = tokio::time::sleep(service) => {}
            }
            self.distributor.submit(&request);
            self.metrics.record_served(&self.id, self.kind);
            debug!(
                worker = %self.id,
                id = %request.id,
                service_ms = service.as_millis() as u64,
                "request forwarded to distributor"
            );
        }
        debug!(worker = %self.id, "stage-1 worker exited");
    }
}
