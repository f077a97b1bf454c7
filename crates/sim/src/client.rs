//! Client nodes (K1, K2).
//!
//! Each client generates requests with exponential inter-arrival gaps,
//! enqueues them into Q1, and fans the three stage-2 legs back in under a
//! per-attempt deadline. An explicit `ok=false` leg short-circuits straight
//! to the retry decision; a deadline expiry reaches the same decision
//! through a once-a-second scan. Retries are fresh requests (new id,
//! incremented attempt) that share the logical request's statistics.

use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;
use crate::transport::Mailbox;
use qnet_core::PriorityQueue;
use qnet_types::{NodeId, Request, RequestId, RequestKind, Response};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Final outcome of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// The last attempt's deadline elapsed.
    Timeout,
    /// The last attempt died on an explicit failed leg.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub node_id: NodeId,
    /// Kinds this client may emit.
    pub kinds: Vec<RequestKind>,
    /// Target requests per second.
    pub rate: f64,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub seed: u64,
}

/// Ticket carrying what a retry needs from the failed attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryTicket {
    pub kind: RequestKind,
    pub attempt: u32,
    pub first_created: Instant,
}

#[derive(Debug)]
pub(crate) enum FanInEvent {
    /// Unknown or duplicate response; discarded.
    Ignored,
    /// One leg arrived ok, more still awaited.
    LegOk,
    /// All three legs ok within the deadline.
    Completed { latency: Duration },
    /// Attempt failed but the retry budget allows another.
    Retry(RetryTicket),
    /// Attempt failed and the budget is spent.
    Failed { disposition: Disposition },
}

enum FailureCause {
    Deadline,
    Leg,
}

struct LegTracker {
    awaited: [bool; 3],
    kind: RequestKind,
    attempt: u32,
    deadline: Instant,
    first_created: Instant,
}

/// Per-client fan-in state: which legs each in-flight attempt still awaits.
///
/// Pure bookkeeping, no timers of its own, so the decision table is
/// testable without tasks.
pub(crate) struct FanIn {
    timeout: Duration,
    max_retries: u32,
    pending: HashMap<RequestId, LegTracker>,
}

impl FanIn {
    pub(crate) fn new(timeout: Duration, max_retries: u32) -> Self {
        FanIn {
            timeout,
            max_retries,
            pending: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Start awaiting all three legs of `request`.
    pub(crate) fn track(&mut self, request: &Request, first_created: Instant, now: Instant) {
        self.pending.insert(
            request.id,
            LegTracker {
                awaited: [true; 3],
                kind: request.kind,
                attempt: request.attempt,
                deadline: now + self.timeout,
                first_created,
            },
        );
    }

    /// Drop the tracker for `id`, if any.
    pub(crate) fn forget(&mut self, id: RequestId) {
        self.pending.remove(&id);
    }

    /// Apply one inbound response.
    pub(crate) fn apply(&mut self, response: &Response, now: Instant) -> FanInEvent {
        let Some(tracker) = self.pending.get_mut(&response.request_id) else {
            return FanInEvent::Ignored;
        };
        if response.ok {
            tracker.awaited[response.producer_kind.index()] = false;
            if tracker.awaited.iter().any(|awaited| *awaited) {
                return FanInEvent::LegOk;
            }
            let tracker = self
                .pending
                .remove(&response.request_id)
                .expect("tracker present");
            FanInEvent::Completed {
                latency: now.duration_since(tracker.first_created),
            }
        } else {
            let tracker = self
                .pending
                .remove(&response.request_id)
                .expect("tracker present");
            self.settle(tracker, FailureCause::Leg)
        }
    }

    /// Collect and settle every attempt whose deadline has passed.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<FanInEvent> {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, tracker)| tracker.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .map(|id| {
                let tracker = self.pending.remove(&id).expect("tracker present");
                self.settle(tracker, FailureCause::Deadline)
            })
            .collect()
    }

    fn settle(&self, tracker: LegTracker, cause: FailureCause) -> FanInEvent {
        if tracker.attempt < self.max_retries {
            FanInEvent::Retry(RetryTicket {
                kind: tracker.kind,
                attempt: tracker.attempt + 1,
                first_created: tracker.first_created,
            })
        } else {
            FanInEvent::Failed {
                disposition: match cause {
                    FailureCause::Deadline => Disposition::Timeout,
                    FailureCause::Leg => Disposition::Exhausted,
                },
            }
        }
    }
}

/// A client node task.
pub struct Client {
    config: ClientConfig,
    queue: Arc<PriorityQueue>,
    ids: Arc<AtomicU64>,
    mailbox: Mailbox,
    metrics: Arc<MetricsCollector>,
    rng: ChaCha8Rng,
    fan_in: FanIn,
    drain: Shutdown,
    shutdown: Shutdown,
}

enum Wake {
    Stop,
    Drain,
    Response(Option<Response>),
    Tick,
    Arrival,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        queue: Arc<PriorityQueue>,
        ids: Arc<AtomicU64>,
        mailbox: Mailbox,
        metrics: Arc<MetricsCollector>,
        drain: Shutdown,
        shutdown: Shutdown,
    ) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        let fan_in = FanIn::new(config.request_timeout, config.max_retries);
        Client {
            config,
            queue,
            ids,
            mailbox,
            metrics,
            rng,
            fan_in,
            drain,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            client = %self.config.node_id,
            kinds = ?self.config.kinds.iter().map(|k| k.label()).collect::<Vec<_>>(),
            rate = self.config.rate,
            "client started"
        );

        let mut next_arrival = tokio::time::Instant::now() + self.next_gap();
        let mut deadline_tick = tokio::time::interval(Duration::from_secs(1));
        deadline_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut draining = false;

        loop {
            if draining && self.fan_in.is_empty() {
                break;
            }
            let wake = {
                let Self {
                    mailbox,
                    drain,
                    shutdown,
                    ..
                } = &mut self;
                tokio::select! {
                    biased;
                    _ = shutdown.signaled() => Wake::Stop,
                    _ = drain.signaled(), if !draining => Wake::Drain,
                    response = mailbox.recv() => Wake::Response(response),
                    _ = deadline_tick.tick() => Wake::Tick,
                    _ = tokio::time::sleep_until(next_arrival), if !draining => Wake::Arrival,
                }
            };
            match wake {
                Wake::Stop => break,
                Wake::Drain => {
                    draining = true;
                    debug!(
                        client = %self.config.node_id,
                        pending = self.fan_in.len(),
                        "draining"
                    );
                }
                Wake::Response(Some(response)) => self.on_response(response),
                Wake::Response(None) => break,
                Wake::Tick => self.on_tick(),
                Wake::Arrival => {
                    self.send_new_request();
                    next_arrival = tokio::time::Instant::now() + self.next_gap();
                }
            }
        }

        info!(
            client = %self.config.node_id,
            pending = self.fan_in.len(),
            "client stopped"
        );
    }

    fn on_response(&mut self, response: Response) {
        let now = Instant::now();
        match self.fan_in.apply(&response, now) {
            FanInEvent::Ignored => {
                debug!(
                    client = %self.config.node_id,
                    id = %response.request_id,
                    "discarding response for retired request"
                );
            }
            FanInEvent::LegOk => {}
            FanInEvent::Completed { latency } => {
                self.metrics.record_success(&self.config.node_id, latency);
                debug!(
                    client = %self.config.node_id,
                    id = %response.request_id,
                    latency_ms = latency.as_millis() as u64,
                    "request completed"
                );
            }
            FanInEvent::Retry(ticket) => self.resend(ticket),
            FanInEvent::Failed { disposition } => self.fail(response.request_id, disposition),
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        for event in self.fan_in.expired(now) {
            match event {
                FanInEvent::Retry(ticket) => self.resend(ticket),
                FanInEvent::Failed { disposition } => {
                    self.metrics.record_failure(&self.config.node_id, disposition);
                    debug!(client = %self.config.node_id, ?disposition, "request timed out");
                }
                _ => unreachable!("expired attempts settle as retry or failure"),
            }
        }
    }

    fn send_new_request(&mut self) {
        let kind = self.config.kinds[self.rng.gen_range(0..self.config.kinds.len())];
        let now = Instant::now();
        let request = Request {
            id: self.alloc_id(),
            kind,
            origin: self.config.node_id.clone(),
            created_at: now,
            attempt: 0,
        };
        let id = request.id;
        self.fan_in.track(&request, now, now);
        self.metrics.record_sent(&self.config.node_id);
        if self.queue.enqueue(request).is_err() {
            warn!(client = %self.config.node_id, %id, "queue closed, request dropped");
            self.fan_in.forget(id);
            self.metrics
                .record_failure(&self.config.node_id, Disposition::Timeout);
        } else {
            debug!(client = %self.config.node_id, %id, kind = %kind, "request sent");
        }
    }

    fn resend(&mut self, ticket: RetryTicket) {
        let now = Instant::now();
        let request = Request {
            id: self.alloc_id(),
            kind: ticket.kind,
            origin: self.config.node_id.clone(),
            created_at: now,
            attempt: ticket.attempt,
        };
        let id = request.id;
        self.fan_in.track(&request, ticket.first_created, now);
        self.metrics.record_retry(&self.config.node_id);
        if self.queue.enqueue(request).is_err() {
            warn!(client = %self.config.node_id, %id, "queue closed, retry dropped");
            self.fan_in.forget(id);
            self.metrics
                .record_failure(&self.config.node_id, Disposition::Timeout);
        } else {
            debug!(
                client = %self.config.node_id,
                %id,
                attempt = ticket.attempt,
                "request retried"
            );
        }
    }

    fn fail(&mut self, id: RequestId, disposition: Disposition) {
        self.metrics.record_failure(&self.config.node_id, disposition);
        debug!(client = %self.config.node_id, %id, ?disposition, "request failed");
    }

    fn alloc_id(&self) -> RequestId {
        RequestId(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Exponential inter-arrival gap with mean `1 / rate`.
    fn next_gap(&mut self) -> Duration {
        let mut chi: f64 = self.rng.gen();
        while chi == 0.0 {
            chi = self.rng.gen();
        }
        Duration::from_secs_f64(-chi.ln() / self.config.rate)
    }
}
