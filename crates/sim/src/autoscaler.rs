//! Latency-driven autoscaling of the stage-1 pools.
//!
//! A periodic task reads each kind's average queue wait over the
//! observation window and grows or shrinks that kind's pool within the
//! configured bounds, one action per kind per tick, gated by a per-kind
//! cooldown. Thresholds are strict inequalities; inside the hysteretic
//! band no action is taken, and fewer than [`MIN_WAIT_SAMPLES`] samples in
//! the window also means no action.
//!
//! The autoscaler only holds [`PoolHandle`]s; the worker lists stay owned
//! by the pools. A panic inside the scaling loop is caught by
//! [`supervise`], which restarts the loop while the pipeline keeps running
//! at its current scale.

use crate::config::SimConfig;
use crate::pool::PoolHandle;
use crate::shutdown::Shutdown;
use qnet_core::PriorityQueue;
use qnet_types::RequestKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Minimum wait samples in the window before any scaling decision.
pub const MIN_WAIT_SAMPLES: usize = 3;

/// One scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Up,
    Down,
}

/// Scaling state of one pool. `ScalingUp`/`ScalingDown` cover the cooldown
/// interval after a decision; further actions for that kind are suppressed
/// until the pool is back to `Steady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Steady,
    ScalingUp,
    ScalingDown,
}

#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    /// Scale up above this average wait (seconds).
    pub scale_up_threshold: f64,
    /// Scale down below this average wait (seconds).
    pub scale_down_threshold: f64,
    /// Cooldown between actions for one kind; doubles as the observation
    /// window.
    pub cooldown: Duration,
    pub check_interval: Duration,
    pub min_per_type: usize,
    pub max_per_type: usize,
}

impl From<&SimConfig> for AutoscalerConfig {
    fn from(config: &SimConfig) -> Self {
        AutoscalerConfig {
            scale_up_threshold: config.avg_wait_time_threshold,
            scale_down_threshold: config.scale_down_threshold,
            cooldown: config.scaling_cooldown,
            check_interval: config.scaling_check_interval,
            min_per_type: config.min_processors_per_type,
            max_per_type: config.max_processors_per_type,
        }
    }
}

/// Pure decision function: strict thresholds, hysteretic band, bounds.
pub fn decide(
    avg_wait_secs: f64,
    samples: usize,
    pool_size: usize,
    config: &AutoscalerConfig,
) -> Option<ScaleAction> {
    if samples < MIN_WAIT_SAMPLES {
        return None;
    }
    if avg_wait_secs > config.scale_up_threshold && pool_size < config.max_per_type {
        return Some(ScaleAction::Up);
    }
    if avg_wait_secs < config.scale_down_threshold && pool_size > config.min_per_type {
        return Some(ScaleAction::Down);
    }
    None
}

pub struct Autoscaler {
    config: AutoscalerConfig,
    queue: Arc<PriorityQueue>,
    pools: [PoolHandle; 3],
    last_scale: [Option<Instant>; 3],
    states: [PoolState; 3],
}

impl Autoscaler {
    pub fn new(
        config: AutoscalerConfig,
        queue: Arc<PriorityQueue>,
        pools: [PoolHandle; 3],
    ) -> Self {
        Autoscaler {
            config,
            queue,
            pools,
            last_scale: [None; 3],
            states: [PoolState::Steady; 3],
        }
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(
            scale_up = self.config.scale_up_threshold,
            scale_down = self.config.scale_down_threshold,
            cooldown_secs = self.config.cooldown.as_secs_f64(),
            "autoscaler started"
        );
        let mut tick = tokio::time::interval(self.config.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.signaled() => break,
                _ = tick.tick() => self.evaluate(Instant::now()),
            }
        }
        info!("autoscaler stopped");
    }

    /// One evaluation pass over all kinds.
    pub fn evaluate(&mut self, now: Instant) {
        for kind in RequestKind::ALL {
            let i = kind.index();
            if let Some(last) = self.last_scale[i] {
                if now.duration_since(last) < self.config.cooldown {
                    // Still inside the post-decision interval.
                    continue;
                }
            }
            if self.states[i] != PoolState::Steady {
                debug!(kind = %kind, state = ?self.states[i], "pool back to steady");
                self.states[i] = PoolState::Steady;
            }

            let avg_wait = self.queue.avg_wait(kind, self.config.cooldown).as_secs_f64();
            let samples = self.queue.wait_sample_count(kind, self.config.cooldown);
            let size = self.pools[i].size();

            match decide(avg_wait, samples, size, &self.config) {
                Some(ScaleAction::Up) => {
                    info!(
                        kind = %kind,
                        avg_wait_secs = avg_wait,
                        pool_size = size,
                        "scaling up"
                    );
                    self.pools[i].spawn_worker();
                    self.last_scale[i] = Some(now);
                    self.states[i] = PoolState::ScalingUp;
                }
                Some(ScaleAction::Down) => {
                    info!(
                        kind = %kind,
                        avg_wait_secs = avg_wait,
                        pool_size = size,
                        "scaling down"
                    );
                    self.pools[i].retire_worker();
                    self.last_scale[i] = Some(now);
                    self.states[i] = PoolState::ScalingDown;
                }
                None => {}
            }
        }
    }

    #[cfg(test)]
    fn state(&self, kind: RequestKind) -> PoolState {
        self.states[kind.index()]
    }
}

/// Run the autoscaler, restarting it if it panics. A restart resets the
/// cooldown bookkeeping but leaves the pools at their current scale.
pub async fn supervise(
    config: AutoscalerConfig,
    queue: Arc<PriorityQueue>,
    pools: [PoolHandle; 3],
    shutdown: Shutdown,
) {
    loop {
        let scaler = Autoscaler::new(config.clone(), Arc::clone(&queue), pools.clone());
        let task = tokio::spawn(scaler.run(shutdown.clone()));
        match task.await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                error!("autoscaler panicked, restarting");
                if shutdown.is_signaled() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolCommand;
    use qnet_types::{NodeId, Request, RequestId};

    fn config() -> AutoscalerConfig {
        AutoscalerConfig {
            scale_up_threshold: 5.0,
            scale_down_threshold: 1.5,
            cooldown: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
            min_per_type: 1,
            max_per_type: 5,
        }
    }

    #[test]
    fn decide_honors_thresholds_and_band() {
        let config = config();
        assert_eq!(decide(6.0, 10, 2, &config), Some(ScaleAction::Up));
        assert_eq!(decide(1.0, 10, 2, &config), Some(ScaleAction::Down));
        // Hysteretic band: no action.
        assert_eq!(decide(3.0, 10, 2, &config), None);
        // Strict inequality at the edges.
        assert_eq!(decide(5.0, 10, 2, &config), None);
        assert_eq!(decide(1.5, 10, 2, &config), None);
    }

    #[test]
    fn decide_honors_pool_bounds() {
        let config = config();
        assert_eq!(decide(100.0, 10, 5, &config), None);
        assert_eq!(decide(0.0, 10, 1, &config), None);
    }

    #[test]
    fn decide_needs_enough_samples() {
        let config = config();
        assert_eq!(decide(100.0, MIN_WAIT_SAMPLES - 1, 1, &config), None);
        assert_eq!(decide(100.0, MIN_WAIT_SAMPLES, 1, &config), Some(ScaleAction::Up));
    }

    fn request(id: u64, kind: RequestKind) -> Request {
        Request {
            id: RequestId(id),
            kind,
            origin: NodeId::from("K1"),
            created_at: Instant::now(),
            attempt: 0,
        }
    }

    /// Build queue wait samples for `kind` by cycling requests through it.
    async fn record_waits(queue: &PriorityQueue, kind: RequestKind, count: usize, delay: Duration) {
        for i in 0..count {
            queue.enqueue(request(i as u64, kind)).unwrap();
        }
        tokio::time::sleep(delay).await;
        for _ in 0..count {
            queue.dequeue_for(kind).await.unwrap();
        }
    }

    #[tokio::test]
    async fn evaluate_scales_up_and_respects_cooldown() {
        let queue = Arc::new(PriorityQueue::new());
        record_waits(&queue, RequestKind::Z3, 4, Duration::from_millis(30)).await;

        let mut cfg = config();
        cfg.scale_up_threshold = 0.001; // the ~30ms observed wait is "too slow"
        cfg.scale_down_threshold = 0.0001;

        let (h1, _r1) = PoolHandle::stub(RequestKind::Z1, 1);
        let (h2, _r2) = PoolHandle::stub(RequestKind::Z2, 1);
        let (h3, mut r3) = PoolHandle::stub(RequestKind::Z3, 1);
        let mut scaler = Autoscaler::new(cfg, Arc::clone(&queue), [h1, h2, h3]);

        let now = Instant::now();
        scaler.evaluate(now);
        assert_eq!(r3.try_recv().unwrap(), PoolCommand::Spawn);
        assert_eq!(scaler.state(RequestKind::Z3), PoolState::ScalingUp);

        // Within the cooldown nothing further happens for that kind.
        scaler.evaluate(now + Duration::from_secs(5));
        assert!(r3.try_recv().is_err());
        assert_eq!(scaler.state(RequestKind::Z3), PoolState::ScalingUp);

        // After the cooldown the pool is steady again and may act anew.
        scaler.evaluate(now + Duration::from_secs(11));
        assert_eq!(r3.try_recv().unwrap(), PoolCommand::Spawn);
    }

    #[tokio::test]
    async fn evaluate_scales_down_idle_pools() {
        let queue = Arc::new(PriorityQueue::new());
        // Items dequeued immediately: near-zero waits.
        record_waits(&queue, RequestKind::Z2, 4, Duration::ZERO).await;

        let (h1, _r1) = PoolHandle::stub(RequestKind::Z1, 1);
        let (h2, mut r2) = PoolHandle::stub(RequestKind::Z2, 3);
        let (h3, _r3) = PoolHandle::stub(RequestKind::Z3, 1);
        let mut scaler = Autoscaler::new(config(), Arc::clone(&queue), [h1, h2, h3]);

        scaler.evaluate(Instant::now());
        assert_eq!(r2.try_recv().unwrap(), PoolCommand::Retire);
        assert_eq!(scaler.state(RequestKind::Z2), PoolState::ScalingDown);
    }

    #[tokio::test]
    async fn evaluate_takes_no_action_without_samples() {
        let queue = Arc::new(PriorityQueue::new());
        let (h1, mut r1) = PoolHandle::stub(RequestKind::Z1, 3);
        let (h2, _r2) = PoolHandle::stub(RequestKind::Z2, 1);
        let (h3, _r3) = PoolHandle::stub(RequestKind::Z3, 1);
        let mut scaler = Autoscaler::new(config(), queue, [h1, h2, h3]);

        scaler.evaluate(Instant::now());
        assert!(r1.try_recv().is_err());
        assert_eq!(scaler.state(RequestKind::Z1), PoolState::Steady);
    }
}
