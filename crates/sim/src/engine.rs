//! Simulation engine.
//!
//! Builds the topology bottom-up (stage-2 processors, distributor, stage-1
//! pools, clients, autoscaler), runs traffic for the configured duration,
//! then tears everything down in drain order: clients stop generating and
//! resolve their in-flight requests first, then Q1 closes and the pools
//! drain, then the stage-2 processors and the autoscaler stop.

use crate::autoscaler::{self, AutoscalerConfig};
use crate::client::{Client, ClientConfig};
use crate::config::{ConfigError, SimConfig};
use crate::distributor::Distributor;
use crate::metrics::{MetricsCollector, SimulationReport};
use crate::pool::{Pool, PoolConfig, PoolHandle};
use crate::shutdown::ShutdownController;
use crate::stage2::{run_stage2, Stage2Config};
use crate::transport::Transport;
use qnet_core::{sub_seed, PriorityQueue};
use qnet_types::{NodeId, RequestKind};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Entity-index bases for RNG sub-seeding, one namespace per node class.
const CLIENT_SEED_BASE: u64 = 0x1000;
const STAGE2_SEED_BASE: u64 = 0x2000;

pub struct SimulationEngine {
    config: SimConfig,
}

impl SimulationEngine {
    /// Validate the configuration and build an engine.
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(SimulationEngine { config })
    }

    /// Run the full simulation and return the final report.
    pub async fn run(self) -> SimulationReport {
        let config = &self.config;
        let started = Instant::now();

        let metrics = Arc::new(MetricsCollector::new());
        let transport = Arc::new(Transport::new());
        let queue = Arc::new(PriorityQueue::new());
        let shutdown = ShutdownController::new();
        let drain = ShutdownController::new();

        // Stage 2: one queue + supervised fallible processor per kind.
        let mut stage2_tasks = Vec::new();
        let mut stage2_senders = Vec::new();
        for kind in RequestKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            stage2_senders.push(tx);
            let stage2_config = Stage2Config {
                node_id: NodeId::from(format!("P2{}", kind.index() + 1)),
                kind,
                failure_probability: config.p2x_failure_probability,
                idle_timeout: config.idle_timeout,
                service_times: config.service_times,
                seed: sub_seed(config.seed, STAGE2_SEED_BASE + kind.index() as u64),
            };
            stage2_tasks.push(tokio::spawn(run_stage2(
                stage2_config,
                rx,
                Arc::clone(&transport),
                Arc::clone(&metrics),
                shutdown.subscribe(),
            )));
        }
        let outputs: [mpsc::UnboundedSender<_>; 3] = stage2_senders
            .try_into()
            .expect("one sender per kind");
        let distributor = Arc::new(Distributor::new(outputs));

        // Stage 1: one pool per kind, starting at the configured minimum.
        let mut pool_tasks = Vec::new();
        let mut pool_handles = Vec::new();
        for kind in RequestKind::ALL {
            let (pool, handle) = Pool::new(
                PoolConfig {
                    kind,
                    initial_workers: config.min_processors_per_type,
                    service_times: config.service_times,
                    seed: config.seed,
                },
                Arc::clone(&queue),
                Arc::clone(&distributor),
                Arc::clone(&metrics),
                shutdown.subscribe(),
            );
            pool_tasks.push(tokio::spawn(pool.run()));
            pool_handles.push(handle);
        }
        let pool_handles: [PoolHandle; 3] = pool_handles
            .try_into()
            .expect("one pool per kind");

        // Clients: K1 emits {z1, z2}, K2 emits {z2, z3}.
        let request_ids = Arc::new(AtomicU64::new(1));
        let client_specs: [(&str, Vec<RequestKind>); 2] = [
            ("K1", vec![RequestKind::Z1, RequestKind::Z2]),
            ("K2", vec![RequestKind::Z2, RequestKind::Z3]),
        ];
        let mut client_tasks = Vec::new();
        for (index, (name, kinds)) in client_specs.into_iter().enumerate() {
            let node_id = NodeId::from(name);
            let mailbox = transport.register(node_id.clone());
            let client = Client::new(
                ClientConfig {
                    node_id,
                    kinds,
                    rate: config.rate,
                    request_timeout: config.client_request_timeout,
                    max_retries: config.max_retries,
                    seed: sub_seed(config.seed, CLIENT_SEED_BASE + index as u64),
                },
                Arc::clone(&queue),
                Arc::clone(&request_ids),
                mailbox,
                Arc::clone(&metrics),
                drain.subscribe(),
                shutdown.subscribe(),
            );
            client_tasks.push(tokio::spawn(client.run()));
        }

        // Autoscaler, restarted by its supervisor if it ever panics.
        let scaler_task = tokio::spawn(autoscaler::supervise(
            AutoscalerConfig::from(config),
            Arc::clone(&queue),
            pool_handles.clone(),
            shutdown.subscribe(),
        ));

        info!(
            duration_secs = config.duration.as_secs_f64(),
            rate = config.rate,
            seed = config.seed,
            "simulation started"
        );

        // Traffic phase with periodic status logging.
        let deadline = tokio::time::Instant::now() + config.duration;
        let status_period = Duration::from_secs(10);
        let mut status = tokio::time::interval_at(
            tokio::time::Instant::now() + status_period,
            status_period,
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = status.tick() => log_status(&metrics, &queue, &pool_handles),
            }
        }
        info!("traffic phase complete, draining clients");

        // Drain: clients stop generating, keep resolving in-flight requests.
        drain.trigger();
        for task in &mut client_tasks {
            if tokio::time::timeout(config.drain_timeout, &mut *task)
                .await
                .is_err()
            {
                warn!("client did not drain in time");
            }
        }

        // Close Q1; the pools finish what is queued and stop.
        queue.close();
        // Hard stop for anything still sleeping (abandoned service slots,
        // stage-2 processors, the autoscaler).
        shutdown.trigger();

        for task in pool_tasks {
            let _ = task.await;
        }
        for task in stage2_tasks {
            let _ = task.await;
        }
        let _ = scaler_task.await;

        let elapsed = started.elapsed();
        let report = metrics.finalize(&queue, elapsed);
        info!(
            total = report.total_requests,
            successful = report.successful,
            failed = report.failed,
            fanned_out = distributor.submitted(),
            delivered = transport.stats().delivered(),
            elapsed_secs = elapsed.as_secs_f64(),
            "simulation complete"
        );
        report
    }
}

fn log_status(
    metrics: &MetricsCollector,
    queue: &PriorityQueue,
    pools: &[PoolHandle; 3],
) {
    let progress = metrics.progress();
    info!(
        sent = progress.sent,
        successful = progress.successful,
        failed = progress.failed,
        retries = progress.retries,
        queued = queue.total_len(),
        z1_pool = pools[0].size(),
        z2_pool = pools[1].size(),
        z3_pool = pools[2].size(),
        "status"
    );
}
