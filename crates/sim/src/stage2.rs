//! Stage-2 queues and fallible processors (Q2x / P2x).
//!
//! Each kind has a plain FIFO (an unbounded channel fed by the distributor)
//! and a single consumer. The processor is fallible two ways: per request
//! it fails the leg with a configured probability (an immediate `ok=false`
//! reply), and if it sits idle past `idle_timeout` it is considered failed
//! and a supervisor replaces it with a fresh worker under the same node id.

use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;
use crate::transport::Transport;
use qnet_core::{sub_seed, ServiceTimes};
use qnet_types::{NodeId, Request, RequestKind, Response};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration of one stage-2 processor.
#[derive(Debug, Clone)]
pub struct Stage2Config {
    pub node_id: NodeId,
    /// Kind of leg this processor produces.
    pub kind: RequestKind,
    pub failure_probability: f64,
    pub idle_timeout: Duration,
    pub service_times: ServiceTimes,
    pub seed: u64,
}

enum WorkerExit {
    /// Idle past `idle_timeout`; the supervisor spawns a replacement.
    Idle,
    /// Queue closed (distributor gone) and drained.
    Closed,
    /// Hard shutdown signal.
    Shutdown,
}

/// Supervise one stage-2 processor, replacing it whenever it idles out.
pub async fn run_stage2(
    config: Stage2Config,
    mut queue: mpsc::UnboundedReceiver<Request>,
    transport: Arc<Transport>,
    metrics: Arc<MetricsCollector>,
    mut shutdown: Shutdown,
) {
    let mut incarnation: u64 = 0;
    loop {
        let mut rng = ChaCha8Rng::seed_from_u64(sub_seed(config.seed, incarnation));
        match worker_loop(&config, &mut queue, &mut rng, &transport, &metrics, &mut shutdown).await
        {
            WorkerExit::Idle => {
                warn!(
                    node = %config.node_id,
                    incarnation,
                    "stage-2 worker idle timeout, replacing"
                );
                incarnation += 1;
            }
            WorkerExit::Closed => {
                debug!(node = %config.node_id, "stage-2 queue closed");
                break;
            }
            WorkerExit::Shutdown => break,
        }
    }
    info!(node = %config.node_id, "stage-2 processor stopped");
}

async fn worker_loop(
    config: &Stage2Config,
    queue: &mut mpsc::UnboundedReceiver<Request>,
    rng: &mut ChaCha8Rng,
    transport: &Transport,
    metrics: &MetricsCollector,
    shutdown: &mut Shutdown,
) -> WorkerExit {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.signaled() => return WorkerExit::Shutdown,
            received = tokio::time::timeout(config.idle_timeout, queue.recv()) => {
                match received {
                    Err(_) => return WorkerExit::Idle,
                    Ok(None) => return WorkerExit::Closed,
                    Ok(Some(request)) => request,
                }
            }
        };

        if rng.gen::<f64>() < config.failure_probability {
            debug!(node = %config.node_id, id = %request.id, "leg failed");
            reply(config, transport, &request, false);
            metrics.record_served(&config.node_id, config.kind);
            continue;
        }

        let service = config.service_times.sample(rng);
        tokio::select! {
            biased;
            _ = shutdown.signaled() => return WorkerExit::Shutdown,
            _ = tokio::time::sleep(service) => {}
        }

        reply(config, transport, &request, true);
        metrics.record_served(&config.node_id, config.kind);
        debug!(
            node = %config.node_id,
            id = %request.id,
            service_ms = service.as_millis() as u64,
            "leg completed"
        );
    }
}

fn reply(config: &Stage2Config, transport: &Transport, request: &Request, ok: bool) {
    let response = Response {
        request_id: request.id,
        producer_kind: config.kind,
        ok,
        completed_at: Instant::now(),
    };
    if let Err(err) = transport.send(&request.origin, response) {
        // The client resolves the missing leg through its timeout.
        debug!(node = %config.node_id, %err, "response undeliverable");
    }
}
