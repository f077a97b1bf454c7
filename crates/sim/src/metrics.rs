//! Run metrics and the final report.
//!
//! One collector is shared by every node task. Counters are folded into a
//! single report at shutdown; the report is serializable and is what the
//! binary writes to `simulation_results.json`.

use crate::client::Disposition;
use qnet_core::PriorityQueue;
use qnet_types::{NodeId, RequestKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
struct ClientCounters {
    sent: u64,
    ok: u64,
    failed: u64,
    retries: u64,
}

#[derive(Debug, Clone)]
struct ProcessorCounters {
    kind: RequestKind,
    served: u64,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<NodeId, ClientCounters>,
    processors: HashMap<NodeId, ProcessorCounters>,
    latencies: Vec<f64>,
    failed_timeout: u64,
    failed_exhausted: u64,
}

/// Shared, internally synchronized metrics collector.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A client sent a new logical request (retries are not counted here).
    pub fn record_sent(&self, client: &NodeId) {
        let mut inner = self.lock();
        inner.clients.entry(client.clone()).or_default().sent += 1;
    }

    pub fn record_retry(&self, client: &NodeId) {
        let mut inner = self.lock();
        inner.clients.entry(client.clone()).or_default().retries += 1;
    }

    /// A logical request completed with all three legs ok.
    pub fn record_success(&self, client: &NodeId, latency: Duration) {
        let mut inner = self.lock();
        inner.clients.entry(client.clone()).or_default().ok += 1;
        inner.latencies.push(latency.as_secs_f64());
    }

    /// A logical request was retired without success.
    pub fn record_failure(&self, client: &NodeId, disposition: Disposition) {
        let mut inner = self.lock();
        inner.clients.entry(client.clone()).or_default().failed += 1;
        match disposition {
            Disposition::Timeout => inner.failed_timeout += 1,
            Disposition::Exhausted => inner.failed_exhausted += 1,
            Disposition::Success => {}
        }
    }

    /// A worker finished handling one request.
    pub fn record_served(&self, processor: &NodeId, kind: RequestKind) {
        let mut inner = self.lock();
        inner
            .processors
            .entry(processor.clone())
            .or_insert(ProcessorCounters { kind, served: 0 })
            .served += 1;
    }

    /// Requests served so far by one processor.
    pub fn served_by(&self, processor: &NodeId) -> u64 {
        self.lock()
            .processors
            .get(processor)
            .map(|p| p.served)
            .unwrap_or(0)
    }

    /// Quick counters for progress logging.
    pub fn progress(&self) -> Progress {
        let inner = self.lock();
        let mut progress = Progress::default();
        for counters in inner.clients.values() {
            progress.sent += counters.sent;
            progress.successful += counters.ok;
            progress.failed += counters.failed;
            progress.retries += counters.retries;
        }
        progress
    }

    /// Fold everything into the final report.
    pub fn finalize(&self, queue: &PriorityQueue, elapsed: Duration) -> SimulationReport {
        let inner = self.lock();

        let mut total_requests = 0;
        let mut successful = 0;
        let mut failed = 0;
        let mut per_client = BTreeMap::new();
        for (id, counters) in &inner.clients {
            total_requests += counters.sent;
            successful += counters.ok;
            failed += counters.failed;
            per_client.insert(
                id.to_string(),
                ClientReport {
                    sent: counters.sent,
                    ok: counters.ok,
                    failed: counters.failed,
                    retries: counters.retries,
                },
            );
        }

        let per_processor = inner
            .processors
            .iter()
            .map(|(id, counters)| {
                (
                    id.to_string(),
                    ProcessorReport {
                        served: counters.served,
                        kind: counters.kind.label().to_owned(),
                    },
                )
            })
            .collect();

        let avg_latency_seconds = if inner.latencies.is_empty() {
            0.0
        } else {
            inner.latencies.iter().sum::<f64>() / inner.latencies.len() as f64
        };
        let success_rate = if total_requests > 0 {
            successful as f64 / total_requests as f64
        } else {
            0.0
        };
        let throughput_per_second = if elapsed > Duration::ZERO {
            successful as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let queue_wait = RequestKind::ALL
            .iter()
            .map(|kind| {
                let mut samples = queue.wait_samples(*kind);
                samples.sort_by(|a, b| a.total_cmp(b));
                (
                    kind.label().to_owned(),
                    QueueWaitReport {
                        p50: percentile(&samples, 50.0),
                        p95: percentile(&samples, 95.0),
                        p99: percentile(&samples, 99.0),
                    },
                )
            })
            .collect();

        SimulationReport {
            total_requests,
            successful,
            failed,
            success_rate,
            avg_latency_seconds,
            throughput_per_second,
            failed_timeout: inner.failed_timeout,
            failed_exhausted: inner.failed_exhausted,
            per_client,
            per_processor,
            queue_wait,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("metrics lock poisoned")
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals used by the engine's status log.
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub sent: u64,
    pub successful: u64,
    pub failed: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    pub sent: u64,
    pub ok: u64,
    pub failed: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorReport {
    pub served: u64,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueWaitReport {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Final results document.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_latency_seconds: f64,
    pub throughput_per_second: f64,
    pub failed_timeout: u64,
    pub failed_exhausted: u64,
    pub per_client: BTreeMap<String, ClientReport>,
    pub per_processor: BTreeMap<String, ProcessorReport>,
    pub queue_wait: BTreeMap<String, QueueWaitReport>,
}

impl SimulationReport {
    pub fn print_summary(&self) {
        println!("\n=== Simulation Report ===");
        println!("Total requests:  {}", self.total_requests);
        println!(
            "Successful:      {} ({:.1}%)",
            self.successful,
            self.success_rate * 100.0
        );
        println!(
            "Failed:          {} (timeout {}, retries exhausted {})",
            self.failed, self.failed_timeout, self.failed_exhausted
        );
        println!("Avg latency:     {:.3}s", self.avg_latency_seconds);
        println!("Throughput:      {:.2} req/s", self.throughput_per_second);
        for (kind, wait) in &self.queue_wait {
            println!(
                "Queue wait {kind}:   p50 {:.3}s  p95 {:.3}s  p99 {:.3}s",
                wait.p50, wait.p95, wait.p99
            );
        }
        for (client, stats) in &self.per_client {
            println!(
                "{client}: sent {} ok {} failed {} retries {}",
                stats.sent, stats.ok, stats.failed, stats.retries
            );
        }
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_arithmetic_adds_up() {
        let metrics = MetricsCollector::new();
        let k1 = NodeId::from("K1");
        let k2 = NodeId::from("K2");

        for _ in 0..3 {
            metrics.record_sent(&k1);
        }
        metrics.record_sent(&k2);
        metrics.record_success(&k1, Duration::from_millis(100));
        metrics.record_success(&k1, Duration::from_millis(300));
        metrics.record_retry(&k2);
        metrics.record_failure(&k2, Disposition::Exhausted);

        let queue = PriorityQueue::new();
        let report = metrics.finalize(&queue, Duration::from_secs(2));

        assert_eq!(report.total_requests, 4);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_exhausted, 1);
        assert_eq!(report.success_rate, 0.5);
        assert!((report.avg_latency_seconds - 0.2).abs() < 1e-9);
        assert_eq!(report.throughput_per_second, 1.0);
        assert_eq!(report.per_client["K1"].sent, 3);
        assert_eq!(report.per_client["K2"].retries, 1);
    }

    #[test]
    fn served_counters_keep_worker_kind() {
        let metrics = MetricsCollector::new();
        let p11 = NodeId::from("P11");
        metrics.record_served(&p11, RequestKind::Z1);
        metrics.record_served(&p11, RequestKind::Z1);
        assert_eq!(metrics.served_by(&p11), 2);

        let queue = PriorityQueue::new();
        let report = metrics.finalize(&queue, Duration::from_secs(1));
        assert_eq!(report.per_processor["P11"].served, 2);
        assert_eq!(report.per_processor["P11"].kind, "z1");
    }

    #[test]
    fn percentiles_on_sorted_samples() {
        let samples: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&samples, 50.0), 51.0);
        assert_eq!(percentile(&samples, 99.0), 99.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
