//! End-to-end pipeline tests: full engine runs plus a focused
//! broadcast/fan-in assembly.

use qnet_core::ServiceTimes;
use qnet_sim::autoscaler::{decide, AutoscalerConfig, ScaleAction};
use qnet_sim::distributor::Distributor;
use qnet_sim::shutdown::ShutdownController;
use qnet_sim::stage2::{run_stage2, Stage2Config};
use qnet_sim::transport::Transport;
use qnet_sim::{MetricsCollector, SimConfig, SimulationEngine};
use qnet_types::{NodeId, Request, RequestId, RequestKind};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn fast_config() -> SimConfig {
    SimConfig::default()
        .with_service_times(ServiceTimes::Fixed { value: 0.01 })
        .with_duration(Duration::from_millis(1_000))
        .with_rate(20.0)
        .with_seed(325)
        .with_drain_timeout(Duration::from_secs(10))
}

#[tokio::test(flavor = "multi_thread")]
async fn reliable_pipeline_completes_every_request() {
    // With no stage-2 failures and no retries allowed, every request must
    // succeed and none may be retried.
    let config = fast_config()
        .with_failure_probability(0.0)
        .with_max_retries(0);
    let engine = SimulationEngine::new(config).unwrap();
    let report = engine.run().await;

    assert!(report.total_requests > 0, "clients should have sent traffic");
    assert_eq!(report.failed, 0);
    assert_eq!(report.successful, report.total_requests);
    assert_eq!(report.success_rate, 1.0);
    assert!(report.avg_latency_seconds > 0.0);
    for client in report.per_client.values() {
        assert_eq!(client.retries, 0);
        assert_eq!(client.sent, client.ok);
    }

    // All three initial stage-1 workers and stage-2 processors show up.
    for name in ["P11", "P12", "P13", "P21", "P22", "P23"] {
        assert!(
            report.per_processor.contains_key(name),
            "missing processor {name}"
        );
    }
    // Stage-2 processors each see every request once.
    let total = report.total_requests;
    for name in ["P21", "P22", "P23"] {
        assert_eq!(report.per_processor[name].served, total);
    }
    for kind in ["z1", "z2", "z3"] {
        assert!(report.queue_wait.contains_key(kind));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_legs_exhaust_the_retry_budget() {
    // Every stage-2 leg fails, so every attempt short-circuits on the first
    // negative reply, burns its retries and is finally retired as failed.
    let config = fast_config()
        .with_rate(10.0)
        .with_failure_probability(1.0)
        .with_max_retries(2);
    let engine = SimulationEngine::new(config).unwrap();
    let report = engine.run().await;

    assert!(report.total_requests > 0);
    assert_eq!(report.successful, 0);
    assert_eq!(report.failed, report.total_requests);
    assert_eq!(report.failed_exhausted, report.failed);
    assert_eq!(report.success_rate, 0.0);

    let retries: u64 = report.per_client.values().map(|c| c.retries).sum();
    assert_eq!(retries, 2 * report.total_requests);
}

#[tokio::test(flavor = "multi_thread")]
async fn success_and_failure_account_for_every_retired_request() {
    let config = fast_config()
        .with_rate(15.0)
        .with_failure_probability(0.3)
        .with_max_retries(1);
    let engine = SimulationEngine::new(config).unwrap();
    let report = engine.run().await;

    assert!(report.total_requests > 0);
    assert_eq!(report.successful + report.failed, report.total_requests);
    assert_eq!(
        report.failed,
        report.failed_timeout + report.failed_exhausted
    );
}

#[tokio::test]
async fn one_request_fans_out_to_exactly_three_legs() {
    // Distributor + three reliable stage-2 processors: a single submitted
    // request yields one ok response from each producer kind.
    let transport = Arc::new(Transport::new());
    let mut mailbox = transport.register(NodeId::from("K1"));
    let metrics = Arc::new(MetricsCollector::new());
    let shutdown = ShutdownController::new();

    let mut senders = Vec::new();
    for kind in RequestKind::ALL {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        let config = Stage2Config {
            node_id: NodeId::from(format!("P2{}", kind.index() + 1)),
            kind,
            failure_probability: 0.0,
            idle_timeout: Duration::from_secs(60),
            service_times: ServiceTimes::Fixed { value: 0.01 },
            seed: 5,
        };
        tokio::spawn(run_stage2(
            config,
            rx,
            Arc::clone(&transport),
            Arc::clone(&metrics),
            shutdown.subscribe(),
        ));
    }
    let outputs: [mpsc::UnboundedSender<Request>; 3] = senders.try_into().unwrap();
    let distributor = Distributor::new(outputs);

    distributor.submit(&Request {
        id: RequestId(1),
        kind: RequestKind::Z2,
        origin: NodeId::from("K1"),
        created_at: Instant::now(),
        attempt: 0,
    });

    let mut kinds = BTreeSet::new();
    for _ in 0..3 {
        let response = tokio::time::timeout(Duration::from_secs(5), mailbox.recv())
            .await
            .expect("three legs expected")
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.request_id.0, 1);
        kinds.insert(response.producer_kind);
    }
    assert_eq!(kinds.len(), 3, "one response per producer kind");

    // No fourth leg ever arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mailbox.try_recv().is_err());
    shutdown.trigger();
}

#[test]
fn scaling_decisions_stay_within_bounds() {
    // Bounds invariant at the decision level: a saturated pool is never
    // grown, a minimal pool is never shrunk.
    let config = AutoscalerConfig::from(&SimConfig::default());
    for size in 1..=5 {
        match decide(100.0, 10, size, &config) {
            Some(ScaleAction::Up) => assert!(size < 5),
            None => assert_eq!(size, 5),
            other => panic!("unexpected action {other:?}"),
        }
        match decide(0.0, 10, size, &config) {
            Some(ScaleAction::Down) => assert!(size > 1),
            None => assert_eq!(size, 1),
            other => panic!("unexpected action {other:?}"),
        }
    }
}

#[test]
fn config_errors_are_fatal_before_startup() {
    let config = SimConfig::default().with_rate(-1.0);
    assert!(SimulationEngine::new(config).is_err());
}
