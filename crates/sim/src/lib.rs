//! Distributed queuing-network simulator.
//!
//! A multi-stage request pipeline: clients (K1, K2) feed a priority FIFO
//! (Q1) whose per-kind worker pools (P1x) forward every request through a
//! broadcast distributor (D) into three per-kind FIFOs (Q2x), each served
//! by a fallible processor (P2x) that replies to the originating client.
//! Clients fan the three legs back in under a timeout-and-retry protocol,
//! while an autoscaler grows and shrinks the stage-1 pools from observed
//! queue wait times.
//!
//! Every node runs as its own tokio task; a broadcast shutdown signal and
//! a separate drain signal coordinate orderly teardown.

pub mod autoscaler;
pub mod client;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod metrics;
pub mod pool;
pub mod shutdown;
pub mod stage2;
pub mod transport;

pub use config::{ConfigError, SimConfig};
pub use engine::SimulationEngine;
pub use metrics::{MetricsCollector, SimulationReport};
