//! Core building blocks of the qnet pipeline: the stage-1 priority FIFO
//! and the service-time oracle.

pub mod queue;
pub mod service;

pub use queue::{PriorityQueue, QueueError};
pub use service::{sub_seed, ServiceTimes};
