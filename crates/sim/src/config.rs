//! Simulation configuration.

use qnet_core::ServiceTimes;
use std::time::Duration;
use thiserror::Error;

/// Fatal configuration errors, detected before any node is launched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("request rate {0} must be positive and finite")]
    InvalidRate(f64),

    #[error("probability {0} must be within [0, 1]")]
    InvalidProbability(f64),

    #[error("processor bounds inverted: min {min} > max {max}")]
    PoolBoundsInverted { min: usize, max: usize },

    #[error("min_processors_per_type must be at least 1")]
    EmptyPool,

    #[error("scaling thresholds inverted: scale_down {down} must be below scale_up {up}")]
    ThresholdsInverted { down: f64, up: f64 },

    #[error("invalid service time distribution: {0}")]
    InvalidServiceTimes(String),

    #[error("simulation duration must be positive")]
    InvalidDuration,
}

/// Configuration for a simulation run.
///
/// Defaults match the reference workload; tests and the CLI override via
/// the `with_*` builders.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Service-time distribution shared by all workers.
    pub service_times: ServiceTimes,

    /// Scale up a pool when its queue's average wait exceeds this (seconds).
    pub avg_wait_time_threshold: f64,

    /// Scale down a pool when average wait falls below this (seconds).
    pub scale_down_threshold: f64,

    /// Minimum interval between scaling actions for one kind; also the
    /// autoscaler's observation window.
    pub scaling_cooldown: Duration,

    /// Period of the autoscaler's evaluation tick.
    pub scaling_check_interval: Duration,

    pub min_processors_per_type: usize,
    pub max_processors_per_type: usize,

    /// Probability that a stage-2 processor fails a leg.
    pub p2x_failure_probability: f64,

    /// A stage-2 processor idle for longer than this is replaced.
    pub idle_timeout: Duration,

    /// Deadline for one client attempt (all three legs).
    pub client_request_timeout: Duration,

    /// Retries per logical request after the first attempt.
    pub max_retries: u32,

    /// Wall-clock length of the traffic-generation phase.
    pub duration: Duration,

    /// Target request rate per client (requests/second).
    pub rate: f64,

    /// Global random seed; every entity derives its own RNG from it.
    pub seed: u64,

    /// How long shutdown waits for clients to resolve in-flight requests.
    pub drain_timeout: Duration,

    /// Reserved for socket-backed transports.
    pub tcp_port_base: u16,
    /// Reserved for socket-backed transports.
    pub buffer_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            service_times: ServiceTimes::Exponential { lambda: 1.0 },
            avg_wait_time_threshold: 5.0,
            scale_down_threshold: 1.5,
            scaling_cooldown: Duration::from_secs(10),
            scaling_check_interval: Duration::from_secs(1),
            min_processors_per_type: 1,
            max_processors_per_type: 5,
            p2x_failure_probability: 0.025,
            idle_timeout: Duration::from_secs(60),
            client_request_timeout: Duration::from_secs(15),
            max_retries: 2,
            duration: Duration::from_secs(60),
            rate: 2.0,
            seed: 325,
            drain_timeout: Duration::from_secs(17),
            tcp_port_base: 5000,
            buffer_size: 4096,
        }
    }
}

impl SimConfig {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_service_times(mut self, service_times: ServiceTimes) -> Self {
        self.service_times = service_times;
        self
    }

    pub fn with_failure_probability(mut self, p: f64) -> Self {
        self.p2x_failure_probability = p;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client_request_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_pool_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_processors_per_type = min;
        self.max_processors_per_type = max;
        self
    }

    pub fn with_scaling_thresholds(mut self, scale_up: f64, scale_down: f64) -> Self {
        self.avg_wait_time_threshold = scale_up;
        self.scale_down_threshold = scale_down;
        self
    }

    pub fn with_scaling_cooldown(mut self, cooldown: Duration) -> Self {
        self.scaling_cooldown = cooldown;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.scaling_check_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Validate the configuration; fatal errors abort startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ConfigError::InvalidRate(self.rate));
        }
        if !(0.0..=1.0).contains(&self.p2x_failure_probability) {
            return Err(ConfigError::InvalidProbability(self.p2x_failure_probability));
        }
        if self.min_processors_per_type == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.min_processors_per_type > self.max_processors_per_type {
            return Err(ConfigError::PoolBoundsInverted {
                min: self.min_processors_per_type,
                max: self.max_processors_per_type,
            });
        }
        if self.scale_down_threshold >= self.avg_wait_time_threshold {
            return Err(ConfigError::ThresholdsInverted {
                down: self.scale_down_threshold,
                up: self.avg_wait_time_threshold,
            });
        }
        if self.duration.is_zero() {
            return Err(ConfigError::InvalidDuration);
        }
        validate_service_times(&self.service_times)?;
        Ok(())
    }
}

fn validate_service_times(service_times: &ServiceTimes) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::InvalidServiceTimes(msg));
    match *service_times {
        ServiceTimes::Fixed { value } => {
            if !value.is_finite() || value <= 0.0 {
                return invalid(format!("fixed value {value} must be positive"));
            }
        }
        ServiceTimes::Uniform { low, high } => {
            if !(low.is_finite() && high.is_finite()) || low < 0.0 || low >= high {
                return invalid(format!("uniform bounds [{low}, {high}) are degenerate"));
            }
        }
        ServiceTimes::Exponential { lambda } => {
            if !lambda.is_finite() || lambda <= 0.0 {
                return invalid(format!("exponential lambda {lambda} must be positive"));
            }
        }
        ServiceTimes::Normal { mean, std_dev } => {
            if !(mean.is_finite() && std_dev.is_finite()) || mean <= 0.0 || std_dev < 0.0 {
                return invalid(format!("normal parameters ({mean}, {std_dev}) are degenerate"));
            }
        }
    }
    Ok(())
}
