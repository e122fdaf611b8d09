//! VM configuration.
//!
//! A [`Resource`] describes what the machine offers (CPU workers, accelerator
//! devices, network links); each stream type derives its stream count from
//! it. [`VmConfig`] adds scheduler tuning on top.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

const MBYTE: usize = 1024 * 1024;

/// Hardware resource description used for stream discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    /// Machine id of this process.
    pub machine_id: i64,
    /// Number of CPU worker streams.
    pub cpu_device_num: usize,
    /// Number of accelerator devices.
    pub gpu_device_num: usize,
    /// Number of network transfer workers.
    pub comm_net_worker_num: usize,
    /// Per-stream device memory limit in MiB (accelerator streams).
    pub reserved_device_mem_mbyte: Option<usize>,
    /// Per-stream host memory limit in MiB (CPU and network streams).
    pub reserved_host_mem_mbyte: Option<usize>,
}

impl Default for Resource {
    fn default() -> Self {
        Self {
            machine_id: 0,
            cpu_device_num: 1,
            gpu_device_num: 0,
            comm_net_worker_num: 0,
            reserved_device_mem_mbyte: None,
            reserved_host_mem_mbyte: None,
        }
    }
}

impl Resource {
    /// Create the default resource (one CPU worker, no accelerators).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CPU worker count.
    #[must_use]
    pub fn with_cpu_device_num(mut self, count: usize) -> Self {
        self.cpu_device_num = count;
        self
    }

    /// Set the accelerator device count.
    #[must_use]
    pub fn with_gpu_device_num(mut self, count: usize) -> Self {
        self.gpu_device_num = count;
        self
    }

    /// Set the network worker count.
    #[must_use]
    pub fn with_comm_net_worker_num(mut self, count: usize) -> Self {
        self.comm_net_worker_num = count;
        self
    }

    /// Device memory limit per accelerator stream, in bytes.
    pub fn device_mem_limit_bytes(&self) -> Option<usize> {
        self.reserved_device_mem_mbyte.map(|m| m * MBYTE)
    }

    /// Host memory limit per CPU/network stream, in bytes.
    pub fn host_mem_limit_bytes(&self) -> Option<usize> {
        self.reserved_host_mem_mbyte.map(|m| m * MBYTE)
    }
}

/// Delay policy applied by the scheduler thread when a tick made no progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Yield the thread, never sleep.
    None,
    /// Fixed delay.
    Fixed(Duration),
    /// Exponential backoff (initial * multiplier^attempt), capped.
    Exponential {
        /// Initial delay.
        initial: Duration,
        /// Maximum delay.
        max: Duration,
        /// Multiplier per idle tick.
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial: Duration::from_micros(10),
            max: Duration::from_millis(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay for the given number of consecutive idle ticks (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt.min(32) as i32);
                initial.mul_f64(factor).min(*max)
            }
        }
    }
}

/// Virtual machine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Resource description used for stream discovery.
    pub resource: Resource,
    /// Maximum number of dispatched-but-not-done instructions per stream.
    pub max_in_flight_per_stream: usize,
    /// Backoff used by the scheduler thread between idle ticks.
    pub idle_backoff: BackoffStrategy,
    /// Sleep between polls in blocking waits (zero = yield only).
    pub poll_interval: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            resource: Resource::default(),
            max_in_flight_per_stream: 1,
            idle_backoff: BackoffStrategy::default(),
            poll_interval: Duration::ZERO,
        }
    }
}

impl VmConfig {
    /// CPU-only configuration with a single worker.
    #[must_use]
    pub fn cpu_only() -> Self {
        Self::default()
    }

    /// One CPU worker and one accelerator device.
    #[must_use]
    pub fn single_gpu() -> Self {
        Self {
            resource: Resource::default().with_gpu_device_num(1),
            ..Self::default()
        }
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight_per_stream == 0 {
            return Err(VmError::InvalidConfig(
                "max_in_flight_per_stream must be at least 1".to_string(),
            ));
        }
        if let BackoffStrategy::Exponential { multiplier, .. } = self.idle_backoff {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(VmError::InvalidConfig(format!(
                    "backoff multiplier must be >= 1.0, got {}",
                    multiplier
                )));
            }
        }
        if self.resource.reserved_device_mem_mbyte == Some(0)
            || self.resource.reserved_host_mem_mbyte == Some(0)
        {
            return Err(VmError::InvalidConfig(
                "reserved memory must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`VmConfig`].
#[derive(Debug, Default)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    #[must_use]
    pub fn from_config(config: VmConfig) -> Self {
        Self { config }
    }

    /// Replace the resource description.
    #[must_use]
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.config.resource = resource;
        self
    }

    /// Set the CPU worker count.
    #[must_use]
    pub fn with_cpu_devices(mut self, count: usize) -> Self {
        self.config.resource.cpu_device_num = count;
        self
    }

    /// Set the accelerator device count.
    #[must_use]
    pub fn with_gpu_devices(mut self, count: usize) -> Self {
        self.config.resource.gpu_device_num = count;
        self
    }

    /// Set the network worker count.
    #[must_use]
    pub fn with_net_workers(mut self, count: usize) -> Self {
        self.config.resource.comm_net_worker_num = count;
        self
    }

    /// Set the per-stream device memory limit in MiB.
    #[must_use]
    pub fn with_device_mem_mbyte(mut self, mbyte: usize) -> Self {
        self.config.resource.reserved_device_mem_mbyte = Some(mbyte);
        self
    }

    /// Set the per-stream host memory limit in MiB.
    #[must_use]
    pub fn with_host_mem_mbyte(mut self, mbyte: usize) -> Self {
        self.config.resource.reserved_host_mem_mbyte = Some(mbyte);
        self
    }

    /// Set the per-stream in-flight bound.
    #[must_use]
    pub fn with_max_in_flight(mut self, count: usize) -> Self {
        self.config.max_in_flight_per_stream = count;
        self
    }

    /// Set the idle backoff strategy.
    #[must_use]
    pub fn with_idle_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.config.idle_backoff = backoff;
        self
    }

    /// Set the poll interval for blocking waits.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<VmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
