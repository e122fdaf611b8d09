//! # StreamVM
//!
//! An instruction virtual machine for heterogeneous execution streams.
//!
//! Callers submit instructions (a target stream, operand buffers with
//! shared/exclusive access, an opaque payload). The VM orders them by
//! operand dependencies, dispatches them onto CPU, accelerator compute,
//! copy-engine and network streams without blocking, polls their
//! completion tokens and retires them once their consumers were dispatched.
//! Pipelines of actors drive the VM stage by stage under register
//! backpressure.
//!
//! ## Quick Start
//!
//! ```ignore
//! use streamvm::prelude::*;
//!
//! let runner = StreamVm::builder().gpu_devices(1).spawn()?;
//!
//! let staged = Buffer::from_bytes("staged", 7u64.to_le_bytes().to_vec());
//! let device = Buffer::new("device", 8);
//! let copy = runner.enqueue(
//!     InstructionMsg::from_fn(StreamSelector::copy_h2d(0), "h2d", |ctx| {
//!         let (src, dst) = (ctx.buffer(0)?.clone(), ctx.buffer(1)?.clone());
//!         ctx.launch(move || dst.write_u64(src.read_u64()?))
//!     })
//!     .read(&staged)
//!     .write(&device),
//! )?;
//! runner.block_until_done(&copy)?;
//! runner.shutdown()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌──────────────────────────────────────┐
//! │ caller/actor │──────────▶│ VirtualMachine                        │
//! └──────────────┘            │  access lists ─▶ Pending/Ready       │
//!        ▲ is_done            │  per-stream FIFO ─▶ Dispatched       │
//!        │                    │  poll status ─▶ Done ─▶ Retired      │
//!        │                    └───────┬───────────┬──────────┬───────┘
//!        │                            ▼           ▼          ▼
//!        │                       cpu:0 queue  gpu-compute:0  gpu-copy-h2d:0 ...
//!        └──── handle state ◀──── events / completion flags
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

mod runner;

pub use runner::VmRunner;
pub use streamvm_core::*;

use std::time::Duration;

use streamvm_core::config::{BackoffStrategy, VmConfig, VmConfigBuilder};
use streamvm_core::error::Result;
use streamvm_core::scheduler::VirtualMachine;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{StreamVm, StreamVmBuilder, VmRunner};
    pub use streamvm_core::prelude::*;
}

/// Entry point for building a VM.
pub struct StreamVm;

impl StreamVm {
    /// Create a builder.
    pub fn builder() -> StreamVmBuilder {
        StreamVmBuilder::new()
    }
}

/// Builder for a [`VirtualMachine`] or a [`VmRunner`].
#[derive(Debug, Default)]
pub struct StreamVmBuilder {
    inner: VmConfigBuilder,
}

impl StreamVmBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: VmConfig) -> Self {
        self.inner = VmConfigBuilder::from_config(config);
        self
    }

    /// Set the CPU worker count.
    pub fn cpu_devices(mut self, count: usize) -> Self {
        self.inner = self.inner.with_cpu_devices(count);
        self
    }

    /// Set the accelerator device count.
    pub fn gpu_devices(mut self, count: usize) -> Self {
        self.inner = self.inner.with_gpu_devices(count);
        self
    }

    /// Set the network worker count.
    pub fn net_workers(mut self, count: usize) -> Self {
        self.inner = self.inner.with_net_workers(count);
        self
    }

    /// Set the per-stream in-flight bound.
    pub fn max_in_flight(mut self, count: usize) -> Self {
        self.inner = self.inner.with_max_in_flight(count);
        self
    }

    /// Set the per-stream device memory limit in MiB.
    pub fn device_mem_mbyte(mut self, mbyte: usize) -> Self {
        self.inner = self.inner.with_device_mem_mbyte(mbyte);
        self
    }

    /// Set the per-stream host memory limit in MiB.
    pub fn host_mem_mbyte(mut self, mbyte: usize) -> Self {
        self.inner = self.inner.with_host_mem_mbyte(mbyte);
        self
    }

    /// Set the scheduler thread's idle backoff.
    pub fn idle_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.inner = self.inner.with_idle_backoff(backoff);
        self
    }

    /// Set the poll interval of blocking waits.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.inner = self.inner.with_poll_interval(interval);
        self
    }

    /// Build a VM driven by the caller.
    pub fn build(self) -> Result<VirtualMachine> {
        VirtualMachine::new(self.inner.build()?)
    }

    /// Build a VM and start its scheduler thread.
    pub fn spawn(self) -> Result<VmRunner> {
        VmRunner::spawn(self.build()?)
    }
}
