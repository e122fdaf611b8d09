//! Stream types.
//!
//! A [`StreamType`] is a category of execution channel. It knows how many
//! streams of its kind the machine offers, how to build a stream's device
//! context, how to initialize and poll an instruction's completion token,
//! and how to dispatch an instruction onto one of its streams.
//!
//! Two launch policies exist:
//! - [`LaunchPolicy::Synchronous`]: the whole payload runs on the stream's
//!   worker and flips a [`NaiveStatus`] when it returns (CPU).
//! - [`LaunchPolicy::Asynchronous`]: the payload runs on the scheduler
//!   thread, queues kernels on the stream's hardware queue and an event is
//!   recorded behind them (accelerator compute, copy engines, network).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::Resource;
use crate::device::{self, HwQueue};
use crate::error::{Result, VmError};
use crate::instruction::{ComputeContext, Instruction, Launcher};
use crate::memory::DeviceAllocator;
use crate::status::{EventRecordStatus, InstructionStatus, NaiveStatus, StatusBuffer, StatusPoll};
use crate::stream::{DeviceCtx, Stream, StreamId};

/// Kind of execution channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    /// Host worker threads.
    Cpu,
    /// Accelerator compute stream.
    GpuCompute,
    /// Host-to-device copy engine.
    #[serde(rename = "gpu-copy-h2d")]
    GpuCopyH2D,
    /// Device-to-host copy engine.
    #[serde(rename = "gpu-copy-d2h")]
    GpuCopyD2H,
    /// Network transfer worker.
    Network,
}

impl StreamKind {
    /// Every stream kind, in discovery order.
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Cpu,
        StreamKind::GpuCompute,
        StreamKind::GpuCopyH2D,
        StreamKind::GpuCopyD2H,
        StreamKind::Network,
    ];

    /// Short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Cpu => "cpu",
            StreamKind::GpuCompute => "gpu-compute",
            StreamKind::GpuCopyH2D => "gpu-copy-h2d",
            StreamKind::GpuCopyD2H => "gpu-copy-d2h",
            StreamKind::Network => "network",
        }
    }

    /// Whether streams of this kind live on an accelerator device.
    pub fn is_accelerator(&self) -> bool {
        matches!(
            self,
            StreamKind::GpuCompute | StreamKind::GpuCopyH2D | StreamKind::GpuCopyD2H
        )
    }

    /// How instructions on this kind are launched.
    pub fn launch_policy(&self) -> LaunchPolicy {
        match self {
            StreamKind::Cpu => LaunchPolicy::Synchronous,
            _ => LaunchPolicy::Asynchronous,
        }
    }

    /// Streams of this kind offered by `resource`.
    pub fn stream_count(&self, resource: &Resource) -> usize {
        match self {
            StreamKind::Cpu => resource.cpu_device_num,
            StreamKind::GpuCompute | StreamKind::GpuCopyH2D | StreamKind::GpuCopyD2H => {
                resource.gpu_device_num
            }
            StreamKind::Network => resource.comm_net_worker_num,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamKind {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        StreamKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| VmError::InvalidConfig(format!("unknown stream kind '{}'", s)))
    }
}

/// How a stream type launches instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Payload runs to completion on the stream worker.
    Synchronous,
    /// Payload enqueues kernels and returns; completion via event.
    Asynchronous,
}

/// Stream type plus the number of streams it provides.
#[derive(Debug, Clone)]
pub struct StreamDesc {
    /// Stream type.
    pub stream_type: Arc<StreamType>,
    /// Number of streams (one per device id).
    pub num_streams: usize,
}

/// A category of execution stream.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamType {
    kind: StreamKind,
}

impl StreamType {
    /// Stream type for `kind`.
    pub fn new(kind: StreamKind) -> Self {
        Self { kind }
    }

    /// Kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Stream description derived from the resource, or `None` if the
    /// machine offers no streams of this kind.
    pub fn make_stream_desc(self: &Arc<Self>, resource: &Resource) -> Option<StreamDesc> {
        let num_streams = self.kind.stream_count(resource);
        if num_streams == 0 {
            return None;
        }
        Some(StreamDesc {
            stream_type: Arc::clone(self),
            num_streams,
        })
    }

    /// Build the device context (hardware queue plus allocator) of a stream.
    pub fn init_device_ctx(&self, stream: StreamId, resource: &Resource) -> Result<DeviceCtx> {
        let queue = HwQueue::spawn(stream.to_string()).map_err(|e| VmError::Hardware {
            stream,
            message: format!("failed to start hardware queue: {}", e),
        })?;
        let limit = if self.kind.is_accelerator() {
            resource.device_mem_limit_bytes()
        } else {
            resource.host_mem_limit_bytes()
        };
        Ok(DeviceCtx::new(queue, DeviceAllocator::new(stream, limit)))
    }

    /// Place a fresh completion token in the status buffer.
    pub fn init_instruction_status(&self, _stream: &Stream, status_buffer: &mut StatusBuffer) {
        let status = match self.kind.launch_policy() {
            LaunchPolicy::Synchronous => InstructionStatus::Naive(NaiveStatus::new()),
            LaunchPolicy::Asynchronous => InstructionStatus::EventRecord(EventRecordStatus::new()),
        };
        status_buffer.init(status);
    }

    /// Release the completion token.
    pub fn delete_instruction_status(&self, _stream: &Stream, status_buffer: &mut StatusBuffer) {
        status_buffer.clear();
    }

    /// Poll the completion token. Never blocks.
    pub fn query_instruction_status_done(
        &self,
        _stream: &Stream,
        status_buffer: &StatusBuffer,
    ) -> StatusPoll {
        status_buffer.poll()
    }

    /// Dispatch an instruction onto `stream`.
    ///
    /// Errors returned here are launch failures and are fatal to the VM.
    pub(crate) fn compute(&self, stream: &Stream, instruction: &mut Instruction) -> Result<()> {
        match self.kind.launch_policy() {
            LaunchPolicy::Synchronous => self.compute_on_worker(stream, instruction),
            LaunchPolicy::Asynchronous => self.launch_async(stream, instruction),
        }
    }

    fn compute_on_worker(&self, stream: &Stream, instruction: &mut Instruction) -> Result<()> {
        let stream_id = stream.id();
        let naive = match instruction.status_buffer.get() {
            Some(InstructionStatus::Naive(status)) => status.clone(),
            _ => {
                return Err(VmError::Hardware {
                    stream: stream_id,
                    message: format!("{} has no completion flag", instruction.label()),
                })
            }
        };
        let mut payload = instruction.payload.take().ok_or_else(|| VmError::Hardware {
            stream: stream_id,
            message: format!("{} dispatched twice", instruction.label()),
        })?;

        let id = instruction.id;
        let operands = instruction.operands.clone();
        let scratch = instruction.scratch.clone();

        trace!(stream = %stream_id, instruction = %id, "Queueing synchronous instruction");
        stream.device_ctx().queue().enqueue(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut ctx =
                    ComputeContext::new(stream_id, id, &operands, scratch.as_ref(), Launcher::Inline);
                payload.compute(&mut ctx)
            }));
            match outcome {
                Ok(Ok(())) => naive.set_done(),
                Ok(Err(e)) => naive.set_failed(e.to_string()),
                Err(_) => naive.set_failed(format!("instruction {} panicked", id)),
            }
            Ok(())
        }));
        Ok(())
    }

    fn launch_async(&self, stream: &Stream, instruction: &mut Instruction) -> Result<()> {
        let stream_id = stream.id();
        let queue = stream.device_ctx().queue();
        let label = instruction.label();
        device::set_device(stream.device_id());

        {
            let payload = instruction.payload.as_mut().ok_or_else(|| VmError::Hardware {
                stream: stream_id,
                message: format!("{} has no payload", label),
            })?;
            let mut ctx = ComputeContext::new(
                stream_id,
                instruction.id,
                &instruction.operands,
                instruction.scratch.as_ref(),
                Launcher::Queue(queue),
            );
            payload
                .compute(&mut ctx)
                .map_err(|e| VmError::Hardware {
                    stream: stream_id,
                    message: format!("launch of {} failed: {}", label, e),
                })?;
        }

        if let Some(message) = queue.sticky_error() {
            return Err(VmError::Hardware {
                stream: stream_id,
                message,
            });
        }

        match instruction.status_buffer.get_mut() {
            Some(InstructionStatus::EventRecord(status)) => {
                status.set_launched(queue);
                Ok(())
            }
            _ => Err(VmError::Hardware {
                stream: stream_id,
                message: format!("{} has no event status", label),
            }),
        }
    }
}

/// Registry of every stream type, built once per VM.
#[derive(Debug, Clone)]
pub struct StreamTypeRegistry {
    types: Vec<Arc<StreamType>>,
}

impl Default for StreamTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTypeRegistry {
    /// One stream type per [`StreamKind`].
    pub fn new() -> Self {
        Self {
            types: StreamKind::ALL
                .iter()
                .map(|kind| Arc::new(StreamType::new(*kind)))
                .collect(),
        }
    }

    /// Stream type for `kind`.
    pub fn get(&self, kind: StreamKind) -> Option<&Arc<StreamType>> {
        self.types.iter().find(|t| t.kind() == kind)
    }

    /// All stream types.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<StreamType>> {
        self.types.iter()
    }

    /// Stream descriptions for every type the resource provisions.
    pub fn discover(&self, resource: &Resource) -> Vec<StreamDesc> {
        self.types
            .iter()
            .filter_map(|t| t.make_stream_desc(resource))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_desc_from_resource() {
        let resource = Resource::default()
            .with_cpu_device_num(2)
            .with_gpu_device_num(3);
        let registry = StreamTypeRegistry::new();

        let cpu = registry.get(StreamKind::Cpu).unwrap();
        assert_eq!(cpu.make_stream_desc(&resource).unwrap().num_streams, 2);

        let h2d = registry.get(StreamKind::GpuCopyH2D).unwrap();
        assert_eq!(h2d.make_stream_desc(&resource).unwrap().num_streams, 3);

        let net = registry.get(StreamKind::Network).unwrap();
        assert!(net.make_stream_desc(&resource).is_none());
    }

    #[test]
    fn test_zero_gpus_means_no_gpu_streams() {
        let registry = StreamTypeRegistry::new();
        let descs = registry.discover(&Resource::default());
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].stream_type.kind(), StreamKind::Cpu);
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in StreamKind::ALL {
            assert_eq!(kind.as_str().parse::<StreamKind>().unwrap(), kind);
        }
        assert!("tpu".parse::<StreamKind>().is_err());
        assert_eq!(
            serde_json::to_string(&StreamKind::GpuCopyH2D).unwrap(),
            "\"gpu-copy-h2d\""
        );
    }

    #[test]
    fn test_launch_policy() {
        assert_eq!(StreamKind::Cpu.launch_policy(), LaunchPolicy::Synchronous);
        assert_eq!(
            StreamKind::Network.launch_policy(),
            LaunchPolicy::Asynchronous
        );
        assert!(StreamKind::GpuCopyD2H.is_accelerator());
        assert!(!StreamKind::Network.is_accelerator());
    }
}
