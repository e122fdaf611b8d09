//! Streams: concrete execution channels.
//!
//! A stream is identified by its kind and device id. It owns a device
//! context (hardware queue plus allocator) and the scheduler's per-stream
//! bookkeeping: a FIFO of instructions awaiting dispatch and the list of
//! dispatched instructions whose completion has not been observed.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Resource;
use crate::device::HwQueue;
use crate::error::Result;
use crate::instruction::InstructionId;
use crate::memory::DeviceAllocator;
use crate::metrics::StreamMetrics;
use crate::stream_type::{StreamDesc, StreamKind, StreamType};

/// Stream identifier: kind plus device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    /// Stream kind.
    pub kind: StreamKind,
    /// Device (or worker) index within the kind.
    pub device_id: usize,
}

impl StreamId {
    /// Create a stream id.
    pub const fn new(kind: StreamKind, device_id: usize) -> Self {
        Self { kind, device_id }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.device_id)
    }
}

/// Per-stream hardware handles.
pub struct DeviceCtx {
    queue: HwQueue,
    allocator: Arc<DeviceAllocator>,
}

impl DeviceCtx {
    pub(crate) fn new(queue: HwQueue, allocator: Arc<DeviceAllocator>) -> Self {
        Self { queue, allocator }
    }

    /// Hardware queue.
    pub fn queue(&self) -> &HwQueue {
        &self.queue
    }

    /// Stream allocator.
    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }
}

impl std::fmt::Debug for DeviceCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCtx")
            .field("queue", &self.queue.name())
            .field("allocator", &self.allocator)
            .finish()
    }
}

/// One execution channel.
pub struct Stream {
    id: StreamId,
    stream_type: Arc<StreamType>,
    device_ctx: DeviceCtx,
    /// Instructions targeting this stream, in submission order, not yet
    /// dispatched.
    pub(crate) waiting: VecDeque<InstructionId>,
    /// Dispatched instructions whose completion has not been observed.
    pub(crate) in_flight: Vec<InstructionId>,
    pub(crate) metrics: StreamMetrics,
}

impl Stream {
    pub(crate) fn new(
        stream_type: Arc<StreamType>,
        device_id: usize,
        resource: &Resource,
    ) -> Result<Self> {
        let id = StreamId::new(stream_type.kind(), device_id);
        let device_ctx = stream_type.init_device_ctx(id, resource)?;
        Ok(Self {
            id,
            stream_type,
            device_ctx,
            waiting: VecDeque::new(),
            in_flight: Vec::new(),
            metrics: StreamMetrics::default(),
        })
    }

    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream kind.
    pub fn kind(&self) -> StreamKind {
        self.id.kind
    }

    /// Device id.
    pub fn device_id(&self) -> usize {
        self.id.device_id
    }

    /// Stream type.
    pub fn stream_type(&self) -> &Arc<StreamType> {
        &self.stream_type
    }

    /// Device context.
    pub fn device_ctx(&self) -> &DeviceCtx {
        &self.device_ctx
    }

    /// Instructions awaiting dispatch.
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Dispatched, not yet done.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether nothing is queued or running here.
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.in_flight.is_empty()
    }

    /// Counters.
    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("waiting", &self.waiting.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Runtime form of a [`StreamDesc`]: the instantiated streams.
#[derive(Debug)]
pub struct StreamRtDesc {
    desc: StreamDesc,
    streams: Vec<Stream>,
}

impl StreamRtDesc {
    /// Instantiate one stream per device id.
    pub fn new(desc: StreamDesc, resource: &Resource) -> Result<Self> {
        let streams = (0..desc.num_streams)
            .map(|device_id| Stream::new(Arc::clone(&desc.stream_type), device_id, resource))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            kind = %desc.stream_type.kind(),
            count = streams.len(),
            "Instantiated streams"
        );
        Ok(Self { desc, streams })
    }

    /// Source description.
    pub fn desc(&self) -> &StreamDesc {
        &self.desc
    }

    /// Stream kind.
    pub fn kind(&self) -> StreamKind {
        self.desc.stream_type.kind()
    }

    /// Stream by device id.
    pub fn stream(&self, device_id: usize) -> Option<&Stream> {
        self.streams.get(device_id)
    }

    pub(crate) fn stream_mut(&mut self, device_id: usize) -> Option<&mut Stream> {
        self.streams.get_mut(device_id)
    }

    /// All streams.
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub(crate) fn streams_mut(&mut self) -> &mut [Stream] {
        &mut self.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_type::StreamTypeRegistry;

    #[test]
    fn test_display() {
        assert_eq!(StreamId::new(StreamKind::Cpu, 0).to_string(), "cpu:0");
        assert_eq!(
            StreamId::new(StreamKind::GpuCompute, 3).to_string(),
            "gpu-compute:3"
        );
    }

    #[test]
    fn test_rt_desc_instantiates_streams() {
        let resource = Resource::default().with_gpu_device_num(2);
        let registry = StreamTypeRegistry::new();
        let desc = registry
            .get(StreamKind::GpuCompute)
            .unwrap()
            .make_stream_desc(&resource)
            .unwrap();

        let rt = StreamRtDesc::new(desc, &resource).unwrap();
        assert_eq!(rt.kind(), StreamKind::GpuCompute);
        assert_eq!(rt.streams().len(), 2);
        assert_eq!(rt.stream(1).unwrap().id(), StreamId::new(StreamKind::GpuCompute, 1));
        assert!(rt.stream(2).is_none());
        assert!(rt.stream(0).unwrap().is_idle());
        assert_eq!(rt.stream(0).unwrap().device_ctx().queue().name(), "gpu-compute:0");
    }
}
