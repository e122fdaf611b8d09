//! Instructions: the unit of work scheduled by the VM.
//!
//! Callers build an [`InstructionMsg`] (target stream selector, operand list,
//! opaque payload) and submit it. The scheduler turns it into an
//! [`Instruction`] that moves through [`InstructionState`] and hands back an
//! [`InstructionHandle`] for completion queries.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::device::HwQueue;
use crate::error::{Result, VmError};
use crate::status::StatusBuffer;
use crate::stream::StreamId;
use crate::stream_type::StreamKind;

/// Instruction identifier, unique within one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(u64);

impl InstructionId {
    /// Create from a raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstructionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How an instruction accesses an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read; may overlap with other readers.
    Shared,
    /// Write; ordered after every earlier access.
    Exclusive,
}

/// One operand of an instruction.
#[derive(Debug, Clone)]
pub struct Operand {
    buffer: Buffer,
    mode: AccessMode,
}

impl Operand {
    /// Shared (read) access.
    pub fn read(buffer: &Buffer) -> Self {
        Self {
            buffer: buffer.clone(),
            mode: AccessMode::Shared,
        }
    }

    /// Exclusive (write) access.
    pub fn write(buffer: &Buffer) -> Self {
        Self {
            buffer: buffer.clone(),
            mode: AccessMode::Exclusive,
        }
    }

    /// Operand buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Access mode.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Whether this operand is written.
    pub fn is_exclusive(&self) -> bool {
        self.mode == AccessMode::Exclusive
    }
}

/// Lifecycle state of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InstructionState {
    /// Enqueued, dependencies not yet satisfied.
    Pending = 0,
    /// Dependencies satisfied, waiting for its stream.
    Ready = 1,
    /// Handed to the stream type; possibly still running.
    Dispatched = 2,
    /// Completion observed.
    Done = 3,
    /// Resources released.
    Retired = 4,
}

impl InstructionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => InstructionState::Pending,
            1 => InstructionState::Ready,
            2 => InstructionState::Dispatched,
            3 => InstructionState::Done,
            _ => InstructionState::Retired,
        }
    }

    /// Whether the instruction has completed.
    pub fn is_done(&self) -> bool {
        matches!(self, InstructionState::Done | InstructionState::Retired)
    }
}

impl std::fmt::Display for InstructionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstructionState::Pending => "pending",
            InstructionState::Ready => "ready",
            InstructionState::Dispatched => "dispatched",
            InstructionState::Done => "done",
            InstructionState::Retired => "retired",
        };
        f.write_str(name)
    }
}

/// State shared between the scheduler and handles. Only moves forward.
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn get(&self) -> InstructionState {
        InstructionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn advance(&self, state: InstructionState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// Caller-side handle to a submitted instruction.
#[derive(Debug, Clone)]
pub struct InstructionHandle {
    id: InstructionId,
    vm_id: u64,
    op_name: Arc<str>,
    state: Arc<StateCell>,
}

impl InstructionHandle {
    /// Instruction id.
    pub fn id(&self) -> InstructionId {
        self.id
    }

    /// Debug name of the instruction's payload.
    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    /// Current state.
    pub fn state(&self) -> InstructionState {
        self.state.get()
    }

    /// Whether the instruction completed. Never reverts to false.
    pub fn is_done(&self) -> bool {
        self.state.get().is_done()
    }

    pub(crate) fn vm_id(&self) -> u64 {
        self.vm_id
    }
}

/// Work carried by an instruction.
pub trait InstructionPayload: Send + 'static {
    /// Debug name of the operation.
    fn name(&self) -> &str;

    /// Scratch bytes needed while computing. Allocated right before
    /// dispatch and freed as soon as completion is observed.
    fn temp_storage_bytes(&self) -> usize {
        0
    }

    /// Run (or launch) the work.
    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<()>;
}

/// Payload built from a closure.
pub struct FnPayload<F> {
    name: String,
    temp_storage_bytes: usize,
    f: F,
}

impl<F> FnPayload<F>
where
    F: FnMut(&mut ComputeContext<'_>) -> Result<()> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            temp_storage_bytes: 0,
            f,
        }
    }

    /// Request scratch storage.
    #[must_use]
    pub fn with_temp_storage(mut self, bytes: usize) -> Self {
        self.temp_storage_bytes = bytes;
        self
    }
}

impl<F> InstructionPayload for FnPayload<F>
where
    F: FnMut(&mut ComputeContext<'_>) -> Result<()> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn temp_storage_bytes(&self) -> usize {
        self.temp_storage_bytes
    }

    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<()> {
        (self.f)(ctx)
    }
}

/// Where launched kernels go.
pub(crate) enum Launcher<'a> {
    /// Run immediately on the current thread.
    Inline,
    /// Enqueue on the stream's hardware queue.
    Queue(&'a HwQueue),
}

/// View handed to a payload while it computes.
pub struct ComputeContext<'a> {
    stream: StreamId,
    instruction: InstructionId,
    operands: &'a [Operand],
    scratch: Option<&'a Buffer>,
    launcher: Launcher<'a>,
}

impl<'a> ComputeContext<'a> {
    pub(crate) fn new(
        stream: StreamId,
        instruction: InstructionId,
        operands: &'a [Operand],
        scratch: Option<&'a Buffer>,
        launcher: Launcher<'a>,
    ) -> Self {
        Self {
            stream,
            instruction,
            operands,
            scratch,
            launcher,
        }
    }

    /// Stream the instruction runs on.
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// Device id of that stream.
    pub fn device_id(&self) -> usize {
        self.stream.device_id
    }

    /// Instruction being computed.
    pub fn instruction_id(&self) -> InstructionId {
        self.instruction
    }

    /// Operands in declaration order.
    pub fn operands(&self) -> &[Operand] {
        self.operands
    }

    /// Operand buffer by position.
    pub fn buffer(&self, index: usize) -> Result<&Buffer> {
        self.operands
            .get(index)
            .map(|op| op.buffer())
            .ok_or_else(|| {
                VmError::kernel(format!(
                    "instruction {} has no operand {}",
                    self.instruction, index
                ))
            })
    }

    /// Scratch buffer, if the payload requested one.
    pub fn scratch(&self) -> Option<&Buffer> {
        self.scratch
    }

    /// Whether launched kernels complete asynchronously.
    pub fn is_async(&self) -> bool {
        matches!(self.launcher, Launcher::Queue(_))
    }

    /// Launch a kernel on this instruction's stream.
    ///
    /// On asynchronous streams the kernel is queued and this returns at
    /// once; on synchronous streams it runs before returning.
    pub fn launch<K>(&mut self, kernel: K) -> Result<()>
    where
        K: FnOnce() -> Result<()> + Send + 'static,
    {
        match self.launcher {
            Launcher::Inline => kernel(),
            Launcher::Queue(queue) => {
                queue.enqueue(Box::new(kernel));
                Ok(())
            }
        }
    }
}

/// Selects the stream an instruction runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamSelector {
    /// Stream kind.
    pub kind: StreamKind,
    /// Device (or worker) index within that kind.
    pub device_id: usize,
}

impl StreamSelector {
    /// Select an arbitrary stream.
    pub const fn new(kind: StreamKind, device_id: usize) -> Self {
        Self { kind, device_id }
    }

    /// CPU worker `id`.
    pub const fn cpu(id: usize) -> Self {
        Self::new(StreamKind::Cpu, id)
    }

    /// Compute stream of accelerator `id`.
    pub const fn gpu(id: usize) -> Self {
        Self::new(StreamKind::GpuCompute, id)
    }

    /// Host-to-device copy stream of accelerator `id`.
    pub const fn copy_h2d(id: usize) -> Self {
        Self::new(StreamKind::GpuCopyH2D, id)
    }

    /// Device-to-host copy stream of accelerator `id`.
    pub const fn copy_d2h(id: usize) -> Self {
        Self::new(StreamKind::GpuCopyD2H, id)
    }

    /// Network worker `id`.
    pub const fn net(id: usize) -> Self {
        Self::new(StreamKind::Network, id)
    }
}

/// A request to run one instruction.
pub struct InstructionMsg {
    selector: StreamSelector,
    operands: Vec<Operand>,
    payload: Box<dyn InstructionPayload>,
    after: Vec<InstructionHandle>,
}

impl InstructionMsg {
    /// New message for `selector` running `payload`.
    pub fn new(selector: StreamSelector, payload: impl InstructionPayload) -> Self {
        Self {
            selector,
            operands: Vec::new(),
            payload: Box::new(payload),
            after: Vec::new(),
        }
    }

    /// New message running a closure.
    pub fn from_fn<F>(selector: StreamSelector, name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&mut ComputeContext<'_>) -> Result<()> + Send + 'static,
    {
        Self::new(selector, FnPayload::new(name, f))
    }

    /// Add a shared (read) operand.
    #[must_use]
    pub fn read(mut self, buffer: &Buffer) -> Self {
        self.operands.push(Operand::read(buffer));
        self
    }

    /// Add an exclusive (write) operand.
    #[must_use]
    pub fn write(mut self, buffer: &Buffer) -> Self {
        self.operands.push(Operand::write(buffer));
        self
    }

    /// Add an operand.
    #[must_use]
    pub fn operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    /// Order after another instruction's completion.
    #[must_use]
    pub fn after(mut self, handle: &InstructionHandle) -> Self {
        self.after.push(handle.clone());
        self
    }

    /// Target selector.
    pub fn selector(&self) -> StreamSelector {
        self.selector
    }

    /// Declared operands.
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Payload debug name.
    pub fn op_name(&self) -> &str {
        self.payload.name()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        StreamSelector,
        Vec<Operand>,
        Box<dyn InstructionPayload>,
        Vec<InstructionHandle>,
    ) {
        (self.selector, self.operands, self.payload, self.after)
    }
}

impl std::fmt::Debug for InstructionMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionMsg")
            .field("selector", &self.selector)
            .field("op", &self.payload.name())
            .field("operands", &self.operands.len())
            .field("after", &self.after.len())
            .finish()
    }
}

/// Snapshot of a live instruction.
#[derive(Debug, Clone)]
pub struct InstructionInfo {
    /// Instruction id.
    pub id: InstructionId,
    /// Payload debug name.
    pub op_name: String,
    /// Target stream.
    pub stream: StreamId,
    /// Current state.
    pub state: InstructionState,
    /// Operand buffer names with access modes.
    pub operands: Vec<(String, AccessMode)>,
    /// Unfinished instructions this one waits for.
    pub pending_deps: usize,
}

/// Scheduler-side instruction record.
pub(crate) struct Instruction {
    pub(crate) id: InstructionId,
    pub(crate) stream: StreamId,
    pub(crate) op_name: Arc<str>,
    pub(crate) operands: Vec<Operand>,
    pub(crate) payload: Option<Box<dyn InstructionPayload>>,
    pub(crate) temp_storage_bytes: usize,
    pub(crate) status_buffer: StatusBuffer,
    pub(crate) scratch: Option<Buffer>,
    pub(crate) state: Arc<StateCell>,
    /// Producers not yet done.
    pub(crate) pending_deps: usize,
    /// Instructions this one depends on.
    pub(crate) producers: Vec<InstructionId>,
    /// Instructions depending on this one.
    pub(crate) consumers: Vec<InstructionId>,
    /// Consumers that have not reached `Dispatched`.
    pub(crate) undispatched_consumers: usize,
    pub(crate) enqueued_at: Instant,
    pub(crate) dispatched_at: Option<Instant>,
}

impl Instruction {
    pub(crate) fn new(
        id: InstructionId,
        stream: StreamId,
        operands: Vec<Operand>,
        payload: Box<dyn InstructionPayload>,
    ) -> Self {
        let op_name: Arc<str> = Arc::from(payload.name());
        let temp_storage_bytes = payload.temp_storage_bytes();
        Self {
            id,
            stream,
            op_name,
            operands,
            payload: Some(payload),
            temp_storage_bytes,
            status_buffer: StatusBuffer::new(),
            scratch: None,
            state: Arc::new(StateCell::default()),
            pending_deps: 0,
            producers: Vec::new(),
            consumers: Vec::new(),
            undispatched_consumers: 0,
            enqueued_at: Instant::now(),
            dispatched_at: None,
        }
    }

    pub(crate) fn state(&self) -> InstructionState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: InstructionState) {
        self.state.advance(state);
    }

    pub(crate) fn handle(&self, vm_id: u64) -> InstructionHandle {
        InstructionHandle {
            id: self.id,
            vm_id,
            op_name: Arc::clone(&self.op_name),
            state: Arc::clone(&self.state),
        }
    }

    /// Name used in error messages: id plus op name.
    pub(crate) fn label(&self) -> String {
        format!("{} ({})", self.id, self.op_name)
    }

    pub(crate) fn info(&self) -> InstructionInfo {
        InstructionInfo {
            id: self.id,
            op_name: self.op_name.to_string(),
            stream: self.stream,
            state: self.state(),
            operands: self
                .operands
                .iter()
                .map(|op| (op.buffer().name().to_string(), op.mode()))
                .collect(),
            pending_deps: self.pending_deps,
        }
    }
}
