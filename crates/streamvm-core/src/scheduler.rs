//! The instruction virtual machine.
//!
//! [`VirtualMachine`] owns every stream and every live instruction.
//! Submission ([`VirtualMachine::enqueue`]) validates the request, records
//! operand dependencies and returns at once. [`VirtualMachine::tick`] does
//! one bounded pass:
//!
//! 1. poll every dispatched instruction's completion token; completions
//!    free scratch storage and promote dependents whose last dependency
//!    just finished,
//! 2. dispatch Ready instructions at the head of each stream's FIFO while
//!    the stream has in-flight capacity,
//! 3. retire Done instructions once all their consumers were dispatched,
//!    releasing status tokens and deferred buffer bodies.
//!
//! Dependencies come from per-buffer access lists: an exclusive access
//! waits for the previous writer and every reader since; a shared access
//! waits for the previous writer only.
//!
//! A hardware failure (launch error, failed completion, allocator
//! exhaustion) poisons the VM: the failing call returns the error, nothing
//! is dispatched afterwards and every later call returns
//! [`VmError::Terminated`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::buffer::{Buffer, BufferId};
use crate::config::VmConfig;
use crate::error::{Result, VmError};
use crate::instruction::{
    Instruction, InstructionHandle, InstructionId, InstructionInfo, InstructionMsg,
    InstructionState, Operand, StreamSelector,
};
use crate::metrics::{StreamSnapshot, VmMetrics};
use crate::status::StatusPoll;
use crate::stream::{Stream, StreamId, StreamRtDesc};
use crate::stream_type::{StreamKind, StreamTypeRegistry};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Work done by one [`VirtualMachine::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Completions observed.
    pub completed: usize,
    /// Instructions dispatched.
    pub dispatched: usize,
    /// Instructions retired.
    pub retired: usize,
}

impl TickReport {
    /// Whether the tick changed any instruction's state.
    pub fn made_progress(&self) -> bool {
        self.completed + self.dispatched + self.retired > 0
    }
}

/// Accessors of one buffer among live instructions.
#[derive(Debug, Default)]
struct AccessList {
    last_writer: Option<InstructionId>,
    readers: Vec<InstructionId>,
    /// Live instructions naming the buffer.
    live: usize,
}

/// The instruction scheduler.
pub struct VirtualMachine {
    id: u64,
    config: VmConfig,
    registry: StreamTypeRegistry,
    stream_rt_descs: Vec<StreamRtDesc>,
    instructions: HashMap<InstructionId, Instruction>,
    next_instruction: u64,
    /// Done, not yet retired, in completion order.
    done: VecDeque<InstructionId>,
    access_lists: HashMap<BufferId, AccessList>,
    pending_release: HashMap<BufferId, Buffer>,
    fatal: Option<VmError>,
    shutting_down: bool,
    enqueued: u64,
    dispatched: u64,
    completed: u64,
    retired: u64,
    ticks: u64,
    idle_ticks: u64,
}

impl VirtualMachine {
    /// Build the VM: discover stream types from the resource description and
    /// instantiate their streams.
    pub fn new(config: VmConfig) -> Result<Self> {
        config.validate()?;
        let registry = StreamTypeRegistry::new();
        let stream_rt_descs = registry
            .discover(&config.resource)
            .into_iter()
            .map(|desc| StreamRtDesc::new(desc, &config.resource))
            .collect::<Result<Vec<_>>>()?;

        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);
        let total: usize = stream_rt_descs.iter().map(|rt| rt.streams().len()).sum();
        info!(
            vm = id,
            streams = total,
            cpu = config.resource.cpu_device_num,
            gpu = config.resource.gpu_device_num,
            net = config.resource.comm_net_worker_num,
            max_in_flight = config.max_in_flight_per_stream,
            "Virtual machine started"
        );

        Ok(Self {
            id,
            config,
            registry,
            stream_rt_descs,
            instructions: HashMap::new(),
            next_instruction: 1,
            done: VecDeque::new(),
            access_lists: HashMap::new(),
            pending_release: HashMap::new(),
            fatal: None,
            shutting_down: false,
            enqueued: 0,
            dispatched: 0,
            completed: 0,
            retired: 0,
            ticks: 0,
            idle_ticks: 0,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Stream type registry.
    pub fn registry(&self) -> &StreamTypeRegistry {
        &self.registry
    }

    /// Stream groups, one per provisioned stream type.
    pub fn stream_rt_descs(&self) -> &[StreamRtDesc] {
        &self.stream_rt_descs
    }

    /// Every stream.
    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.stream_rt_descs.iter().flat_map(|rt| rt.streams())
    }

    /// Stream by id.
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        find_stream(&self.stream_rt_descs, id)
    }

    /// Number of streams of `kind`.
    pub fn stream_count(&self, kind: StreamKind) -> usize {
        self.stream_rt_descs
            .iter()
            .find(|rt| rt.kind() == kind)
            .map_or(0, |rt| rt.streams().len())
    }

    /// Submit an instruction. Never blocks on completion.
    pub fn enqueue(&mut self, msg: InstructionMsg) -> Result<InstructionHandle> {
        self.check_accepting()?;

        let (selector, operands, payload, after) = msg.into_parts();
        let stream_id = self.resolve(selector, payload.name())?;
        let operands = self.validate_operands(payload.name(), operands)?;
        if let Some(foreign) = after.iter().find(|h| h.vm_id() != self.id) {
            return Err(VmError::ForeignHandle(foreign.id()));
        }

        let id = InstructionId::new(self.next_instruction);
        self.next_instruction += 1;
        let mut instruction = Instruction::new(id, stream_id, operands, payload);

        let mut producers = Vec::new();
        for operand in &instruction.operands {
            let list = self.access_lists.entry(operand.buffer().id()).or_default();
            list.live += 1;
            producers.extend(list.last_writer);
            if operand.is_exclusive() {
                producers.append(&mut list.readers);
                list.last_writer = Some(id);
            } else {
                list.readers.push(id);
            }
        }
        producers.extend(after.iter().map(|h| h.id()));
        producers.sort_unstable();
        producers.dedup();
        producers.retain(|p| {
            self.instructions
                .get(p)
                .map_or(false, |producer| !producer.state().is_done())
        });

        for producer in &producers {
            if let Some(producer) = self.instructions.get_mut(producer) {
                producer.consumers.push(id);
                producer.undispatched_consumers += 1;
            }
        }
        instruction.pending_deps = producers.len();
        instruction.producers = producers;
        if instruction.pending_deps == 0 {
            instruction.set_state(InstructionState::Ready);
        }

        let handle = instruction.handle(self.id);
        debug!(
            instruction = %id,
            op = %instruction.op_name,
            stream = %stream_id,
            deps = instruction.pending_deps,
            "Enqueued instruction"
        );

        match find_stream_mut(&mut self.stream_rt_descs, stream_id) {
            Some(stream) => stream.waiting.push_back(id),
            None => {
                return Err(VmError::InvalidStreamSelector {
                    instruction: instruction.op_name.to_string(),
                    kind: stream_id.kind,
                    device_id: stream_id.device_id,
                    available: 0,
                })
            }
        }
        self.instructions.insert(id, instruction);
        self.enqueued += 1;
        Ok(handle)
    }

    /// One scheduling pass. Returns what changed.
    pub fn tick(&mut self) -> Result<TickReport> {
        self.check_alive()?;
        self.ticks += 1;

        let mut report = TickReport::default();
        if let Err(err) = self.poll_in_flight(&mut report) {
            return Err(self.poison(err));
        }
        if let Err(err) = self.dispatch_ready(&mut report) {
            return Err(self.poison(err));
        }
        if let Err(err) = self.retire_done(&mut report) {
            return Err(self.poison(err));
        }

        if !report.made_progress() {
            self.idle_ticks += 1;
        }
        Ok(report)
    }

    /// Whether the instruction completed.
    pub fn is_done(&self, handle: &InstructionHandle) -> bool {
        handle.is_done()
    }

    /// Drive the VM until `handle` is done.
    ///
    /// Polls and yields between ticks; never blocks on hardware.
    pub fn run_until_done(&mut self, handle: &InstructionHandle) -> Result<()> {
        if handle.vm_id() != self.id {
            return Err(VmError::ForeignHandle(handle.id()));
        }
        while !handle.is_done() {
            let report = self.tick()?;
            if !report.made_progress() {
                self.pause();
            }
        }
        Ok(())
    }

    /// Drive the VM until every instruction has retired.
    pub fn run_until_idle(&mut self) -> Result<()> {
        while !self.is_idle() {
            let report = self.tick()?;
            if !report.made_progress() {
                self.pause();
            }
        }
        Ok(())
    }

    /// Whether no instruction is live.
    pub fn is_idle(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instructions enqueued but not yet retired.
    pub fn live_instructions(&self) -> usize {
        self.instructions.len()
    }

    /// Snapshot of a live instruction.
    pub fn instruction_info(&self, handle: &InstructionHandle) -> Result<InstructionInfo> {
        if handle.vm_id() != self.id {
            return Err(VmError::ForeignHandle(handle.id()));
        }
        self.instructions
            .get(&handle.id())
            .map(|instruction| instruction.info())
            .ok_or(VmError::StaleHandle(handle.id()))
    }

    /// Release a buffer's body once every instruction using it retired.
    ///
    /// Instructions submitted afterwards may not name the buffer. The released
    /// mark is stored on the buffer.
    pub fn release_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.check_alive()?;
        if !buffer.mark_released() {
            return Ok(());
        }
        let in_use = self
            .access_lists
            .get(&buffer.id())
            .map_or(false, |list| list.live > 0);
        if in_use {
            debug!(buffer = %buffer.name(), "Deferred buffer release");
            self.pending_release.insert(buffer.id(), buffer.clone());
        } else {
            self.access_lists.remove(&buffer.id());
            if buffer.release_body() {
                debug!(buffer = %buffer.name(), "Released buffer");
            }
        }
        Ok(())
    }

    /// Refuse further submissions without draining.
    pub fn request_shutdown(&mut self) {
        if !self.shutting_down {
            info!(
                vm = self.id,
                live = self.instructions.len(),
                "Shutting down virtual machine"
            );
        }
        self.shutting_down = true;
    }

    /// Stop accepting work and drain every instruction to retirement.
    pub fn shutdown(&mut self) -> Result<()> {
        self.request_shutdown();
        self.run_until_idle()?;
        for buffer in std::mem::take(&mut self.pending_release).into_values() {
            buffer.release_body();
        }
        info!(vm = self.id, retired = self.retired, "Virtual machine drained");
        Ok(())
    }

    /// Whether shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Fatal error that terminated the VM, if any.
    pub fn fatal_error(&self) -> Option<&VmError> {
        self.fatal.as_ref()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> VmMetrics {
        VmMetrics {
            enqueued: self.enqueued,
            dispatched: self.dispatched,
            completed: self.completed,
            retired: self.retired,
            ticks: self.ticks,
            idle_ticks: self.idle_ticks,
            live_instructions: self.instructions.len(),
            streams: self
                .streams()
                .map(|stream| StreamSnapshot {
                    stream: stream.id(),
                    metrics: stream.metrics().clone(),
                    queue: stream.device_ctx().queue().stats(),
                    memory: stream.device_ctx().allocator().stats(),
                    waiting: stream.waiting_len(),
                    in_flight: stream.in_flight_len(),
                })
                .collect(),
        }
    }

    fn check_alive(&self) -> Result<()> {
        match &self.fatal {
            Some(err) => Err(VmError::Terminated(Box::new(err.clone()))),
            None => Ok(()),
        }
    }

    fn check_accepting(&self) -> Result<()> {
        self.check_alive()?;
        if self.shutting_down {
            return Err(VmError::ShutDown);
        }
        Ok(())
    }

    fn resolve(&self, selector: StreamSelector, op_name: &str) -> Result<StreamId> {
        let available = self.stream_count(selector.kind);
        if selector.device_id >= available {
            return Err(VmError::InvalidStreamSelector {
                instruction: op_name.to_string(),
                kind: selector.kind,
                device_id: selector.device_id,
                available,
            });
        }
        Ok(StreamId::new(selector.kind, selector.device_id))
    }

    /// Reject released buffers and conflicting duplicates; fold duplicate
    /// shared reads into one operand.
    fn validate_operands(&self, op_name: &str, operands: Vec<Operand>) -> Result<Vec<Operand>> {
        let mut accepted: Vec<Operand> = Vec::with_capacity(operands.len());
        for operand in operands {
            if operand.buffer().is_released() {
                return Err(VmError::BufferReleased {
                    instruction: op_name.to_string(),
                    buffer: operand.buffer().name().to_string(),
                });
            }
            if let Some(previous) = accepted.iter().find(|p| p.buffer() == operand.buffer()) {
                if previous.is_exclusive() || operand.is_exclusive() {
                    return Err(VmError::OperandConflict {
                        instruction: op_name.to_string(),
                        buffer: operand.buffer().name().to_string(),
                        reason: "buffer declared more than once with exclusive access".to_string(),
                    });
                }
                continue;
            }
            accepted.push(operand);
        }
        Ok(accepted)
    }

    fn poll_in_flight(&mut self, report: &mut TickReport) -> Result<()> {
        let mut newly_done = Vec::new();
        let mut failure = None;

        for rt in &mut self.stream_rt_descs {
            for stream in rt.streams_mut() {
                let in_flight = std::mem::take(&mut stream.in_flight);
                for id in in_flight {
                    let Some(instruction) = self.instructions.get_mut(&id) else {
                        continue;
                    };
                    let poll = stream
                        .stream_type()
                        .query_instruction_status_done(stream, &instruction.status_buffer);
                    match poll {
                        StatusPoll::Pending => stream.in_flight.push(id),
                        StatusPoll::Done => {
                            instruction.set_state(InstructionState::Done);
                            if let Some(scratch) = instruction.scratch.take() {
                                scratch.release_body();
                            }
                            let latency = instruction
                                .dispatched_at
                                .map_or(0, |t| t.elapsed().as_nanos() as u64);
                            stream.metrics.record_completion(latency);
                            debug!(
                                instruction = %id,
                                op = %instruction.op_name,
                                stream = %stream.id(),
                                "Instruction done"
                            );
                            newly_done.push(id);
                        }
                        StatusPoll::Failed(message) => {
                            stream.in_flight.push(id);
                            if failure.is_none() {
                                failure = Some(VmError::Hardware {
                                    stream: stream.id(),
                                    message: format!("{} failed: {}", instruction.label(), message),
                                });
                            }
                        }
                    }
                }
            }
        }

        report.completed += newly_done.len();
        self.completed += newly_done.len() as u64;
        for id in newly_done {
            let consumers = self
                .instructions
                .get(&id)
                .map(|i| i.consumers.clone())
                .unwrap_or_default();
            for consumer in consumers {
                if let Some(consumer) = self.instructions.get_mut(&consumer) {
                    consumer.pending_deps = consumer.pending_deps.saturating_sub(1);
                    if consumer.pending_deps == 0 && consumer.state() == InstructionState::Pending {
                        consumer.set_state(InstructionState::Ready);
                        trace!(instruction = %consumer.id, "Dependencies satisfied");
                    }
                }
            }
            self.done.push_back(id);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn dispatch_ready(&mut self, report: &mut TickReport) -> Result<()> {
        let max_in_flight = self.config.max_in_flight_per_stream;
        let mut dispatched = Vec::new();
        let mut failure = None;

        'streams: for rt in &mut self.stream_rt_descs {
            for stream in rt.streams_mut() {
                while stream.in_flight.len() < max_in_flight {
                    let Some(&head) = stream.waiting.front() else {
                        break;
                    };
                    let Some(instruction) = self.instructions.get_mut(&head) else {
                        stream.waiting.pop_front();
                        continue;
                    };
                    if instruction.state() != InstructionState::Ready {
                        trace!(
                            instruction = %head,
                            stream = %stream.id(),
                            deps = instruction.pending_deps,
                            "Stream head not ready"
                        );
                        break;
                    }

                    stream.waiting.pop_front();
                    let outcome = dispatch_one(stream, instruction);
                    stream.in_flight.push(head);
                    let in_flight = stream.in_flight.len();
                    stream.metrics.record_dispatch(in_flight);
                    debug!(
                        instruction = %head,
                        op = %instruction.op_name,
                        stream = %stream.id(),
                        in_flight,
                        "Dispatched instruction"
                    );
                    dispatched.push(instruction.producers.clone());
                    if let Err(err) = outcome {
                        failure = Some(err);
                        break 'streams;
                    }
                }
            }
        }

        // A failed launch still counts as dispatched.
        report.dispatched += dispatched.len();
        self.dispatched += dispatched.len() as u64;
        for producer in dispatched.into_iter().flatten() {
            if let Some(producer) = self.instructions.get_mut(&producer) {
                producer.undispatched_consumers = producer.undispatched_consumers.saturating_sub(1);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn retire_done(&mut self, report: &mut TickReport) -> Result<()> {
        let mut candidates = std::mem::take(&mut self.done);
        while let Some(id) = candidates.pop_front() {
            let ready = self
                .instructions
                .get(&id)
                .map_or(true, |i| i.undispatched_consumers == 0);
            if !ready {
                self.done.push_back(id);
                continue;
            }
            if let Err(err) = self.retire(id) {
                self.done.extend(candidates);
                return Err(err);
            }
            report.retired += 1;
        }
        Ok(())
    }

    fn retire(&mut self, id: InstructionId) -> Result<()> {
        let Some(mut instruction) = self.instructions.remove(&id) else {
            return Err(VmError::DoubleRetire(id));
        };
        if instruction.state() == InstructionState::Retired {
            return Err(VmError::DoubleRetire(id));
        }

        if let Some(stream) = find_stream(&self.stream_rt_descs, instruction.stream) {
            stream
                .stream_type()
                .delete_instruction_status(stream, &mut instruction.status_buffer);
        }
        instruction.payload = None;
        instruction.set_state(InstructionState::Retired);

        for operand in &instruction.operands {
            let buffer_id = operand.buffer().id();
            let Some(list) = self.access_lists.get_mut(&buffer_id) else {
                continue;
            };
            list.live = list.live.saturating_sub(1);
            list.readers.retain(|r| *r != id);
            if list.last_writer == Some(id) {
                list.last_writer = None;
            }
            if list.live == 0 {
                self.access_lists.remove(&buffer_id);
                if let Some(buffer) = self.pending_release.remove(&buffer_id) {
                    buffer.release_body();
                    debug!(buffer = %buffer.name(), "Released buffer after last accessor");
                }
            }
        }

        self.retired += 1;
        debug!(
            instruction = %id,
            op = %instruction.op_name,
            "Retired instruction"
        );
        Ok(())
    }

    fn poison(&mut self, err: VmError) -> VmError {
        error!(vm = self.id, error = %err, "Fatal error, virtual machine terminated");
        self.fatal = Some(err.clone());
        err
    }

    fn pause(&self) {
        if self.config.poll_interval.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Drive until `handle` is done or `timeout` elapses.
    pub fn run_until_done_timeout(
        &mut self,
        handle: &InstructionHandle,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !handle.is_done() {
            if Instant::now() >= deadline {
                return Err(VmError::Timeout(timeout));
            }
            let report = self.tick()?;
            if !report.made_progress() {
                self.pause();
            }
        }
        Ok(())
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        if !self.instructions.is_empty() && self.fatal.is_none() {
            warn!(
                vm = self.id,
                live = self.instructions.len(),
                "Virtual machine dropped with live instructions"
            );
        }
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.id)
            .field("streams", &self.streams().count())
            .field("live", &self.instructions.len())
            .field("fatal", &self.fatal)
            .finish()
    }
}

/// Allocate outputs and scratch, initialize the status token and hand the
/// instruction to its stream type.
fn dispatch_one(stream: &Stream, instruction: &mut Instruction) -> Result<()> {
    let allocator = stream.device_ctx().allocator();
    for operand in &instruction.operands {
        if operand.is_exclusive() && operand.buffer().ensure_allocated(allocator)? {
            trace!(
                buffer = %operand.buffer().name(),
                stream = %stream.id(),
                bytes = operand.buffer().size(),
                "Allocated output"
            );
        }
    }
    if instruction.temp_storage_bytes > 0 {
        let scratch = Buffer::new(
            format!("{}.scratch", instruction.op_name),
            instruction.temp_storage_bytes,
        );
        scratch.ensure_allocated(allocator)?;
        instruction.scratch = Some(scratch);
    }

    let stream_type = Arc::clone(stream.stream_type());
    stream_type.init_instruction_status(stream, &mut instruction.status_buffer);
    instruction.set_state(InstructionState::Dispatched);
    instruction.dispatched_at = Some(Instant::now());
    stream_type.compute(stream, instruction)
}

fn find_stream(rts: &[StreamRtDesc], id: StreamId) -> Option<&Stream> {
    rts.iter()
        .find(|rt| rt.kind() == id.kind)
        .and_then(|rt| rt.stream(id.device_id))
}

fn find_stream_mut(rts: &mut [StreamRtDesc], id: StreamId) -> Option<&mut Stream> {
    rts.iter_mut()
        .find(|rt| rt.kind() == id.kind)
        .and_then(|rt| rt.stream_mut(id.device_id))
}
