//! Pipeline stages driven as explicit state machines.
//!
//! An [`Actor`] consumes buffers from its input registers and produces into
//! its output registers. It may act only when every input has a ready slot
//! and every output has a free slot; otherwise it is skipped for the turn
//! (backpressure). Acting runs the stage's [`StageKernel`], which issues
//! instructions to the VM, then the actor releases the consumed input slots
//! and announces the produced output slots.
//!
//! State machine:
//!
//! ```text
//! WaitToStart --(Start / first input)--> Normal
//! Normal --(input exhausted)--> Flushing   (end-of-stream sent downstream)
//! Flushing --(all output slots released)--> Done
//! ```
//!
//! A flushing or done actor hands every input slot straight back to its
//! producer, so an upstream stage never waits on a consumer that stopped.

mod message;
mod register;
mod system;

pub use message::{ActorMsg, ActorMsgKind};
pub use register::{InRegister, OutRegister, RegisterDesc};
pub use system::{Pipeline, TurnReport};

use serde::Serialize;
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::error::{Result, VmError};
use crate::instruction::{InstructionHandle, InstructionMsg};
use crate::scheduler::VirtualMachine;

use message::MessageBus;
use register::{Consumer, ReadySlot};

/// Actor identifier within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActorId(pub(crate) usize);

impl ActorId {
    /// Index within the pipeline.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actor{}", self.0)
    }
}

/// Actor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorState {
    /// No traffic yet.
    WaitToStart,
    /// Consuming and producing.
    Normal,
    /// Input exhausted; waiting for downstream to release output slots.
    Flushing,
    /// Finished.
    Done,
}

impl std::fmt::Display for ActorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActorState::WaitToStart => "wait-to-start",
            ActorState::Normal => "normal",
            ActorState::Flushing => "flushing",
            ActorState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Per-actor counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorStats {
    /// Successful acts.
    pub acts: u64,
    /// Turns skipped because an input had no ready slot.
    pub read_stalls: u64,
    /// Turns skipped because an output had no free slot.
    pub write_stalls: u64,
    /// Current state.
    pub state: ActorState,
}

/// Work performed by one pipeline stage.
pub trait StageKernel: Send + 'static {
    /// Issue the stage's instructions for the current slots.
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()>;

    /// Whether a source stage has more to produce. Stages with inputs stop
    /// on end-of-stream instead.
    fn has_more_input(&self) -> bool {
        true
    }
}

/// Input slot visible during an act.
struct InputView {
    register: String,
    buffer: Buffer,
    seq: u64,
}

/// Output slot visible during an act.
struct OutputView {
    register: String,
    buffer: Buffer,
}

/// What a [`StageKernel`] sees while acting.
pub struct ActContext<'a> {
    actor: &'a str,
    act_seq: u64,
    inputs: &'a [InputView],
    outputs: &'a [OutputView],
    vm: &'a mut VirtualMachine,
    issued: Vec<InstructionHandle>,
}

impl<'a> ActContext<'a> {
    /// Acting actor's name.
    pub fn actor_name(&self) -> &str {
        self.actor
    }

    /// Zero-based count of this actor's previous acts.
    pub fn act_seq(&self) -> u64 {
        self.act_seq
    }

    /// Buffer of the ready slot in input register `name`.
    pub fn input(&self, name: &str) -> Result<&Buffer> {
        self.inputs
            .iter()
            .find(|v| v.register == name)
            .map(|v| &v.buffer)
            .ok_or_else(|| self.missing(name))
    }

    /// Producer sequence number of the ready slot in input register `name`.
    pub fn input_seq(&self, name: &str) -> Result<u64> {
        self.inputs
            .iter()
            .find(|v| v.register == name)
            .map(|v| v.seq)
            .ok_or_else(|| self.missing(name))
    }

    /// Buffer of the free slot in output register `name`.
    pub fn output(&self, name: &str) -> Result<&Buffer> {
        self.outputs
            .iter()
            .find(|v| v.register == name)
            .map(|v| &v.buffer)
            .ok_or_else(|| self.missing(name))
    }

    /// Submit an instruction to the VM.
    pub fn enqueue(&mut self, msg: InstructionMsg) -> Result<InstructionHandle> {
        let handle = self.vm.enqueue(msg)?;
        self.issued.push(handle.clone());
        Ok(handle)
    }

    /// Instructions issued during this act.
    pub fn issued(&self) -> &[InstructionHandle] {
        &self.issued
    }

    fn missing(&self, register: &str) -> VmError {
        VmError::RegisterNotFound {
            actor: self.actor.to_string(),
            register: register.to_string(),
        }
    }
}

/// One pipeline stage.
pub struct Actor {
    id: ActorId,
    name: String,
    state: ActorState,
    kernel: Box<dyn StageKernel>,
    inputs: Vec<InRegister>,
    outputs: Vec<OutRegister>,
    act_seq: u64,
    read_stalls: u64,
    write_stalls: u64,
}

impl Actor {
    pub(crate) fn new(id: ActorId, name: String, kernel: Box<dyn StageKernel>) -> Self {
        Self {
            id,
            name,
            state: ActorState::WaitToStart,
            kernel,
            inputs: Vec::new(),
            outputs: Vec::new(),
            act_seq: 0,
            read_stalls: 0,
            write_stalls: 0,
        }
    }

    /// Actor id.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Actor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> ActorState {
        self.state
    }

    /// Whether every input register has a ready slot.
    pub fn is_read_ready(&self) -> bool {
        self.inputs.iter().all(|r| r.is_read_ready())
    }

    /// Whether every output register has a free slot.
    pub fn is_write_ready(&self) -> bool {
        self.outputs.iter().all(|r| r.is_write_ready())
    }

    /// Whether no further input can arrive.
    pub fn is_input_exhausted(&self) -> bool {
        if self.inputs.is_empty() {
            !self.kernel.has_more_input()
        } else {
            self.inputs.iter().any(|r| r.is_exhausted())
        }
    }

    /// Input register by name.
    pub fn input(&self, name: &str) -> Option<&InRegister> {
        self.inputs.iter().find(|r| r.name() == name)
    }

    /// Output register by name.
    pub fn output(&self, name: &str) -> Option<&OutRegister> {
        self.outputs.iter().find(|r| r.name() == name)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ActorStats {
        ActorStats {
            acts: self.act_seq,
            read_stalls: self.read_stalls,
            write_stalls: self.write_stalls,
            state: self.state,
        }
    }

    pub(crate) fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    pub(crate) fn add_output(&mut self, desc: &RegisterDesc) {
        self.outputs.push(OutRegister::new(&self.name, desc));
    }

    pub(crate) fn output_mut(&mut self, name: &str) -> Option<&mut OutRegister> {
        self.outputs.iter_mut().find(|r| r.name() == name)
    }

    pub(crate) fn input_mut(&mut self, name: &str) -> Option<&mut InRegister> {
        self.inputs.iter_mut().find(|r| r.name() == name)
    }

    pub(crate) fn ensure_input(&mut self, name: &str) -> &mut InRegister {
        if let Some(index) = self.inputs.iter().position(|r| r.name() == name) {
            return &mut self.inputs[index];
        }
        self.inputs.push(InRegister::new(name));
        let last = self.inputs.len() - 1;
        &mut self.inputs[last]
    }

    fn register_error(&self, register: &str) -> VmError {
        VmError::RegisterNotFound {
            actor: self.name.clone(),
            register: register.to_string(),
        }
    }

    fn set_state(&mut self, state: ActorState) {
        if self.state != state {
            debug!(actor = %self.name, from = %self.state, to = %state, "Actor state change");
            self.state = state;
        }
    }

    /// Apply one incoming message.
    pub(crate) fn handle(&mut self, msg: ActorMsg, bus: &mut MessageBus) -> Result<()> {
        match msg.kind {
            ActorMsgKind::Start => {}
            ActorMsgKind::BufferProduced {
                register,
                slot,
                buffer,
                seq,
            } => {
                let id = self.id;
                let stopped = matches!(self.state, ActorState::Flushing | ActorState::Done);
                let input = self
                    .input_mut(&register)
                    .ok_or_else(|| VmError::RegisterNotFound {
                        actor: msg.dst.to_string(),
                        register: register.clone(),
                    })?;
                if stopped {
                    trace!(register = %register, slot, "Returning slot to producer after flush");
                    return_slot(id, input.producer.as_ref(), slot, bus);
                } else {
                    input.push(ReadySlot { slot, buffer, seq });
                }
            }
            ActorMsgKind::BufferConsumed { register, slot } => {
                let error = self.register_error(&register);
                let output = self.output_mut(&register).ok_or(error)?;
                if output.consumed(slot) {
                    trace!(register = %register, slot, "Output slot freed");
                }
            }
            ActorMsgKind::EndOfStream { register } => {
                let error = self.register_error(&register);
                self.input_mut(&register).ok_or(error)?.set_eos();
            }
        }
        if self.state == ActorState::WaitToStart {
            self.set_state(ActorState::Normal);
        }
        Ok(())
    }

    /// Give the actor one chance to act. Returns whether anything changed.
    pub(crate) fn try_act(&mut self, vm: &mut VirtualMachine, bus: &mut MessageBus) -> Result<bool> {
        match self.state {
            ActorState::WaitToStart | ActorState::Done => return Ok(false),
            ActorState::Flushing => {
                if self.outputs.iter().all(|r| r.all_free()) {
                    self.set_state(ActorState::Done);
                    return Ok(true);
                }
                return Ok(false);
            }
            ActorState::Normal => {}
        }

        if self.is_input_exhausted() {
            self.begin_flush(bus);
            return Ok(true);
        }

        let read_ready = self.is_read_ready();
        let write_ready = self.is_write_ready();
        if !read_ready {
            self.read_stalls += 1;
        }
        if !write_ready {
            self.write_stalls += 1;
        }
        if !(read_ready && write_ready) {
            trace!(actor = %self.name, read_ready, write_ready, "Actor not ready");
            return Ok(false);
        }

        let inputs: Vec<InputView> = self
            .inputs
            .iter()
            .filter_map(|r| {
                r.front().map(|s| InputView {
                    register: r.name().to_string(),
                    buffer: s.buffer.clone(),
                    seq: s.seq,
                })
            })
            .collect();
        let outputs: Vec<OutputView> = self
            .outputs
            .iter()
            .filter_map(|r| {
                r.peek_free().map(|(_, buffer)| OutputView {
                    register: r.name().to_string(),
                    buffer,
                })
            })
            .collect();

        let mut ctx = ActContext {
            actor: &self.name,
            act_seq: self.act_seq,
            inputs: &inputs,
            outputs: &outputs,
            vm,
            issued: Vec::new(),
        };
        self.kernel.act(&mut ctx)?;
        let issued = ctx.issued.len();

        for input in &mut self.inputs {
            if let Some(slot) = input.pop() {
                return_slot(self.id, input.producer.as_ref(), slot.slot, bus);
            }
        }
        for output in &mut self.outputs {
            let consumers = output.consumers.clone();
            if let Some((slot, buffer)) = output.produce() {
                for consumer in consumers {
                    bus.send(
                        self.id,
                        consumer.actor,
                        ActorMsgKind::BufferProduced {
                            register: consumer.register,
                            slot,
                            buffer: buffer.clone(),
                            seq: self.act_seq,
                        },
                    );
                }
            }
        }

        trace!(actor = %self.name, seq = self.act_seq, issued, "Actor acted");
        self.act_seq += 1;
        Ok(true)
    }

    fn begin_flush(&mut self, bus: &mut MessageBus) {
        for input in &mut self.inputs {
            while let Some(slot) = input.pop() {
                return_slot(self.id, input.producer.as_ref(), slot.slot, bus);
            }
        }
        for output in &self.outputs {
            for consumer in &output.consumers {
                bus.send(
                    self.id,
                    consumer.actor,
                    ActorMsgKind::EndOfStream {
                        register: consumer.register.clone(),
                    },
                );
            }
        }
        self.set_state(ActorState::Flushing);
        if self.outputs.iter().all(|r| r.all_free()) {
            self.set_state(ActorState::Done);
        }
    }

    pub(crate) fn connect_output(&mut self, output: &str, consumer: Consumer) -> Result<()> {
        let error = self.register_error(output);
        self.output_mut(output).ok_or(error)?.consumers.push(consumer);
        Ok(())
    }
}

/// Tell the producer of an input register that `slot` is free again.
fn return_slot(from: ActorId, producer: Option<&Consumer>, slot: usize, bus: &mut MessageBus) {
    if let Some(producer) = producer {
        bus.send(
            from,
            producer.actor,
            ActorMsgKind::BufferConsumed {
                register: producer.register.clone(),
                slot,
            },
        );
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}
