//! # StreamVM Core
//!
//! An instruction virtual machine that schedules opaque units of work onto
//! heterogeneous execution streams (CPU workers, accelerator compute and
//! copy engines, network workers).
//!
//! ## Core Abstractions
//!
//! - [`StreamType`] - Behavior shared by every stream of one hardware kind
//! - [`Stream`] - One serialized execution channel with its device context
//! - [`InstructionMsg`] - A request: target stream, operands, payload
//! - [`VirtualMachine`] - Dependency tracking, dispatch, completion polling
//!   and retirement
//! - [`Pipeline`] - Actors that exchange buffer registers and issue
//!   instructions under backpressure
//!
//! ## Example
//!
//! ```ignore
//! use streamvm_core::prelude::*;
//!
//! let mut vm = VirtualMachine::new(VmConfig::cpu_only())?;
//! let out = Buffer::new("out", 8);
//! let handle = vm.enqueue(
//!     InstructionMsg::from_fn(StreamSelector::cpu(0), "fill", |ctx| {
//!         ctx.buffer(0)?.write_u64(42)
//!     })
//!     .write(&out),
//! )?;
//! vm.run_until_done(&handle)?;
//! assert_eq!(out.read_u64()?, 42);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod instruction;
pub mod memory;
pub mod metrics;
pub mod scheduler;
pub mod status;
pub mod stream;
pub mod stream_type;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::actor::{
        ActContext, Actor, ActorId, ActorMsg, ActorMsgKind, ActorState, ActorStats, InRegister,
        OutRegister, Pipeline, RegisterDesc, StageKernel, TurnReport,
    };
    pub use crate::buffer::{Buffer, BufferId};
    pub use crate::config::{BackoffStrategy, Resource, VmConfig, VmConfigBuilder};
    pub use crate::device::{current_device, set_device, Event, EventStatus, HwQueue};
    pub use crate::error::{Result, VmError};
    pub use crate::instruction::{
        AccessMode, ComputeContext, FnPayload, InstructionHandle, InstructionId, InstructionInfo,
        InstructionMsg, InstructionPayload, InstructionState, Operand, StreamSelector,
    };
    pub use crate::memory::{AllocatorStats, DeviceAllocator, MemoryBlock};
    pub use crate::metrics::{StreamMetrics, StreamSnapshot, VmMetrics};
    pub use crate::scheduler::{TickReport, VirtualMachine};
    pub use crate::status::{InstructionStatus, StatusBuffer, StatusPoll};
    pub use crate::stream::{DeviceCtx, Stream, StreamId, StreamRtDesc};
    pub use crate::stream_type::{LaunchPolicy, StreamDesc, StreamKind, StreamType, StreamTypeRegistry};
}

pub use actor::Pipeline;
pub use buffer::Buffer;
pub use config::{Resource, VmConfig};
pub use error::{Result, VmError};
pub use instruction::{InstructionHandle, InstructionMsg, StreamSelector};
pub use scheduler::VirtualMachine;
pub use stream::{Stream, StreamId};
pub use stream_type::{StreamKind, StreamType};
