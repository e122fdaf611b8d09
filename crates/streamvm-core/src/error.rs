//! Error types for the instruction VM.
//!
//! Errors fall into four groups:
//! - configuration errors (a stream type that resource discovery did not
//!   provision, invalid config values),
//! - contract violations (operand conflicts, use of released buffers or
//!   retired handles) which fail the offending call but leave the VM usable,
//! - hardware errors, which are fatal to the whole VM,
//! - lifecycle errors (submission after shutdown or after a fatal error).

use std::time::Duration;

use thiserror::Error;

use crate::instruction::InstructionId;
use crate::stream::StreamId;
use crate::stream_type::StreamKind;

/// Result type for VM operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors raised by the instruction VM.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    // ===== Configuration =====
    /// No stream exists for the requested selector.
    #[error("{instruction}: no {kind} stream with device id {device_id} ({available} provisioned)")]
    InvalidStreamSelector {
        /// Name of the instruction that named the stream.
        instruction: String,
        /// Requested stream kind.
        kind: StreamKind,
        /// Requested device id.
        device_id: usize,
        /// Number of streams of that kind that exist.
        available: usize,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Contract violations =====
    /// Conflicting operand declarations.
    #[error("operand conflict in instruction {instruction} on buffer '{buffer}': {reason}")]
    OperandConflict {
        /// Offending instruction (op name).
        instruction: String,
        /// Offending buffer.
        buffer: String,
        /// What conflicted.
        reason: String,
    },

    /// Instruction names a buffer whose release was already requested.
    #[error("instruction {instruction} uses released buffer '{buffer}'")]
    BufferReleased {
        /// Offending instruction (op name).
        instruction: String,
        /// Released buffer.
        buffer: String,
    },

    /// A buffer body was accessed before it was allocated.
    #[error("buffer '{0}' has no allocated body")]
    BufferUnallocated(String),

    /// Instruction was retired more than once.
    #[error("instruction {0} retired twice")]
    DoubleRetire(InstructionId),

    /// Handle refers to an instruction that has already retired.
    #[error("instruction {0} already retired")]
    StaleHandle(InstructionId),

    /// Handle was issued by a different VM.
    #[error("instruction {0} belongs to another virtual machine")]
    ForeignHandle(InstructionId),

    /// Unknown actor.
    #[error("unknown actor: {0}")]
    UnknownActor(String),

    /// Actor has no register with that name.
    #[error("actor '{actor}' has no register '{register}'")]
    RegisterNotFound {
        /// Actor name.
        actor: String,
        /// Register name.
        register: String,
    },

    // ===== Hardware =====
    /// Work submitted to a kernel failed.
    #[error("kernel failed: {0}")]
    KernelFailed(String),

    /// Launch or completion failure on a stream. Fatal to the VM.
    #[error("hardware error on stream {stream}: {message}")]
    Hardware {
        /// Stream the failure was observed on.
        stream: StreamId,
        /// Failure description.
        message: String,
    },

    /// Stream allocator exhausted. Fatal to the VM.
    #[error("out of memory on stream {stream}: requested {requested} bytes, limit {limit}")]
    OutOfMemory {
        /// Stream whose allocator failed.
        stream: StreamId,
        /// Requested size in bytes.
        requested: usize,
        /// Allocator limit in bytes.
        limit: usize,
    },

    // ===== Lifecycle =====
    /// Submission after shutdown was requested.
    #[error("virtual machine is shutting down")]
    ShutDown,

    /// The VM stopped after a fatal error.
    #[error("virtual machine terminated: {0}")]
    Terminated(Box<VmError>),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl VmError {
    /// Create a kernel failure from any message.
    pub fn kernel(message: impl Into<String>) -> Self {
        VmError::KernelFailed(message.into())
    }

    /// Whether this error terminates the VM.
    pub fn is_fatal(&self) -> bool {
        match self {
            VmError::Hardware { .. } | VmError::OutOfMemory { .. } => true,
            VmError::Terminated(_) => true,
            _ => false,
        }
    }

    /// Whether this error is a configuration error.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            VmError::InvalidStreamSelector { .. } | VmError::InvalidConfig(_)
        )
    }

    /// Whether this error is a caller contract violation.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            VmError::OperandConflict { .. }
                | VmError::BufferReleased { .. }
                | VmError::BufferUnallocated(_)
                | VmError::DoubleRetire(_)
                | VmError::StaleHandle(_)
                | VmError::ForeignHandle(_)
                | VmError::UnknownActor(_)
                | VmError::RegisterNotFound { .. }
        )
    }

    /// Unwrap a `Terminated` wrapper to the original fatal error.
    pub fn root_cause(&self) -> &VmError {
        match self {
            VmError::Terminated(inner) => inner.root_cause(),
            other => other,
        }
    }
}
