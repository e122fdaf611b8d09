//! Buffers named as instruction operands.
//!
//! A [`Buffer`] is a cheap, clonable handle. Its body is allocated lazily by
//! the scheduler right before the first instruction that writes it is
//! dispatched, from the allocator of that instruction's stream. Bodies may
//! also be supplied up front from host memory.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, VmError};
use crate::memory::{DeviceAllocator, MemoryBlock};
use crate::stream::StreamId;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique buffer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

struct BufferInner {
    id: BufferId,
    name: String,
    size: usize,
    released: AtomicBool,
    body: Mutex<Option<MemoryBlock>>,
}

/// Shared handle to a buffer.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Create a buffer whose body is allocated on first write.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: BufferId::next(),
                name: name.into(),
                size,
                released: AtomicBool::new(false),
                body: Mutex::new(None),
            }),
        }
    }

    /// Create a buffer backed by existing host bytes.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let buffer = Self::new(name, bytes.len());
        *buffer.inner.body.lock() = Some(MemoryBlock::host(bytes));
        buffer
    }

    /// Buffer id.
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Buffer name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declared size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Whether a body is present.
    pub fn is_allocated(&self) -> bool {
        self.inner.body.lock().is_some()
    }

    /// Stream whose allocator holds the body, if any.
    pub fn placement(&self) -> Option<StreamId> {
        self.inner.body.lock().as_ref().and_then(|b| b.owner())
    }

    /// Whether the buffer was handed to `release_buffer`. Released buffers
    /// are refused as operands.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Mark the buffer released. Returns false if it already was.
    pub(crate) fn mark_released(&self) -> bool {
        !self.inner.released.swap(true, Ordering::AcqRel)
    }

    /// Allocate the body if missing. Returns whether an allocation happened.
    pub(crate) fn ensure_allocated(&self, allocator: &Arc<DeviceAllocator>) -> Result<bool> {
        let mut body = self.inner.body.lock();
        if body.is_some() {
            return Ok(false);
        }
        *body = Some(allocator.allocate(self.inner.size)?);
        Ok(true)
    }

    /// Drop the body, returning its bytes to the owning allocator.
    pub(crate) fn release_body(&self) -> bool {
        self.inner.body.lock().take().is_some()
    }

    /// Run `f` over the body bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let body = self.inner.body.lock();
        match body.as_ref() {
            Some(block) => Ok(f(block.as_slice())),
            None => Err(VmError::BufferUnallocated(self.inner.name.clone())),
        }
    }

    /// Run `f` over the mutable body bytes.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut body = self.inner.body.lock();
        match body.as_mut() {
            Some(block) => Ok(f(block.as_mut_slice())),
            None => Err(VmError::BufferUnallocated(self.inner.name.clone())),
        }
    }

    /// Copy of the body bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.read(|bytes| bytes.to_vec())
    }

    /// Read a little-endian `u64` at byte offset 0.
    pub fn read_u64(&self) -> Result<u64> {
        self.read(|bytes| {
            let mut raw = [0u8; 8];
            let n = bytes.len().min(8);
            raw[..n].copy_from_slice(&bytes[..n]);
            u64::from_le_bytes(raw)
        })
    }

    /// Write a little-endian `u64` at byte offset 0.
    pub fn write_u64(&self, value: u64) -> Result<()> {
        self.write(|bytes| {
            let raw = value.to_le_bytes();
            let n = bytes.len().min(8);
            bytes[..n].copy_from_slice(&raw[..n]);
        })
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .field("allocated", &self.is_allocated())
            .field("released", &self.is_released())
            .finish()
    }
}
