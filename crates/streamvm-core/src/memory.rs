//! Per-stream memory allocation.
//!
//! Each stream's device context owns a [`DeviceAllocator`]. Freed blocks are
//! kept on a size-keyed free list and reused, and the allocator tracks bytes
//! in use and the peak so the scheduler's memory bound can be observed.
//! [`MemoryBlock`] is an RAII handle that returns its bytes on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, VmError};
use crate::stream::StreamId;

/// Free blocks kept per size class.
const MAX_POOLED_PER_SIZE: usize = 16;

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Bytes currently handed out.
    pub in_use: usize,
    /// Highest `in_use` observed.
    pub peak: usize,
    /// Total allocations served.
    pub allocations: u64,
    /// Allocations served from the free list.
    pub pool_hits: u64,
    /// Blocks returned.
    pub frees: u64,
    /// Bytes parked on the free list.
    pub pooled_bytes: usize,
}

/// Pooling allocator owned by one stream.
pub struct DeviceAllocator {
    owner: StreamId,
    limit: Option<usize>,
    free_list: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    pooled_bytes: AtomicUsize,
    allocations: AtomicU64,
    pool_hits: AtomicU64,
    frees: AtomicU64,
}

impl DeviceAllocator {
    /// Create an allocator for a stream with an optional byte limit.
    pub fn new(owner: StreamId, limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            limit,
            free_list: Mutex::new(HashMap::new()),
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            pooled_bytes: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Stream this allocator belongs to.
    pub fn owner(&self) -> StreamId {
        self.owner
    }

    /// Allocate a zeroed block of `size` bytes.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<MemoryBlock> {
        let in_use = self.in_use.fetch_add(size, Ordering::AcqRel) + size;
        if let Some(limit) = self.limit {
            if in_use > limit {
                self.in_use.fetch_sub(size, Ordering::AcqRel);
                return Err(VmError::OutOfMemory {
                    stream: self.owner,
                    requested: size,
                    limit,
                });
            }
        }
        self.peak.fetch_max(in_use, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::Relaxed);

        let pooled = {
            let mut free = self.free_list.lock();
            free.get_mut(&size).and_then(|list| list.pop())
        };

        let bytes = match pooled {
            Some(mut bytes) => {
                self.pool_hits.fetch_add(1, Ordering::Relaxed);
                self.pooled_bytes.fetch_sub(size, Ordering::Relaxed);
                bytes.fill(0);
                bytes
            }
            None => vec![0u8; size],
        };

        Ok(MemoryBlock {
            bytes,
            allocator: Some(Arc::clone(self)),
        })
    }

    fn release(&self, bytes: Vec<u8>) {
        let size = bytes.len();
        self.in_use.fetch_sub(size, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::Relaxed);

        let mut free = self.free_list.lock();
        let list = free.entry(size).or_default();
        if list.len() < MAX_POOLED_PER_SIZE {
            list.push(bytes);
            self.pooled_bytes.fetch_add(size, Ordering::Relaxed);
        }
    }

    /// Drop all pooled blocks.
    pub fn trim(&self) {
        self.free_list.lock().clear();
        self.pooled_bytes.store(0, Ordering::Relaxed);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            in_use: self.in_use.load(Ordering::Acquire),
            peak: self.peak.load(Ordering::Acquire),
            allocations: self.allocations.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            pooled_bytes: self.pooled_bytes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DeviceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("owner", &self.owner)
            .field("limit", &self.limit)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Block of memory that returns to its allocator when dropped.
pub struct MemoryBlock {
    bytes: Vec<u8>,
    allocator: Option<Arc<DeviceAllocator>>,
}

impl MemoryBlock {
    /// Wrap caller-owned host bytes that belong to no allocator.
    pub fn host(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            allocator: None,
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the block is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Stream whose allocator owns the block, if any.
    pub fn owner(&self) -> Option<StreamId> {
        self.allocator.as_ref().map(|a| a.owner())
    }

    /// Byte view.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable byte view.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            allocator.release(std::mem::take(&mut self.bytes));
        }
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("len", &self.bytes.len())
            .field("owner", &self.owner())
            .finish()
    }
}
