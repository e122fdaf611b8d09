//! Registers: bounded buffer slots passed between pipeline stages.
//!
//! An [`OutRegister`] owns a fixed set of slot buffers. A slot is free until
//! the owning actor produces into it, then stays occupied until every
//! connected consumer reported it consumed. An [`InRegister`] queues the
//! slots announced by its producer in arrival order.

use std::collections::VecDeque;

use crate::buffer::Buffer;

use super::ActorId;

/// Shape of an output register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDesc {
    /// Register name, unique per actor.
    pub name: String,
    /// Number of slots.
    pub capacity: usize,
    /// Bytes per slot buffer.
    pub buffer_size: usize,
}

impl RegisterDesc {
    /// Describe a register.
    pub fn new(name: impl Into<String>, capacity: usize, buffer_size: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            buffer_size,
        }
    }
}

/// Downstream end of an output register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Consumer {
    pub(crate) actor: ActorId,
    pub(crate) register: String,
}

/// Produced-into register.
#[derive(Debug)]
pub struct OutRegister {
    name: String,
    slots: Vec<Buffer>,
    free: VecDeque<usize>,
    outstanding: Vec<usize>,
    pub(crate) consumers: Vec<Consumer>,
}

impl OutRegister {
    pub(crate) fn new(actor_name: &str, desc: &RegisterDesc) -> Self {
        let slots = (0..desc.capacity)
            .map(|i| Buffer::new(format!("{}.{}[{}]", actor_name, desc.name, i), desc.buffer_size))
            .collect();
        Self {
            name: desc.name.clone(),
            slots,
            free: (0..desc.capacity).collect(),
            outstanding: vec![0; desc.capacity],
            consumers: Vec::new(),
        }
    }

    /// Register name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free slots.
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Whether a slot is free to produce into.
    pub fn is_write_ready(&self) -> bool {
        !self.free.is_empty()
    }

    /// Whether every slot is free.
    pub fn all_free(&self) -> bool {
        self.free.len() == self.slots.len()
    }

    /// Next slot to produce into.
    pub(crate) fn peek_free(&self) -> Option<(usize, Buffer)> {
        self.free
            .front()
            .map(|&slot| (slot, self.slots[slot].clone()))
    }

    /// Mark the next free slot occupied until every consumer releases it.
    pub(crate) fn produce(&mut self) -> Option<(usize, Buffer)> {
        let slot = self.free.pop_front()?;
        if self.consumers.is_empty() {
            self.free.push_back(slot);
        } else {
            self.outstanding[slot] = self.consumers.len();
        }
        Some((slot, self.slots[slot].clone()))
    }

    /// One consumer released `slot`. Returns whether the slot became free.
    pub(crate) fn consumed(&mut self, slot: usize) -> bool {
        match self.outstanding.get_mut(slot) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.free.push_back(slot);
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

/// A slot announced by the producer.
#[derive(Debug, Clone)]
pub(crate) struct ReadySlot {
    pub(crate) slot: usize,
    pub(crate) buffer: Buffer,
    pub(crate) seq: u64,
}

/// Consumed-from register.
#[derive(Debug)]
pub struct InRegister {
    name: String,
    pub(crate) producer: Option<Consumer>,
    ready: VecDeque<ReadySlot>,
    eos: bool,
}

impl InRegister {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            producer: None,
            ready: VecDeque::new(),
            eos: false,
        }
    }

    /// Register name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slots waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Whether a slot is ready to consume.
    pub fn is_read_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Whether the producer finished.
    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Producer finished and nothing is left.
    pub fn is_exhausted(&self) -> bool {
        self.eos && self.ready.is_empty()
    }

    pub(crate) fn push(&mut self, slot: ReadySlot) {
        self.ready.push_back(slot);
    }

    pub(crate) fn front(&self) -> Option<&ReadySlot> {
        self.ready.front()
    }

    pub(crate) fn pop(&mut self) -> Option<ReadySlot> {
        self.ready.pop_front()
    }

    pub(crate) fn set_eos(&mut self) {
        self.eos = true;
    }
}
