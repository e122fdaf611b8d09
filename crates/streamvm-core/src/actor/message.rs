//! Messages exchanged between actors.
//!
//! Register names in a message are always the recipient's: an input
//! register for `BufferProduced`/`EndOfStream`, an output register for
//! `BufferConsumed`.

use std::collections::VecDeque;

use crate::buffer::Buffer;

use super::ActorId;

/// Message payload.
#[derive(Debug, Clone)]
pub enum ActorMsgKind {
    /// Begin producing (sent to source stages).
    Start,
    /// The producer filled a slot.
    BufferProduced {
        /// Recipient's input register.
        register: String,
        /// Producer slot index.
        slot: usize,
        /// Slot buffer.
        buffer: Buffer,
        /// Producer's act sequence number.
        seq: u64,
    },
    /// A consumer released a slot.
    BufferConsumed {
        /// Recipient's output register.
        register: String,
        /// Slot index.
        slot: usize,
    },
    /// The producer will send nothing more.
    EndOfStream {
        /// Recipient's input register.
        register: String,
    },
}

/// A routed message.
#[derive(Debug, Clone)]
pub struct ActorMsg {
    /// Sender.
    pub src: ActorId,
    /// Recipient.
    pub dst: ActorId,
    /// Payload.
    pub kind: ActorMsgKind,
}

/// FIFO message queue. Order is preserved per sender/recipient pair.
#[derive(Debug, Default)]
pub(crate) struct MessageBus {
    queue: VecDeque<ActorMsg>,
    sent: u64,
}

impl MessageBus {
    pub(crate) fn send(&mut self, src: ActorId, dst: ActorId, kind: ActorMsgKind) {
        self.sent += 1;
        self.queue.push_back(ActorMsg { src, dst, kind });
    }

    /// Take every queued message, leaving later sends for the next round.
    pub(crate) fn drain(&mut self) -> VecDeque<ActorMsg> {
        std::mem::take(&mut self.queue)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_drain() {
        let mut bus = MessageBus::default();
        bus.send(ActorId(0), ActorId(1), ActorMsgKind::Start);
        bus.send(
            ActorId(0),
            ActorId(1),
            ActorMsgKind::EndOfStream {
                register: "in".to_string(),
            },
        );

        let batch = bus.drain();
        assert!(bus.is_empty());
        assert_eq!(bus.sent(), 2);
        assert!(matches!(batch[0].kind, ActorMsgKind::Start));
        assert!(matches!(batch[1].kind, ActorMsgKind::EndOfStream { .. }));
    }
}
