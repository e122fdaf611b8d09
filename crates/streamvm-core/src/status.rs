//! Per-instruction completion tokens.
//!
//! Each instruction embeds a [`StatusBuffer`]. Its stream type places a
//! stream-specific [`InstructionStatus`] in it before dispatch and removes
//! it at retirement:
//! - [`NaiveStatus`]: a flag set by the thread that ran the instruction
//!   synchronously (CPU streams).
//! - [`EventRecordStatus`]: "launched" plus an event recorded on the
//!   stream's hardware queue after the instruction's kernels (accelerator,
//!   copy and network streams).
//!
//! Done-ness is monotone: once a status reports done it never reverts.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{Event, EventStatus, HwQueue};

/// Result of polling a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusPoll {
    /// Still running (or not launched yet).
    Pending,
    /// Finished successfully.
    Done,
    /// Finished with a hardware/kernel failure.
    Failed(String),
}

const NAIVE_PENDING: u8 = 0;
const NAIVE_DONE: u8 = 1;
const NAIVE_FAILED: u8 = 2;

/// Completion flag written by the executing thread.
#[derive(Clone, Default)]
pub struct NaiveStatus {
    state: Arc<AtomicU8>,
    error: Arc<Mutex<Option<String>>>,
}

impl NaiveStatus {
    /// Create a pending status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark finished.
    pub fn set_done(&self) {
        let _ = self.state.compare_exchange(
            NAIVE_PENDING,
            NAIVE_DONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Mark failed.
    pub fn set_failed(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
        let _ = self.state.compare_exchange(
            NAIVE_PENDING,
            NAIVE_FAILED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Poll.
    pub fn poll(&self) -> StatusPoll {
        match self.state.load(Ordering::Acquire) {
            NAIVE_PENDING => StatusPoll::Pending,
            NAIVE_DONE => StatusPoll::Done,
            _ => StatusPoll::Failed(
                self.error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "instruction failed".to_string()),
            ),
        }
    }
}

/// Event-backed status for asynchronous streams.
#[derive(Default)]
pub struct EventRecordStatus {
    launched: bool,
    event: Option<Event>,
}

impl EventRecordStatus {
    /// Create a not-yet-launched status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event on the queue and mark the instruction launched.
    pub fn set_launched(&mut self, queue: &HwQueue) {
        self.event = Some(queue.record_event());
        self.launched = true;
    }

    /// Whether the instruction was launched.
    pub fn is_launched(&self) -> bool {
        self.launched
    }

    /// Poll: done once launched and the event completed.
    pub fn poll(&self) -> StatusPoll {
        match (&self.event, self.launched) {
            (Some(event), true) => match event.query() {
                EventStatus::Pending => StatusPoll::Pending,
                EventStatus::Complete => StatusPoll::Done,
                EventStatus::Failed(msg) => StatusPoll::Failed(msg),
            },
            _ => StatusPoll::Pending,
        }
    }
}

/// Stream-specific completion token.
pub enum InstructionStatus {
    /// Set by the executing thread.
    Naive(NaiveStatus),
    /// Launched flag plus hardware event.
    EventRecord(EventRecordStatus),
}

impl InstructionStatus {
    /// Poll the token.
    pub fn poll(&self) -> StatusPoll {
        match self {
            InstructionStatus::Naive(s) => s.poll(),
            InstructionStatus::EventRecord(s) => s.poll(),
        }
    }
}

/// Slot embedded in every instruction that holds its completion token.
#[derive(Default)]
pub struct StatusBuffer {
    status: Option<InstructionStatus>,
}

impl StatusBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a token, replacing any previous one.
    pub fn init(&mut self, status: InstructionStatus) {
        self.status = Some(status);
    }

    /// Remove the token.
    pub fn clear(&mut self) -> Option<InstructionStatus> {
        self.status.take()
    }

    /// Whether a token is present.
    pub fn is_initialized(&self) -> bool {
        self.status.is_some()
    }

    /// Borrow the token.
    pub fn get(&self) -> Option<&InstructionStatus> {
        self.status.as_ref()
    }

    /// Mutably borrow the token.
    pub fn get_mut(&mut self) -> Option<&mut InstructionStatus> {
        self.status.as_mut()
    }

    /// Poll the token; an empty buffer is pending.
    pub fn poll(&self) -> StatusPoll {
        self.status
            .as_ref()
            .map(|s| s.poll())
            .unwrap_or(StatusPoll::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_naive_monotone() {
        let status = NaiveStatus::new();
        assert_eq!(status.poll(), StatusPoll::Pending);
        status.set_done();
        assert_eq!(status.poll(), StatusPoll::Done);
        status.set_failed("late");
        assert_eq!(status.poll(), StatusPoll::Done);
    }

    #[test]
    fn test_naive_failed() {
        let status = NaiveStatus::new();
        let writer = status.clone();
        writer.set_failed("bad input");
        assert_eq!(status.poll(), StatusPoll::Failed("bad input".to_string()));
    }

    #[test]
    fn test_event_record_requires_launch() {
        let queue = HwQueue::spawn("status").unwrap();
        let mut status = EventRecordStatus::new();
        assert!(!status.is_launched());
        assert_eq!(status.poll(), StatusPoll::Pending);

        status.set_launched(&queue);
        let mut polls = 0;
        while status.poll() == StatusPoll::Pending {
            std::thread::sleep(Duration::from_micros(100));
            polls += 1;
            assert!(polls < 10_000);
        }
        assert_eq!(status.poll(), StatusPoll::Done);
    }

    #[test]
    fn test_status_buffer_lifecycle() {
        let mut buffer = StatusBuffer::new();
        assert!(!buffer.is_initialized());
        assert_eq!(buffer.poll(), StatusPoll::Pending);

        let naive = NaiveStatus::new();
        buffer.init(InstructionStatus::Naive(naive.clone()));
        naive.set_done();
        assert_eq!(buffer.poll(), StatusPoll::Done);

        assert!(buffer.clear().is_some());
        assert!(!buffer.is_initialized());
    }
}
