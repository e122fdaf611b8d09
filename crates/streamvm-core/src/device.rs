//! Simulated hardware execution channels.
//!
//! Every stream owns a [`HwQueue`]: a dedicated worker thread that runs
//! submitted kernels in FIFO order, the way an accelerator stream or copy
//! engine would. Completion is observed through [`Event`]s recorded on the
//! queue; an event completes once every kernel enqueued before it has
//! finished, and is queried without blocking.
//!
//! A failed (or panicking) kernel leaves a sticky error on its queue. Later
//! kernels on that queue are skipped and every later event completes with
//! the error, which is how the scheduler learns about asynchronous failures.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;

thread_local! {
    static CURRENT_DEVICE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Select the device used by subsequent launches on this thread.
pub fn set_device(device_id: usize) {
    CURRENT_DEVICE.with(|d| d.set(Some(device_id)));
}

/// Device selected on this thread, if any.
pub fn current_device() -> Option<usize> {
    CURRENT_DEVICE.with(|d| d.get())
}

/// Unit of work executed on a hardware queue.
pub type Kernel = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

const EVENT_PENDING: u8 = 0;
const EVENT_COMPLETE: u8 = 1;
const EVENT_FAILED: u8 = 2;

/// Observed state of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// Work before the event is still running.
    Pending,
    /// All work before the event finished successfully.
    Complete,
    /// The queue hit an error before reaching the event.
    Failed(String),
}

struct EventInner {
    state: AtomicU8,
    error: Mutex<Option<String>>,
}

/// Completion marker recorded on a hardware queue.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: AtomicU8::new(EVENT_PENDING),
                error: Mutex::new(None),
            }),
        }
    }

    /// Query without blocking. Once non-pending, the result never changes.
    pub fn query(&self) -> EventStatus {
        match self.inner.state.load(Ordering::Acquire) {
            EVENT_PENDING => EventStatus::Pending,
            EVENT_COMPLETE => EventStatus::Complete,
            _ => EventStatus::Failed(
                self.inner
                    .error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        }
    }

    fn complete(&self, error: Option<String>) {
        match error {
            None => self.inner.state.store(EVENT_COMPLETE, Ordering::Release),
            Some(message) => {
                *self.inner.error.lock() = Some(message);
                self.inner.state.store(EVENT_FAILED, Ordering::Release);
            }
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("status", &self.query()).finish()
    }
}

enum HwOp {
    Kernel(Kernel),
    Record(Event),
}

struct QueueShared {
    ops: Mutex<VecDeque<HwOp>>,
    not_empty: Condvar,
    shutdown: AtomicBool,
    sticky_error: Mutex<Option<String>>,
    kernels_run: AtomicU64,
    kernels_skipped: AtomicU64,
    busy_ns: AtomicU64,
}

/// Counters for a hardware queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HwQueueStats {
    /// Kernels executed.
    pub kernels_run: u64,
    /// Kernels skipped because of a sticky error.
    pub kernels_skipped: u64,
    /// Time spent executing kernels.
    pub busy_ns: u64,
}

/// One simulated execution channel backed by a worker thread.
pub struct HwQueue {
    name: String,
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl HwQueue {
    /// Spawn the worker thread for a new queue.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let shared = Arc::new(QueueShared {
            ops: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sticky_error: Mutex::new(None),
            kernels_run: AtomicU64::new(0),
            kernels_skipped: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("hw-{}", name))
            .spawn(move || worker_loop(worker_shared))?;

        debug!(queue = %name, "Spawned hardware queue");

        Ok(Self {
            name,
            shared,
            worker: Some(worker),
        })
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a kernel. Returns immediately.
    pub fn enqueue(&self, kernel: Kernel) {
        self.push(HwOp::Kernel(kernel));
    }

    /// Record an event after all work enqueued so far.
    pub fn record_event(&self) -> Event {
        let event = Event::new();
        self.push(HwOp::Record(event.clone()));
        event
    }

    /// Error left by a failed kernel, if any.
    pub fn sticky_error(&self) -> Option<String> {
        self.shared.sticky_error.lock().clone()
    }

    /// Number of operations not yet processed.
    pub fn pending_ops(&self) -> usize {
        self.shared.ops.lock().len()
    }

    /// Queue counters.
    pub fn stats(&self) -> HwQueueStats {
        HwQueueStats {
            kernels_run: self.shared.kernels_run.load(Ordering::Relaxed),
            kernels_skipped: self.shared.kernels_skipped.load(Ordering::Relaxed),
            busy_ns: self.shared.busy_ns.load(Ordering::Relaxed),
        }
    }

    fn push(&self, op: HwOp) {
        self.shared.ops.lock().push_back(op);
        self.shared.not_empty.notify_one();
    }
}

impl Drop for HwQueue {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            // Take the lock so the worker cannot miss the wakeup.
            let _ops = self.shared.ops.lock();
            self.shared.not_empty.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(queue = %self.name, "Hardware queue worker panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<QueueShared>) {
    loop {
        let op = {
            let mut ops = shared.ops.lock();
            loop {
                if let Some(op) = ops.pop_front() {
                    break Some(op);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                shared.not_empty.wait(&mut ops);
            }
        };

        match op {
            None => return,
            Some(HwOp::Record(event)) => {
                let error = shared.sticky_error.lock().clone();
                event.complete(error);
            }
            Some(HwOp::Kernel(kernel)) => {
                if shared.sticky_error.lock().is_some() {
                    shared.kernels_skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let start = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(kernel));
                shared
                    .busy_ns
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                shared.kernels_run.fetch_add(1, Ordering::Relaxed);

                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("kernel panicked".to_string()),
                };
                if let Some(message) = failure {
                    let mut sticky = shared.sticky_error.lock();
                    if sticky.is_none() {
                        *sticky = Some(message);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmError;
    use std::time::Duration;

    fn wait_for(event: &Event) -> EventStatus {
        for _ in 0..10_000 {
            match event.query() {
                EventStatus::Pending => std::thread::sleep(Duration::from_micros(100)),
                other => return other,
            }
        }
        panic!("event never completed");
    }

    #[test]
    fn test_current_device() {
        std::thread::spawn(|| {
            assert_eq!(current_device(), None);
            set_device(3);
            assert_eq!(current_device(), Some(3));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_fifo_and_event() {
        let queue = HwQueue::spawn("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue(Box::new(move || {
                log.lock().push(i);
                Ok(())
            }));
        }
        let event = queue.record_event();

        assert_eq!(wait_for(&event), EventStatus::Complete);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.stats().kernels_run, 5);
    }

    #[test]
    fn test_event_waits_for_prior_work() {
        let queue = HwQueue::spawn("slow").unwrap();
        queue.enqueue(Box::new(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(())
        }));
        let event = queue.record_event();
        assert_eq!(event.query(), EventStatus::Pending);
        assert_eq!(wait_for(&event), EventStatus::Complete);
    }

    #[test]
    fn test_sticky_error() {
        let queue = HwQueue::spawn("failing").unwrap();
        let first = queue.record_event();
        queue.enqueue(Box::new(|| Err(VmError::kernel("illegal address"))));
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        queue.enqueue(Box::new(move || {
            ran_clone.store(true, Ordering::SeqCst);
            Ok(())
        }));
        let second = queue.record_event();

        assert_eq!(wait_for(&first), EventStatus::Complete);
        match wait_for(&second) {
            EventStatus::Failed(msg) => assert!(msg.contains("illegal address")),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.stats().kernels_skipped, 1);
        assert!(queue.sticky_error().is_some());

        // Completed events never flip back.
        assert_eq!(first.query(), EventStatus::Complete);
    }

    #[test]
    fn test_panic_becomes_error() {
        let queue = HwQueue::spawn("panicking").unwrap();
        queue.enqueue(Box::new(|| panic!("boom")));
        let event = queue.record_event();
        assert!(matches!(wait_for(&event), EventStatus::Failed(_)));
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let queue = HwQueue::spawn("drain").unwrap();
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                queue.enqueue(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
