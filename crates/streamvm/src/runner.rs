//! Dedicated scheduler thread.
//!
//! [`VmRunner`] moves a [`VirtualMachine`] behind a mutex and drives
//! [`VirtualMachine::tick`] from its own thread. Submission stays
//! synchronous; completion is observed through instruction handles, either
//! by polling, by a blocking poll-and-yield loop, or asynchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use streamvm_core::buffer::Buffer;
use streamvm_core::config::BackoffStrategy;
use streamvm_core::error::{Result, VmError};
use streamvm_core::instruction::{InstructionHandle, InstructionInfo, InstructionMsg};
use streamvm_core::metrics::VmMetrics;
use streamvm_core::scheduler::VirtualMachine;

struct RunnerShared {
    vm: Mutex<VirtualMachine>,
    stop: AtomicBool,
    terminated: AtomicBool,
    wake_lock: Mutex<bool>,
    wake: Condvar,
    poll_interval: Duration,
}

impl RunnerShared {
    fn notify(&self) {
        let mut pending = self.wake_lock.lock();
        *pending = true;
        self.wake.notify_one();
    }

    fn check_terminated(&self) -> Result<()> {
        if !self.terminated.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.vm.lock().fatal_error() {
            Some(err) => Err(VmError::Terminated(Box::new(err.clone()))),
            None => Err(VmError::ShutDown),
        }
    }

    fn pause(&self) {
        if self.poll_interval.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.poll_interval);
        }
    }
}

/// A virtual machine driven by a background scheduler thread.
pub struct VmRunner {
    shared: Arc<RunnerShared>,
    thread: Option<JoinHandle<()>>,
}

impl VmRunner {
    /// Start the scheduler thread for `vm`.
    pub fn spawn(vm: VirtualMachine) -> Result<Self> {
        let backoff = vm.config().idle_backoff.clone();
        let poll_interval = vm.config().poll_interval;
        let shared = Arc::new(RunnerShared {
            vm: Mutex::new(vm),
            stop: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            wake_lock: Mutex::new(false),
            wake: Condvar::new(),
            poll_interval,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("streamvm-scheduler".to_string())
            .spawn(move || scheduler_loop(thread_shared, backoff))
            .map_err(|e| VmError::InvalidConfig(format!("failed to spawn scheduler thread: {}", e)))?;

        info!("Scheduler thread started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Submit an instruction.
    pub fn enqueue(&self, msg: InstructionMsg) -> Result<InstructionHandle> {
        let handle = self.shared.vm.lock().enqueue(msg)?;
        self.shared.notify();
        Ok(handle)
    }

    /// Release a buffer once its accessors retire.
    pub fn release_buffer(&self, buffer: &Buffer) -> Result<()> {
        self.shared.vm.lock().release_buffer(buffer)
    }

    /// Whether the instruction completed.
    pub fn is_done(&self, handle: &InstructionHandle) -> bool {
        handle.is_done()
    }

    /// Poll and yield until the instruction completes.
    pub fn block_until_done(&self, handle: &InstructionHandle) -> Result<()> {
        while !handle.is_done() {
            self.shared.check_terminated()?;
            self.shared.pause();
        }
        Ok(())
    }

    /// Like [`VmRunner::block_until_done`] with a deadline.
    pub fn block_until_done_timeout(
        &self,
        handle: &InstructionHandle,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !handle.is_done() {
            self.shared.check_terminated()?;
            if Instant::now() >= deadline {
                return Err(VmError::Timeout(timeout));
            }
            self.shared.pause();
        }
        Ok(())
    }

    /// Wait for the instruction without blocking the async executor.
    pub async fn wait_done(&self, handle: &InstructionHandle) -> Result<()> {
        while !handle.is_done() {
            self.shared.check_terminated()?;
            if self.shared.poll_interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.shared.poll_interval).await;
            }
        }
        Ok(())
    }

    /// Snapshot of a live instruction.
    pub fn instruction_info(&self, handle: &InstructionHandle) -> Result<InstructionInfo> {
        self.shared.vm.lock().instruction_info(handle)
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> VmMetrics {
        self.shared.vm.lock().metrics()
    }

    /// Fatal error, if the VM terminated.
    pub fn fatal_error(&self) -> Option<VmError> {
        self.shared.vm.lock().fatal_error().cloned()
    }

    /// Run `f` with exclusive access to the VM.
    pub fn with_vm<R>(&self, f: impl FnOnce(&mut VirtualMachine) -> R) -> R {
        let result = {
            let mut vm = self.shared.vm.lock();
            f(&mut vm)
        };
        self.shared.notify();
        result
    }

    /// Refuse new work, drain in-flight instructions, stop the thread.
    ///
    /// Returns the error that terminated the VM, if any, as it was first
    /// raised rather than wrapped in [`VmError::Terminated`].
    pub fn shutdown(mut self) -> Result<()> {
        self.shared.vm.lock().request_shutdown();
        self.stop_thread();
        match self.shared.vm.lock().shutdown() {
            Err(VmError::Terminated(cause)) => Err(*cause),
            other => other,
        }
    }

    fn stop_thread(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.notify();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Scheduler thread panicked");
            }
        }
    }
}

impl Drop for VmRunner {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shared.vm.lock().request_shutdown();
            self.stop_thread();
        }
    }
}

impl std::fmt::Debug for VmRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRunner")
            .field("running", &self.thread.is_some())
            .field("terminated", &self.shared.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

fn scheduler_loop(shared: Arc<RunnerShared>, backoff: BackoffStrategy) {
    let mut idle_ticks: u32 = 0;
    loop {
        let (result, idle) = {
            let mut vm = shared.vm.lock();
            let result = vm.tick();
            (result, vm.is_idle())
        };

        match result {
            Err(err) => {
                shared.terminated.store(true, Ordering::Release);
                debug!(error = %err, "Scheduler thread stopping after fatal error");
                return;
            }
            Ok(report) if report.made_progress() => {
                idle_ticks = 0;
            }
            Ok(_) => {
                if idle && shared.stop.load(Ordering::Acquire) {
                    debug!("Scheduler thread drained");
                    return;
                }
                let delay = backoff.delay(idle_ticks);
                idle_ticks = idle_ticks.saturating_add(1);
                if delay.is_zero() {
                    std::thread::yield_now();
                } else if idle {
                    let mut pending = shared.wake_lock.lock();
                    if !*pending {
                        shared.wake.wait_for(&mut pending, delay);
                    }
                    *pending = false;
                } else {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
