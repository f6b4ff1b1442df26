//! HLE kernel core: priority-preemptive scheduling of guest threads over host
//! OS threads, plus guest-visible mutex/condition-variable emulation.
//!
//! One host thread backs each guest thread; only the thread at the head of
//! its emulated core's ready queue is logically running. Everything else is
//! blocked on a condition variable at one of the kernel's suspension points
//! (`wait_schedule`, `timed_wait_schedule`, mutex/condvar waits,
//! `park_thread`). Preemption is delivered as an asynchronous interrupt
//! through [`vega_platform::InterruptBackend`]; the scheduler only publishes
//! pending-yield state and never assumes a delivery mechanism.
//!
//! There is no global state: a [`Kernel`] is constructed once per emulated
//! process and passed explicitly through every operation.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod memory;
pub mod process;
pub mod sched;
pub mod sync;
pub mod thread;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use vega_platform::{HookInterrupts, InterruptBackend, MonotonicClock, TickSource, TimerQueue};

pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use memory::{FlatMemory, GuestMemory};
pub use process::{Process, ThreadSpawn};
pub use sched::CoreContext;
pub use sync::{WaitRecord, MUTEX_OWNER_MASK, MUTEX_WAITERS_BIT};
pub use thread::{CoreMask, PriorityRange, Tcb, ThreadHandle, ThreadState, WaitLink};

/// Explicit kernel context: cores, parked set, sync registry, and the
/// platform collaborators (tick source, timer queue, interrupt backend).
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) clock: Arc<dyn TickSource>,
    pub(crate) timers: Arc<TimerQueue>,
    pub(crate) interrupts: Arc<dyn InterruptBackend>,
    pub(crate) cores: Box<[CoreContext]>,
    pub(crate) parked: sched::ParkedSet,
    pub(crate) registry: sync::SyncRegistry,
}

impl Kernel {
    /// Builds a kernel with default platform pieces: a monotonic clock, a
    /// timer queue (not yet driven; see [`vega_platform::TimerDriver`]), and
    /// a hook-based interrupt backend.
    pub fn new(config: KernelConfig) -> Result<Arc<Self>> {
        let clock: Arc<dyn TickSource> = Arc::new(MonotonicClock::new());
        let timers = Arc::new(TimerQueue::new(Arc::clone(&clock)));
        Self::with_platform(config, clock, timers, Arc::new(HookInterrupts::new()))
    }

    pub fn with_platform(
        config: KernelConfig,
        clock: Arc<dyn TickSource>,
        timers: Arc<TimerQueue>,
        interrupts: Arc<dyn InterruptBackend>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let cores = (0..config.core_count)
            .map(|id| CoreContext::new(id, config.preempt_priority[id as usize]))
            .collect();
        Ok(Arc::new(Self {
            config,
            clock,
            timers,
            interrupts,
            cores,
            parked: sched::ParkedSet::new(),
            registry: sync::SyncRegistry::new(),
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn TickSource> {
        &self.clock
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    pub(crate) fn core(&self, id: u8) -> &CoreContext {
        &self.cores[id as usize]
    }

    /// Snapshot of a core's ready queue, head first. Diagnostic surface used
    /// by the syscall layer's debug queries and by tests.
    pub fn queue_order(&self, core: u8) -> Vec<ThreadHandle> {
        self.core(core).queue_order()
    }
}

/// Locks a mutex, recovering the data from a poisoned lock. A panicking host
/// thread must not wedge the whole emulated process.
pub(crate) fn lock_clean<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn wait_clean<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cv.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Returns the reacquired guard and whether the wait timed out.
pub(crate) fn wait_timeout_clean<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, bool) {
    match cv.wait_timeout(guard, timeout) {
        Ok((guard, result)) => (guard, result.timed_out()),
        Err(poisoned) => {
            let (guard, result) = poisoned.into_inner();
            (guard, result.timed_out())
        }
    }
}
