//! Process-owned thread table.
//!
//! Threads are identified by stable integer handles resolved through this
//! table; kernel structures hold `Arc<Tcb>` clones only while a thread is
//! queued or blocked, so teardown never races a dangling cross-reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{KernelError, Result};
use crate::memory::GuestMemory;
use crate::sync::MUTEX_OWNER_MASK;
use crate::thread::{CoreMask, Tcb, ThreadHandle};
use crate::{lock_clean, Kernel};

/// Thread-creation request, as received from the loader / syscall layer.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSpawn {
    pub entry_point: u64,
    pub entry_arg: u64,
    pub stack_top: u64,
    pub priority: u8,
    pub ideal_core: u8,
    pub affinity: CoreMask,
}

/// One emulated guest process: its guest memory and its thread table.
pub struct Process {
    kernel: Arc<Kernel>,
    memory: Arc<dyn GuestMemory>,
    threads: Mutex<HashMap<u32, Arc<Tcb>>>,
    next_handle: AtomicU32,
}

impl Process {
    pub fn new(kernel: Arc<Kernel>, memory: Arc<dyn GuestMemory>) -> Self {
        Self {
            kernel,
            memory,
            threads: Mutex::new(HashMap::new()),
            // Handle 0 is the unowned mutex word.
            next_handle: AtomicU32::new(1),
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn memory(&self) -> &dyn GuestMemory {
        self.memory.as_ref()
    }

    /// Creates a TCB for a new guest thread. Malformed requests (priority
    /// outside the configured range, bad core, affinity selecting no valid
    /// core) are rejected here; the scheduler assumes validated inputs.
    pub fn create_thread(&self, spawn: ThreadSpawn) -> Result<Arc<Tcb>> {
        let config = self.kernel.config();
        if !config.priority_range.contains(spawn.priority) {
            return Err(KernelError::InvalidPriority {
                priority: spawn.priority,
                min: config.priority_range.min,
                max: config.priority_range.max,
            });
        }
        if spawn.ideal_core >= config.core_count {
            return Err(KernelError::InvalidCore {
                core: spawn.ideal_core,
                count: config.core_count,
            });
        }
        let usable = CoreMask(spawn.affinity.0 & CoreMask::all(config.core_count).0);
        if usable.is_empty() || !usable.contains(spawn.ideal_core) {
            return Err(KernelError::InvalidAffinity {
                mask: spawn.affinity.0,
            });
        }

        let raw = self.next_handle.fetch_add(1, Ordering::AcqRel);
        if raw & !MUTEX_OWNER_MASK != 0 {
            return Err(KernelError::InvalidConfig("thread handle space exhausted"));
        }
        let handle = ThreadHandle(raw);
        let tcb = Arc::new(Tcb::new(
            handle,
            spawn.entry_point,
            spawn.entry_arg,
            spawn.stack_top,
            spawn.priority,
            spawn.ideal_core,
            usable,
        ));
        lock_clean(&self.threads).insert(raw, Arc::clone(&tcb));
        debug!(thread = %handle, priority = spawn.priority, core = spawn.ideal_core, "created thread");
        Ok(tcb)
    }

    pub fn thread(&self, handle: ThreadHandle) -> Option<Arc<Tcb>> {
        lock_clean(&self.threads).get(&handle.0).cloned()
    }

    /// Priority-change syscall: updates the base priority, recomputes the
    /// effective priority (a donation from a still-blocked waiter survives
    /// the change), and repositions the thread in its queue.
    pub fn set_thread_priority(&self, handle: ThreadHandle, priority: u8) -> Result<()> {
        let config = self.kernel.config();
        if !config.priority_range.contains(priority) {
            return Err(KernelError::InvalidPriority {
                priority,
                min: config.priority_range.min,
                max: config.priority_range.max,
            });
        }
        let thread = self
            .thread(handle)
            .ok_or(KernelError::UnknownHandle { handle: handle.0 })?;
        thread.set_base_priority(priority);
        let donated = lock_clean(&thread.waiters)
            .iter()
            .filter(|t| !t.is_killed())
            .map(|t| t.priority())
            .min();
        thread.set_priority(donated.map_or(priority, |d| d.min(priority)));
        self.kernel.update_priority(&thread);
        Ok(())
    }

    /// Affinity-change syscall. The new mask takes effect at the thread's
    /// next pass through the scheduler (`load_balance`, or a park/wake cycle
    /// when no permitted core can take it right now).
    pub fn set_thread_affinity(&self, handle: ThreadHandle, affinity: CoreMask) -> Result<()> {
        let config = self.kernel.config();
        let usable = CoreMask(affinity.0 & CoreMask::all(config.core_count).0);
        if usable.is_empty() {
            return Err(KernelError::InvalidAffinity { mask: affinity.0 });
        }
        let thread = self
            .thread(handle)
            .ok_or(KernelError::UnknownHandle { handle: handle.0 })?;
        thread.set_affinity(usable);
        Ok(())
    }

    /// Kills a thread and tears down its scheduling entries. Safe while the
    /// target is blocked at any suspension point.
    pub fn kill_thread(&self, handle: ThreadHandle) -> Result<()> {
        let thread = self
            .thread(handle)
            .ok_or(KernelError::UnknownHandle { handle: handle.0 })?;
        self.kernel.kill_thread(&thread);
        Ok(())
    }

    /// Drops the table entry once the backing host thread is gone.
    pub fn reap_thread(&self, handle: ThreadHandle) -> Option<Arc<Tcb>> {
        lock_clean(&self.threads).remove(&handle.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;
    use crate::KernelConfig;

    fn process() -> Process {
        let kernel = Kernel::new(KernelConfig::default()).expect("default config");
        Process::new(kernel, Arc::new(FlatMemory::new(0, 0x1000)))
    }

    fn spawn(priority: u8, ideal_core: u8, affinity: CoreMask) -> ThreadSpawn {
        ThreadSpawn {
            entry_point: 0x8000,
            entry_arg: 0,
            stack_top: 0x10_0000,
            priority,
            ideal_core,
            affinity,
        }
    }

    #[test]
    fn create_thread_assigns_unique_handles() {
        let process = process();
        let a = process
            .create_thread(spawn(40, 0, CoreMask::all(4)))
            .unwrap();
        let b = process
            .create_thread(spawn(40, 0, CoreMask::all(4)))
            .unwrap();
        assert_ne!(a.handle, b.handle);
        assert_eq!(process.thread(a.handle).unwrap().handle, a.handle);
        assert!(process.thread(ThreadHandle(999)).is_none());
    }

    #[test]
    fn create_thread_validates_requests() {
        let process = process();
        assert!(matches!(
            process.create_thread(spawn(64, 0, CoreMask::all(4))),
            Err(KernelError::InvalidPriority { .. })
        ));
        assert!(matches!(
            process.create_thread(spawn(40, 7, CoreMask::all(4))),
            Err(KernelError::InvalidCore { .. })
        ));
        // Ideal core outside the affinity mask.
        assert!(matches!(
            process.create_thread(spawn(40, 0, CoreMask::single(2))),
            Err(KernelError::InvalidAffinity { .. })
        ));
        // Mask selecting only nonexistent cores.
        assert!(matches!(
            process.create_thread(spawn(40, 0, CoreMask(0xf0))),
            Err(KernelError::InvalidAffinity { .. })
        ));
    }

    #[test]
    fn widest_core_count_accepts_threads() {
        let config = KernelConfig {
            core_count: 64,
            preempt_priority: vec![59; 64],
            ..KernelConfig::default()
        };
        let kernel = Kernel::new(config).expect("64 cores is a valid config");
        let process = Process::new(kernel, Arc::new(FlatMemory::new(0, 0x1000)));
        let thread = process
            .create_thread(spawn(40, 63, CoreMask::all(64)))
            .unwrap();
        assert_eq!(thread.affinity(), CoreMask::all(64));
        assert_eq!(thread.core_id(), 63);
    }

    #[test]
    fn set_priority_keeps_live_donation() {
        let process = process();
        let owner = process
            .create_thread(spawn(40, 0, CoreMask::all(4)))
            .unwrap();
        let waiter = process
            .create_thread(spawn(5, 0, CoreMask::all(4)))
            .unwrap();
        lock_clean(&owner.waiters).push(Arc::clone(&waiter));

        process.set_thread_priority(owner.handle, 30).unwrap();
        assert_eq!(owner.base_priority(), 30);
        // The blocked priority-5 waiter still outranks the new base.
        assert_eq!(owner.priority(), 5);

        process.set_thread_priority(owner.handle, 3).unwrap();
        assert_eq!(owner.priority(), 3);
    }

    #[test]
    fn affinity_change_is_clamped_and_validated() {
        let process = process();
        let thread = process
            .create_thread(spawn(40, 0, CoreMask::all(4)))
            .unwrap();
        process
            .set_thread_affinity(thread.handle, CoreMask(0b0011))
            .unwrap();
        assert_eq!(thread.affinity(), CoreMask(0b0011));
        assert!(process
            .set_thread_affinity(thread.handle, CoreMask(0))
            .is_err());
    }

    #[test]
    fn reap_removes_table_entry() {
        let process = process();
        let thread = process
            .create_thread(spawn(40, 0, CoreMask::all(4)))
            .unwrap();
        process.kill_thread(thread.handle).unwrap();
        assert!(process.reap_thread(thread.handle).is_some());
        assert!(process.thread(thread.handle).is_none());
        assert!(process.kill_thread(thread.handle).is_err());
    }
}
