//! Guest mutex and condition-variable emulation.
//!
//! A guest mutex is a single word in guest memory: the owner's thread handle
//! in the low bits, a waiters flag at bit 30. Contended addresses map to
//! priority-ordered wait lists held in two global tables (one for mutexes,
//! one for condition variables), each behind its own lock, distinct from all
//! core locks. Neither table lock is ever held across a blocking wait.
//!
//! Handoff is two-phase: unlock only signals the highest-priority waiter's
//! record; the woken waiter dequeues itself and writes ownership into the
//! word on its own, so the registry lock never spans the rendezvous.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::Result;
use crate::process::Process;
use crate::thread::{Tcb, ThreadHandle, ThreadState, WaitLink};
use crate::{lock_clean, wait_clean, wait_timeout_clean, Kernel};

/// Set in the guest mutex word while the wait list is non-empty.
pub const MUTEX_WAITERS_BIT: u32 = 1 << 30;
/// Low bits of the guest mutex word holding the owner's thread handle.
pub const MUTEX_OWNER_MASK: u32 = MUTEX_WAITERS_BIT - 1;

/// Ephemeral descriptor for one blocking call, queued priority-ordered under
/// a guest address. The waiting thread removes its own record on wake or
/// timeout; a record never outlives its blocking call.
pub struct WaitRecord {
    pub handle: ThreadHandle,
    /// Priority snapshot taken when the wait began.
    pub priority: u8,
    signaled: Mutex<bool>,
    wake: Condvar,
}

impl WaitRecord {
    fn new(thread: &Tcb) -> Self {
        Self {
            handle: thread.handle,
            priority: thread.priority(),
            signaled: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        *lock_clean(&self.signaled) = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_signaled(&self) -> bool {
        *lock_clean(&self.signaled)
    }

    /// Kill path: wake the waiter without signaling; its predicate rechecks
    /// the kill flag.
    pub(crate) fn interrupt(&self) {
        self.wake.notify_all();
    }

    fn wait(&self, thread: &Tcb) -> bool {
        let mut signaled = lock_clean(&self.signaled);
        while !*signaled && !thread.is_killed() {
            signaled = wait_clean(&self.wake, signaled);
        }
        *signaled
    }

    fn wait_timeout(&self, thread: &Tcb, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = lock_clean(&self.signaled);
        loop {
            if *signaled {
                return true;
            }
            if thread.is_killed() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return *signaled;
            }
            let (reacquired, _) = wait_timeout_clean(&self.wake, signaled, deadline - now);
            signaled = reacquired;
        }
    }
}

type WaitTable = Mutex<HashMap<u64, Vec<Arc<WaitRecord>>>>;

pub(crate) struct SyncRegistry {
    mutexes: WaitTable,
    condvars: WaitTable,
}

impl SyncRegistry {
    pub(crate) fn new() -> Self {
        Self {
            mutexes: Mutex::new(HashMap::new()),
            condvars: Mutex::new(HashMap::new()),
        }
    }
}

fn insert_by_priority(list: &mut Vec<Arc<WaitRecord>>, record: Arc<WaitRecord>) {
    let position = list
        .iter()
        .position(|r| record.priority < r.priority)
        .unwrap_or(list.len());
    list.insert(position, record);
}

impl Kernel {
    /// Attempts to lock the guest mutex at `address` for `thread`.
    ///
    /// Returns `Ok(true)` once the word holds the thread's handle. Returns
    /// `Ok(false)` when the caller should retry: the word's owner did not
    /// match `owner` (stale view, unless `force_steal`), a racing claim beat
    /// the caller, or the thread was killed while waiting. This mirrors the
    /// guest-side retry loop around the lock syscall, which tolerates
    /// spurious wakes by re-reading the word.
    pub fn mutex_lock(
        self: &Arc<Self>,
        process: &Process,
        thread: &Arc<Tcb>,
        address: u64,
        owner: ThreadHandle,
        force_steal: bool,
    ) -> Result<bool> {
        let memory = process.memory();
        let me = thread.handle.0;

        // Fast path: claim an unowned word with a single atomic CAS.
        if memory.compare_exchange_u32(address, 0, me)? {
            return Ok(true);
        }

        let record = Arc::new(WaitRecord::new(thread));
        let owner_tcb;
        {
            let mut tables = lock_clean(&self.registry.mutexes);
            let word = memory.load_u32(address)?;
            let current_owner = word & MUTEX_OWNER_MASK;
            if current_owner == 0 {
                // Released between the fast path and taking the table lock.
                let waiters = tables.get(&address).is_some_and(|l| !l.is_empty());
                let claim = me | if waiters { MUTEX_WAITERS_BIT } else { 0 };
                return memory.compare_exchange_u32(address, word, claim);
            }
            if current_owner != owner.0 && !force_steal {
                return Ok(false);
            }
            // Publish contention so guest-side fast paths see it.
            if word & MUTEX_WAITERS_BIT == 0 {
                memory.store_u32(address, word | MUTEX_WAITERS_BIT)?;
            }

            insert_by_priority(tables.entry(address).or_default(), Arc::clone(&record));
            *lock_clean(&thread.wait_record) = Some(Arc::clone(&record));
            *lock_clean(&thread.wait_link) = Some(WaitLink {
                address,
                owner: ThreadHandle(current_owner),
            });
            thread.set_state(ThreadState::Blocked);
            owner_tcb = process.thread(ThreadHandle(current_owner));
        }

        // Priority inheritance, outside the table lock: raising the owner
        // may reposition it in a core queue.
        if let Some(owner_tcb) = &owner_tcb {
            {
                let mut waiters = lock_clean(&owner_tcb.waiters);
                if !waiters.iter().any(|t| t.handle == thread.handle) {
                    let position = waiters
                        .iter()
                        .position(|t| Tcb::outranks(thread.priority(), t))
                        .unwrap_or(waiters.len());
                    waiters.insert(position, Arc::clone(thread));
                }
            }
            if thread.priority() < owner_tcb.priority() {
                trace!(owner = %owner_tcb.handle, boosted_to = thread.priority(), "priority inheritance");
                owner_tcb.set_priority(thread.priority());
                self.update_priority(owner_tcb);
            }
        }

        let woke_signaled = record.wait(thread);

        let mut tables = lock_clean(&self.registry.mutexes);
        // Unlock signals the front under this lock, so once it is held the
        // record's signaled state is final: a handoff racing a kill cannot
        // slip in after the check below.
        let signaled = woke_signaled || record.is_signaled();
        let mut has_waiters = false;
        let mut remaining = Vec::new();
        if let Some(list) = tables.get_mut(&address) {
            list.retain(|r| !Arc::ptr_eq(r, &record));
            has_waiters = !list.is_empty();
            if signaled {
                remaining = list.clone();
            }
            if list.is_empty() {
                tables.remove(&address);
            }
        }
        *lock_clean(&thread.wait_record) = None;
        *lock_clean(&thread.wait_link) = None;
        if !signaled || thread.is_killed() {
            // A handoff that landed just as this thread died must be passed
            // on, or the word keeps naming an owner that already released it
            // and the other waiters never wake.
            if signaled {
                match remaining.first() {
                    Some(next) => next.signal(),
                    None => memory.store_u32(address, 0)?,
                }
            }
            return Ok(false);
        }

        // Two-phase handoff: the previous owner only signaled this record;
        // ownership is written here by the waiter itself.
        memory.store_u32(address, me | if has_waiters { MUTEX_WAITERS_BIT } else { 0 })?;
        drop(tables);

        // The remaining waiters on this address now wait on us.
        for rec in remaining {
            if let Some(waiter) = process.thread(rec.handle) {
                let mut waiters = lock_clean(&thread.waiters);
                if !waiters.iter().any(|t| t.handle == waiter.handle) {
                    let position = waiters
                        .iter()
                        .position(|t| Tcb::outranks(rec.priority, t))
                        .unwrap_or(waiters.len());
                    waiters.insert(position, waiter);
                }
            }
        }
        Ok(true)
    }

    /// Unlocks the guest mutex at `address`. Fails (with no side effects)
    /// unless the word's owner field matches the calling thread.
    pub fn mutex_unlock(
        self: &Arc<Self>,
        process: &Process,
        thread: &Arc<Tcb>,
        address: u64,
    ) -> Result<bool> {
        let memory = process.memory();
        {
            let mut tables = lock_clean(&self.registry.mutexes);
            let word = memory.load_u32(address)?;
            if word & MUTEX_OWNER_MASK != thread.handle.0 {
                return Ok(false);
            }
            // Signal under the table lock: picking the front record and a
            // waiter's withdrawal are serialized, so a signal never lands on
            // a record that already gave up.
            match tables.get(&address).and_then(|list| list.first().cloned()) {
                Some(front) => {
                    trace!(address, to = %front.handle, "mutex handoff");
                    front.signal();
                }
                None => {
                    memory.store_u32(address, 0)?;
                    tables.remove(&address);
                }
            }
        }

        // Drop inheritance donated by waiters on this address and restore
        // the effective priority.
        {
            let mut waiters = lock_clean(&thread.waiters);
            waiters.retain(|t| {
                // Killed waiters never dequeue themselves; drop them too.
                !t.is_killed()
                    && match *lock_clean(&t.wait_link) {
                        Some(link) => link.address != address,
                        None => true,
                    }
            });
        }
        let donated = lock_clean(&thread.waiters)
            .iter()
            .map(|t| t.priority())
            .min();
        let base = thread.base_priority();
        let effective = donated.map_or(base, |d| d.min(base));
        if effective != thread.priority() {
            thread.set_priority(effective);
            self.update_priority(thread);
        }
        Ok(true)
    }

    /// Queues the calling thread on the condition variable at `address` and
    /// waits up to `timeout`. Returns whether it was signaled (`true`) or
    /// timed out / was killed (`false`); the record is removed on either
    /// outcome.
    pub fn condvar_wait(&self, thread: &Arc<Tcb>, address: u64, timeout: Duration) -> bool {
        let record = Arc::new(WaitRecord::new(thread));
        {
            let mut tables = lock_clean(&self.registry.condvars);
            insert_by_priority(tables.entry(address).or_default(), Arc::clone(&record));
        }
        *lock_clean(&thread.wait_record) = Some(Arc::clone(&record));
        thread.set_state(ThreadState::Blocked);

        let signaled = record.wait_timeout(thread, timeout);

        {
            let mut tables = lock_clean(&self.registry.condvars);
            if let Some(list) = tables.get_mut(&address) {
                list.retain(|r| !Arc::ptr_eq(r, &record));
                if list.is_empty() {
                    tables.remove(&address);
                }
            }
        }
        *lock_clean(&thread.wait_record) = None;
        signaled && !thread.is_killed()
    }

    /// Signals the `min(count, waiters)` highest-priority waiters on the
    /// condition variable at `address`, leaving the rest queued. Returns how
    /// many records were signaled.
    pub fn condvar_signal(&self, address: u64, count: usize) -> usize {
        let to_wake: Vec<Arc<WaitRecord>> = {
            let tables = lock_clean(&self.registry.condvars);
            match tables.get(&address) {
                Some(list) => list
                    .iter()
                    .filter(|r| !r.is_signaled())
                    .take(count)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };
        let woken = to_wake.len();
        for record in to_wake {
            record.signal();
        }
        woken
    }

    /// Wait-list snapshot for a mutex address, priority order. Diagnostic
    /// surface for the syscall layer and tests.
    pub fn mutex_waiters(&self, address: u64) -> Vec<ThreadHandle> {
        lock_clean(&self.registry.mutexes)
            .get(&address)
            .map(|list| list.iter().map(|r| r.handle).collect())
            .unwrap_or_default()
    }

    /// Wait-list snapshot for a condition-variable address, priority order.
    pub fn condvar_waiters(&self, address: u64) -> Vec<ThreadHandle> {
        lock_clean(&self.registry.condvars)
            .get(&address)
            .map(|list| list.iter().map(|r| r.handle).collect())
            .unwrap_or_default()
    }
}
