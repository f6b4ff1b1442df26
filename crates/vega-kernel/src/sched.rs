//! Per-core ready queues and the scheduling operations over them.
//!
//! Each emulated core owns a priority-ordered queue of TCBs guarded by its
//! own lock, with a "front changed" condition the queue's threads block on.
//! Within one core, threads are served in strict priority order with FIFO
//! fairness inside a priority band; across cores there is no global ordering.
//! A thread's migration between cores is serialized by its own migration
//! lock, acquired before any core lock.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::{debug, trace};
use vega_platform::HostThreadId;

use crate::error::{KernelError, Result};
use crate::thread::{Tcb, ThreadHandle, ThreadState};
use crate::{lock_clean, wait_clean, wait_timeout_clean, Kernel};

/// One emulated CPU core.
pub struct CoreContext {
    pub id: u8,
    /// Priority at which the core enforces a preemption quantum on its
    /// running thread.
    pub preempt_priority: u8,
    queue: Mutex<VecDeque<Arc<Tcb>>>,
    front_changed: Condvar,
}

impl CoreContext {
    pub(crate) fn new(id: u8, preempt_priority: u8) -> Self {
        Self {
            id,
            preempt_priority,
            queue: Mutex::new(VecDeque::new()),
            front_changed: Condvar::new(),
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Tcb>>> {
        lock_clean(&self.queue)
    }

    pub(crate) fn queue_order(&self) -> Vec<ThreadHandle> {
        self.lock_queue().iter().map(|t| t.handle).collect()
    }
}

/// Threads temporarily unscheduled because no permitted core can take them.
pub(crate) struct ParkedSet {
    list: Mutex<Vec<Arc<Tcb>>>,
    wake: Condvar,
}

impl ParkedSet {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            wake: Condvar::new(),
        }
    }
}

fn is_front(queue: &VecDeque<Arc<Tcb>>, thread: &Tcb) -> bool {
    queue.front().map(|t| t.handle) == Some(thread.handle)
}

impl Kernel {
    /// Inserts a TCB into its assigned core's queue at its priority-ordered
    /// position, after existing threads of equal priority. If the insertion
    /// takes the head from a previously queued thread, that thread is marked
    /// pending-yield and interrupted so it relinquishes the core promptly.
    pub fn insert_thread(&self, thread: &Arc<Tcb>) {
        let core = self.core(thread.core_id());
        let displaced = {
            let mut queue = core.lock_queue();
            if queue.iter().any(|t| t.handle == thread.handle) {
                return;
            }
            let position = queue
                .iter()
                .position(|t| Tcb::outranks(thread.priority(), t))
                .unwrap_or(queue.len());
            let displaced = if position == 0 {
                queue.front().cloned()
            } else {
                None
            };
            queue.insert(position, Arc::clone(thread));
            thread.set_state(ThreadState::Ready);
            displaced
        };
        core.front_changed.notify_all();
        if let Some(previous) = displaced {
            trace!(core = core.id, thread = %thread.handle, displaced = %previous.handle, "insert displaced head");
            self.send_yield(&previous);
        }
    }

    /// Removes a thread from its core's queue. Removing an absent thread is
    /// a no-op. Leaving the head updates the thread's timeslice average and
    /// wakes the new head.
    pub fn remove_thread(&self, thread: &Arc<Tcb>) {
        self.disarm_preemption(thread);
        let core = self.core(thread.core_id());
        let was_head = {
            let mut queue = core.lock_queue();
            let Some(position) = queue.iter().position(|t| t.handle == thread.handle) else {
                return;
            };
            queue.remove(position);
            position == 0
        };
        if was_head {
            thread.note_timeslice_end(self.clock.now_ticks());
        }
        core.front_changed.notify_all();
    }

    /// Blocks the calling thread until it reaches the head of its core's
    /// queue. This is the kernel's principal suspension point: a thread
    /// blocked here is off-CPU from the guest's perspective.
    ///
    /// With `load_balance` and a multi-core affinity, the wait escalates:
    /// starting at twice the preemption quantum and doubling on each expiry,
    /// every timeout triggers a balancing pass (possibly migrating to a core
    /// expected to schedule the thread sooner) before re-waiting.
    ///
    /// Returns `false` only if the thread was killed while waiting.
    pub fn wait_schedule(self: &Arc<Self>, thread: &Arc<Tcb>, load_balance: bool) -> bool {
        let mut core = self.core(thread.core_id());
        let mut queue = core.lock_queue();
        if load_balance && thread.affinity().count() > 1 {
            let mut patience = self.config.preempt_quantum * 2;
            loop {
                if thread.is_killed() {
                    return false;
                }
                if is_front(&queue, thread) {
                    break;
                }
                let (reacquired, timed_out) =
                    wait_timeout_clean(&core.front_changed, queue, patience);
                queue = reacquired;
                if thread.is_killed() {
                    return false;
                }
                if is_front(&queue, thread) {
                    break;
                }
                if timed_out {
                    drop(queue);
                    self.load_balance(thread, true);
                    core = self.core(thread.core_id());
                    queue = core.lock_queue();
                    // Minimize pointless rebalancing within one invocation.
                    patience *= 2;
                }
            }
        } else {
            loop {
                if thread.is_killed() {
                    return false;
                }
                if is_front(&queue, thread) {
                    break;
                }
                queue = wait_clean(&core.front_changed, queue);
            }
        }
        drop(queue);
        self.became_head(thread, core, true);
        true
    }

    /// Head-of-queue wait with a single fixed timeout and no load balancing.
    /// Returns `true` once scheduled, `false` on timeout or kill.
    ///
    /// No preemption quantum is armed on this path: bounded waiters run only
    /// briefly at the head and re-enter [`Kernel::wait_schedule`] for an
    /// open-ended slice, which arms the timer at threshold priority.
    pub fn timed_wait_schedule(
        self: &Arc<Self>,
        thread: &Arc<Tcb>,
        timeout: std::time::Duration,
    ) -> bool {
        let core = self.core(thread.core_id());
        let deadline = Instant::now() + timeout;
        let mut queue = core.lock_queue();
        loop {
            if thread.is_killed() {
                return false;
            }
            if is_front(&queue, thread) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (reacquired, _) = wait_timeout_clean(&core.front_changed, queue, deadline - now);
            queue = reacquired;
        }
        drop(queue);
        self.became_head(thread, core, false);
        true
    }

    fn became_head(self: &Arc<Self>, thread: &Arc<Tcb>, core: &CoreContext, arm: bool) {
        if arm && thread.priority() == core.preempt_priority {
            self.arm_preemption(thread);
        }
        thread
            .timeslice_start
            .store(self.clock.now_ticks(), Ordering::Release);
        thread.set_state(ThreadState::Running);
    }

    /// Round-robin yield from the head of the queue: splices the thread to
    /// the back and charges the elapsed timeslice to its running average.
    ///
    /// Calling this from a thread that is neither at the head nor
    /// force-yielded indicates scheduler state corruption and is fatal to the
    /// owning process context.
    pub fn rotate(&self, thread: &Arc<Tcb>, cooperative: bool) -> Result<()> {
        let core = self.core(thread.core_id());
        {
            let mut queue = core.lock_queue();
            let position = queue.iter().position(|t| t.handle == thread.handle);
            let forced = thread.force_yield.swap(false, Ordering::AcqRel);
            match position {
                Some(0) => {
                    thread.note_timeslice_end(self.clock.now_ticks());
                    if let Some(front) = queue.pop_front() {
                        queue.push_back(front);
                    }
                    thread.set_state(ThreadState::Ready);
                }
                // A force-yielded thread may already have been displaced (or
                // removed by a kill) while the interrupt was in flight.
                Some(_) | None if forced => {}
                _ => {
                    return Err(KernelError::InvariantViolated {
                        op: "rotate",
                        thread: thread.handle.0,
                    });
                }
            }
        }
        thread.pending_yield.store(false, Ordering::Release);
        if cooperative && thread.preempt_armed.load(Ordering::Acquire) {
            // A voluntary yield forfeits the slice; no need to cut it off.
            self.disarm_preemption(thread);
        }
        core.front_changed.notify_all();
        Ok(())
    }

    /// Re-evaluates a thread's queue position after its priority changed.
    pub fn update_priority(self: &Arc<Self>, thread: &Arc<Tcb>) {
        let core = self.core(thread.core_id());
        let mut interrupt: Option<Arc<Tcb>> = None;
        let mut rearm = false;
        let mut disarm = false;
        {
            let mut queue = core.lock_queue();
            let Some(position) = queue.iter().position(|t| t.handle == thread.handle) else {
                // Not queued; the new priority takes effect on next insert.
                return;
            };
            if position == 0 {
                // Only force the head off if the thread right behind it now
                // outranks it; otherwise just keep the quantum honest.
                if queue
                    .get(1)
                    .map(|next| next.priority() < thread.priority())
                    .unwrap_or(false)
                {
                    interrupt = Some(Arc::clone(thread));
                } else if thread.priority() == core.preempt_priority {
                    rearm = true;
                } else {
                    disarm = true;
                }
            } else {
                queue.remove(position);
                let new_position = queue
                    .iter()
                    .position(|t| Tcb::outranks(thread.priority(), t))
                    .unwrap_or(queue.len());
                if new_position == 0 {
                    interrupt = queue.front().cloned();
                }
                queue.insert(new_position, Arc::clone(thread));
            }
        }
        core.front_changed.notify_all();
        if rearm {
            self.disarm_preemption(thread);
            self.arm_preemption(thread);
        }
        if disarm {
            self.disarm_preemption(thread);
        }
        if let Some(target) = interrupt {
            trace!(thread = %thread.handle, interrupted = %target.handle, "priority change displaced head");
            self.send_yield(&target);
        }
    }

    /// Migrates a thread to the permitted core expected to schedule it the
    /// soonest, preferring the current core on ties (migration is not free).
    /// Returns the chosen core id, always within the affinity mask. With
    /// `always_insert`, a migrated thread is re-queued on the new core.
    pub fn load_balance(&self, thread: &Arc<Tcb>, always_insert: bool) -> u8 {
        let _migration = lock_clean(&thread.migration_lock);
        let current = thread.core_id();
        let affinity = thread.affinity();
        if affinity.count() <= 1 {
            trace!(thread = %thread.handle, core = current, "load balance: pinned");
            return current;
        }
        if self.core(current).lock_queue().is_empty() {
            trace!(thread = %thread.handle, core = current, "load balance: current core idle");
            return current;
        }

        let now = self.clock.now_ticks();
        let priority = thread.priority();
        let mut best = current;
        let mut best_wait = u64::MAX;
        for candidate in affinity.cores() {
            if candidate >= self.config.core_count {
                break;
            }
            let wait = self.estimate_wait(candidate, priority, thread.handle, now);
            if wait < best_wait || (wait == best_wait && candidate == current) {
                best = candidate;
                best_wait = wait;
            }
        }

        if best != current {
            let old = self.core(current);
            {
                let mut queue = old.lock_queue();
                queue.retain(|t| t.handle != thread.handle);
            }
            old.front_changed.notify_all();
            thread.set_core_id(best);
            debug!(thread = %thread.handle, from = current, to = best, estimate = best_wait, "load balanced");
            if always_insert {
                self.insert_thread(thread);
            }
        }
        best
    }

    /// Wall-time estimate until a thread of `priority` would reach the head
    /// of `core_id`: the running thread's remaining slice plus the average
    /// timeslice (defaulting to one tick without history) of every resident
    /// thread of equal or higher priority.
    fn estimate_wait(&self, core_id: u8, priority: u8, exclude: ThreadHandle, now: u64) -> u64 {
        let queue = self.core(core_id).lock_queue();
        let mut residents = queue.iter().filter(|t| t.handle != exclude);
        let Some(front) = residents.next() else {
            return 0;
        };
        let average = front.average_timeslice.load(Ordering::Acquire);
        let started = front.timeslice_start.load(Ordering::Acquire);
        let mut wait = if average != 0 {
            average.saturating_sub(now.saturating_sub(started)).max(1)
        } else if started != 0 {
            now.saturating_sub(started)
        } else {
            1
        };
        for resident in residents {
            if resident.priority() <= priority {
                let avg = resident.average_timeslice.load(Ordering::Acquire);
                wait += if avg != 0 { avg } else { 1 };
            }
        }
        wait
    }

    /// Unschedules the calling thread because no permitted core can take it,
    /// and blocks until another thread wakes it (or it is killed). On wake
    /// the thread re-queues itself on the core chosen by the waker; the
    /// caller then proceeds to `wait_schedule`.
    pub fn park_thread(&self, thread: &Arc<Tcb>) -> bool {
        self.remove_thread(thread);
        debug!(thread = %thread.handle, "parked");
        let mut list = lock_clean(&self.parked.list);
        let position = list
            .iter()
            .position(|t| Tcb::outranks(thread.priority(), t))
            .unwrap_or(list.len());
        list.insert(position, Arc::clone(thread));
        thread.parked.store(true, Ordering::Release);
        thread.set_state(ThreadState::Blocked);
        while thread.parked.load(Ordering::Acquire) && !thread.is_killed() {
            list = wait_clean(&self.parked.wake, list);
        }
        if thread.is_killed() {
            list.retain(|t| t.handle != thread.handle);
            thread.parked.store(false, Ordering::Release);
            return false;
        }
        drop(list);
        self.insert_thread(thread);
        true
    }

    /// Considers waking the highest-priority parked thread onto the caller's
    /// core. Wakes it only if that does not regress the caller's own
    /// scheduling outcome: the parked thread must strictly outrank the
    /// caller, or match it with an earlier timeslice start.
    pub fn wake_parked_thread(&self, caller: &Arc<Tcb>) {
        let woken = {
            let mut list = lock_clean(&self.parked.list);
            let Some(best) = list.first() else {
                return;
            };
            let earlier_start = best.timeslice_start.load(Ordering::Acquire)
                < caller.timeslice_start.load(Ordering::Acquire);
            let favorable = best.priority() < caller.priority()
                || (best.priority() == caller.priority() && earlier_start);
            if !favorable {
                return;
            }
            let thread = list.remove(0);
            thread.set_core_id(caller.core_id());
            thread.parked.store(false, Ordering::Release);
            thread
        };
        debug!(thread = %woken.handle, core = caller.core_id(), "woke parked thread");
        self.parked.wake.notify_all();
    }

    /// Asynchronous-interrupt entry point, invoked on the host thread being
    /// preempted (signal handler, suspend hook, ...). Before the thread has
    /// established kernel context the interrupt is deferred via a flag it
    /// observes in [`Kernel::begin_context`]; otherwise the thread is rotated
    /// off the head non-cooperatively and blocks until rescheduled.
    pub fn preempt_entry(self: &Arc<Self>, thread: &Arc<Tcb>) -> Result<bool> {
        if !thread.ctx_ready.load(Ordering::Acquire) {
            thread.deferred_interrupt.store(true, Ordering::Release);
            return Ok(true);
        }
        thread.force_yield.store(true, Ordering::Release);
        // The quantum belongs to the head: stop the periodic timer here and
        // let `became_head` arm a fresh one on the next slice.
        self.disarm_preemption(thread);
        self.rotate(thread, false)?;
        Ok(self.wait_schedule(thread, true))
    }

    /// Marks the calling host thread's kernel context as established.
    /// Returns `true` if an interrupt arrived earlier and was deferred; the
    /// caller must then treat it as a pending yield.
    pub fn begin_context(&self, thread: &Arc<Tcb>) -> bool {
        thread.ctx_ready.store(true, Ordering::Release);
        thread.deferred_interrupt.swap(false, Ordering::AcqRel)
    }

    /// Forcibly tears down a thread's scheduling state. Safe to call while
    /// the target is blocked at any suspension point; every blocking
    /// predicate rechecks the kill flag. Idempotent.
    pub fn kill_thread(&self, thread: &Arc<Tcb>) {
        if thread.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(thread = %thread.handle, "killing thread");
        self.remove_thread(thread);
        thread.set_state(ThreadState::Killed);
        // Wake every suspension point the thread might be blocked at.
        for core in self.cores.iter() {
            core.front_changed.notify_all();
        }
        self.parked.wake.notify_all();
        let record = lock_clean(&thread.wait_record).clone();
        if let Some(record) = record {
            record.interrupt();
        }
        self.interrupts.deliver(HostThreadId(thread.host_token));
    }

    /// Publishes pending-yield state on the target and delivers an
    /// asynchronous interrupt to its host thread. Delivery before the target
    /// establishes context is deferred via a flag instead.
    pub(crate) fn send_yield(&self, thread: &Arc<Tcb>) {
        thread.pending_yield.store(true, Ordering::Release);
        if !thread.ctx_ready.load(Ordering::Acquire) {
            thread.deferred_interrupt.store(true, Ordering::Release);
            return;
        }
        self.interrupts.deliver(HostThreadId(thread.host_token));
    }

    pub(crate) fn arm_preemption(self: &Arc<Self>, thread: &Arc<Tcb>) {
        if thread.preempt_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let quantum = self.config.quantum_ticks();
        let deadline = self.clock.now_ticks() + quantum;
        let kernel = Arc::downgrade(self);
        let target = Arc::downgrade(thread);
        let id = self.timers.arm(
            deadline,
            Some(quantum),
            Box::new(move || {
                let (Some(kernel), Some(thread)) = (kernel.upgrade(), target.upgrade()) else {
                    return;
                };
                if thread.preempt_armed.load(Ordering::Acquire) && !thread.is_killed() {
                    trace!(thread = %thread.handle, "preemption quantum expired");
                    kernel.send_yield(&thread);
                }
            }),
        );
        *lock_clean(&thread.preempt_timer) = Some(id);
    }

    pub(crate) fn disarm_preemption(&self, thread: &Arc<Tcb>) {
        thread.preempt_armed.store(false, Ordering::Release);
        let id = lock_clean(&thread.preempt_timer).take();
        if let Some(id) = id {
            self.timers.disarm(id);
        }
    }
}
