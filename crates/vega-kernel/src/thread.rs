use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use vega_platform::TimerId;

use crate::sync::WaitRecord;

/// Stable integer handle for a guest thread.
///
/// Handles are resolved through the process-owned table; kernel structures
/// never embed mutable cross-references to other TCBs except while a thread
/// is queued or blocked. The value also doubles as the owner field of a guest
/// mutex word, so it must fit in the word's low 30 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadHandle(pub u32);

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduler priority range. Lower numeric value means higher priority,
/// similar to niceness on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRange {
    /// Numerically lowest value, highest scheduler priority.
    pub min: u8,
    /// Numerically highest value, lowest scheduler priority.
    pub max: u8,
}

impl PriorityRange {
    /// A bitmask with one bit set per valid priority value.
    pub const fn mask(&self) -> u64 {
        (u64::MAX >> (63 - (self.max - self.min) as u32)) << self.min
    }

    pub const fn contains(&self, value: u8) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Set of emulated cores a thread is permitted to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreMask(pub u64);

impl CoreMask {
    pub const fn single(core: u8) -> Self {
        Self(1 << core)
    }

    /// Mask permitting every core below `count`. Saturates at 64 cores, the
    /// width of the mask.
    pub const fn all(count: u8) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn contains(&self, core: u8) -> bool {
        self.0 & (1 << core) != 0
    }

    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates the permitted core ids, lowest first.
    pub fn cores(&self) -> impl Iterator<Item = u8> + '_ {
        (0..64u8).filter(move |core| self.contains(*core))
    }
}

/// Thread lifecycle, driven exclusively by scheduler and sync-registry
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Created = 0,
    /// Queued on a core, not at the head.
    Ready = 1,
    /// Head of its core's queue; the backing host thread runs guest code.
    Running = 2,
    /// Blocked on a mutex, condition variable, or the parked set.
    Blocked = 3,
    Killed = 4,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Killed,
            _ => Self::Created,
        }
    }
}

/// Wait linkage while blocked on a guest mutex: the key address and the
/// owner handle the waiter observed when it queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitLink {
    pub address: u64,
    pub owner: ThreadHandle,
}

/// Per-guest-thread state.
///
/// Owned by the process; the scheduler and sync registry hold `Arc` clones
/// only while the thread is queued or blocked. All mutable state is either
/// atomic or behind its own lock so TCBs can be touched from any host thread.
pub struct Tcb {
    pub handle: ThreadHandle,
    /// Token the interrupt backend uses to target this thread's host thread.
    pub host_token: u64,

    pub entry_point: u64,
    pub entry_arg: u64,
    pub stack_top: u64,

    priority: AtomicU8,
    base_priority: AtomicU8,
    pub ideal_core: u8,
    affinity: AtomicU64,
    core_id: AtomicU8,
    /// Acquired before any core queue lock when migrating this thread.
    pub migration_lock: Mutex<()>,

    pub timeslice_start: AtomicU64,
    pub average_timeslice: AtomicU64,

    pub preempt_timer: Mutex<Option<TimerId>>,
    pub preempt_armed: AtomicBool,

    pub pending_yield: AtomicBool,
    pub force_yield: AtomicBool,
    /// Interrupt arrived before the host thread established kernel context.
    pub deferred_interrupt: AtomicBool,
    pub ctx_ready: AtomicBool,
    pub killed: AtomicBool,
    pub parked: AtomicBool,

    state: AtomicU8,
    pub wait_link: Mutex<Option<WaitLink>>,
    pub wait_record: Mutex<Option<Arc<WaitRecord>>>,
    /// Threads currently blocked on a mutex this thread owns, priority order.
    pub waiters: Mutex<Vec<Arc<Tcb>>>,
}

impl Tcb {
    pub fn new(
        handle: ThreadHandle,
        entry_point: u64,
        entry_arg: u64,
        stack_top: u64,
        priority: u8,
        ideal_core: u8,
        affinity: CoreMask,
    ) -> Self {
        Self {
            handle,
            host_token: handle.0 as u64,
            entry_point,
            entry_arg,
            stack_top,
            priority: AtomicU8::new(priority),
            base_priority: AtomicU8::new(priority),
            ideal_core,
            affinity: AtomicU64::new(affinity.0),
            core_id: AtomicU8::new(ideal_core),
            migration_lock: Mutex::new(()),
            timeslice_start: AtomicU64::new(0),
            average_timeslice: AtomicU64::new(0),
            preempt_timer: Mutex::new(None),
            preempt_armed: AtomicBool::new(false),
            pending_yield: AtomicBool::new(false),
            force_yield: AtomicBool::new(false),
            deferred_interrupt: AtomicBool::new(false),
            ctx_ready: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            state: AtomicU8::new(ThreadState::Created as u8),
            wait_link: Mutex::new(None),
            wait_record: Mutex::new(None),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Effective priority: base priority possibly raised by inheritance.
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Release);
    }

    /// Priority before any inheritance was applied.
    pub fn base_priority(&self) -> u8 {
        self.base_priority.load(Ordering::Acquire)
    }

    pub fn set_base_priority(&self, priority: u8) {
        self.base_priority.store(priority, Ordering::Release);
    }

    pub fn affinity(&self) -> CoreMask {
        CoreMask(self.affinity.load(Ordering::Acquire))
    }

    pub fn set_affinity(&self, mask: CoreMask) {
        self.affinity.store(mask.0, Ordering::Release);
    }

    pub fn core_id(&self) -> u8 {
        self.core_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_core_id(&self, core: u8) {
        self.core_id.store(core, Ordering::Release);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Priority comparator used by every insertion point: `true` iff a thread
    /// of `candidate` priority outranks `existing`. Insertions search for the
    /// first queued thread the candidate outranks, so equal priorities keep
    /// arrival order (round-robin fairness within a band).
    pub fn outranks(candidate: u8, existing: &Tcb) -> bool {
        candidate < existing.priority()
    }

    /// Folds the just-ended timeslice into the running average:
    /// one quarter old average, three quarters current duration.
    pub(crate) fn note_timeslice_end(&self, now: u64) {
        let start = self.timeslice_start.swap(0, Ordering::AcqRel);
        if start == 0 || now <= start {
            return;
        }
        let elapsed = now - start;
        let average = self.average_timeslice.load(Ordering::Acquire);
        self.average_timeslice
            .store(average / 4 + elapsed / 4 * 3, Ordering::Release);
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("handle", &self.handle)
            .field("priority", &self.priority())
            .field("core", &self.core_id())
            .field("affinity", &self.affinity())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
