use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::TickSource;

pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Identifies an armed timer. Stale ids are harmless: disarming a timer that
/// already fired (one-shot) or was disarmed is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Armed {
    deadline: u64,
    /// Re-arm interval in ticks; `None` for one-shot timers.
    period: Option<u64>,
    /// Taken out while the callback is running so it executes without the
    /// queue lock held. A disarm during that window removes the entry and the
    /// callback is dropped instead of being put back.
    callback: Option<TimerCallback>,
}

struct Inner {
    next_id: u64,
    timers: HashMap<u64, Armed>,
    shutdown: bool,
}

/// Armed-deadline queue over a [`TickSource`].
///
/// The map is scanned linearly; the kernel arms at most one preemption timer
/// per guest thread, so the population stays small.
pub struct TimerQueue {
    clock: Arc<dyn TickSource>,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl TimerQueue {
    pub fn new(clock: Arc<dyn TickSource>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                next_id: 0,
                timers: HashMap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arms a timer for `deadline` ticks. With `period`, the timer re-arms
    /// itself `period` ticks after each fire until disarmed.
    pub fn arm(&self, deadline: u64, period: Option<u64>, callback: TimerCallback) -> TimerId {
        let mut inner = self.lock_inner();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.timers.insert(
            id,
            Armed {
                deadline,
                // A zero period would spin poll() forever.
                period: period.map(|p| p.max(1)),
                callback: Some(callback),
            },
        );
        self.wake.notify_all();
        TimerId(id)
    }

    /// Disarms a timer. Idempotent; a disarmed timer never fires again even
    /// if its deadline already passed.
    pub fn disarm(&self, id: TimerId) {
        let mut inner = self.lock_inner();
        inner.timers.remove(&id.0);
        self.wake.notify_all();
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        let inner = self.lock_inner();
        inner.timers.values().map(|t| t.deadline).min()
    }

    /// Fires every due timer and returns how many fired. A periodic timer
    /// whose deadline lags several periods behind fires once per elapsed
    /// period. Callbacks run without the queue lock held.
    pub fn poll(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.clock.now_ticks();
            let taken = {
                let mut inner = self.lock_inner();
                let due = inner
                    .timers
                    .iter()
                    .filter(|(_, t)| t.deadline <= now && t.callback.is_some())
                    .min_by_key(|(_, t)| t.deadline)
                    .map(|(id, _)| *id);
                match due {
                    Some(id) => match inner.timers.get_mut(&id) {
                        Some(entry) => {
                            let callback = entry.callback.take();
                            match entry.period {
                                Some(period) => entry.deadline += period,
                                None => {
                                    inner.timers.remove(&id);
                                }
                            }
                            callback.map(|cb| (id, cb))
                        }
                        None => None,
                    },
                    None => None,
                }
            };

            let Some((id, mut callback)) = taken else {
                return fired;
            };
            callback();
            fired += 1;

            let mut inner = self.lock_inner();
            if let Some(entry) = inner.timers.get_mut(&id) {
                entry.callback = Some(callback);
            }
        }
    }

    fn run_driver(&self) {
        loop {
            self.poll();
            let inner = self.lock_inner();
            if inner.shutdown {
                return;
            }
            let now = self.clock.now_ticks();
            let next = inner.timers.values().map(|t| t.deadline).min();
            match next {
                Some(deadline) if deadline <= now => continue,
                Some(deadline) => {
                    let wait = Duration::from_nanos(deadline - now);
                    drop(match self.wake.wait_timeout(inner, wait) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    });
                }
                None => {
                    drop(match self.wake.wait(inner) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    });
                }
            }
        }
    }
}

/// Background thread that sleeps until the next deadline and polls the queue.
///
/// Only meaningful with a real-time tick source ([`crate::MonotonicClock`]);
/// tests with a [`crate::ManualClock`] call [`TimerQueue::poll`] directly.
pub struct TimerDriver {
    queue: Arc<TimerQueue>,
    handle: Option<JoinHandle<()>>,
}

impl TimerDriver {
    pub fn spawn(queue: Arc<TimerQueue>) -> std::io::Result<Self> {
        let worker = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("vega-timer".into())
            .spawn(move || worker.run_driver())?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut inner = self.queue.lock_inner();
            inner.shutdown = true;
        }
        self.queue.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
