use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Opaque token identifying a host thread for interrupt delivery.
///
/// The kernel assigns one per guest thread; the embedder decides what it maps
/// to (a pthread id, a suspendable handle, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostThreadId(pub u64);

/// Delivery of an asynchronous interrupt to a specific host thread.
///
/// The scheduler publishes its pending-yield state *before* calling
/// [`deliver`](Self::deliver), so an implementation that cannot interrupt
/// native code mid-flight (or a missing hook) degrades gracefully: the target
/// observes the deferred interrupt at its next suspension point.
pub trait InterruptBackend: Send + Sync {
    fn deliver(&self, target: HostThreadId);
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Hook-registry backend: each host thread installs a closure that forwards
/// the interrupt to whatever native primitive the platform offers. A native
/// build would raise a signal from the hook; tests re-enter the scheduler's
/// interrupt handler directly.
#[derive(Default)]
pub struct HookInterrupts {
    hooks: Mutex<HashMap<u64, Hook>>,
}

impl HookInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_hooks(&self) -> MutexGuard<'_, HashMap<u64, Hook>> {
        match self.hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn install<F: Fn() + Send + Sync + 'static>(&self, target: HostThreadId, hook: F) {
        self.lock_hooks().insert(target.0, Arc::new(hook));
    }

    pub fn remove(&self, target: HostThreadId) {
        self.lock_hooks().remove(&target.0);
    }
}

impl InterruptBackend for HookInterrupts {
    fn deliver(&self, target: HostThreadId) {
        // Clone out so the hook runs without the registry lock held.
        let hook = self.lock_hooks().get(&target.0).cloned();
        if let Some(hook) = hook {
            hook();
        } else {
            tracing::trace!(target = target.0, "interrupt with no hook installed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_to_installed_hook_only() {
        let backend = HookInterrupts::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        backend.install(HostThreadId(7), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        backend.deliver(HostThreadId(7));
        backend.deliver(HostThreadId(8)); // no hook, no-op
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        backend.remove(HostThreadId(7));
        backend.deliver(HostThreadId(7));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
