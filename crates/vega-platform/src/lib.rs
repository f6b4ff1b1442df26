//! Host platform services for the Vega HLE kernel.
//!
//! Everything here is mechanism-level plumbing the kernel consumes through
//! small traits so it never depends on a specific host facility:
//!
//! - [`TickSource`]: a monotonic nanosecond tick counter.
//! - [`TimerQueue`]: armed deadlines (one-shot or periodic) firing callbacks,
//!   either pumped manually or driven by a background thread.
//! - [`InterruptBackend`]: delivery of an asynchronous interrupt to a specific
//!   host thread, with the actual mechanism (signal, thread-suspend, ...)
//!   supplied by the embedder.

#![forbid(unsafe_code)]

pub mod clock;
pub mod interrupt;
pub mod timer;

pub use clock::{ManualClock, MonotonicClock, TickSource};
pub use interrupt::{HookInterrupts, HostThreadId, InterruptBackend};
pub use timer::{TimerDriver, TimerId, TimerQueue};
