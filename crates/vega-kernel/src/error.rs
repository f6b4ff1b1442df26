use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

/// Kernel operation failures.
///
/// Expected contention (mutex already held, queue not yet at head, condition
/// not yet signaled) is never an error; those paths block or report `bool`.
/// [`KernelError::InvariantViolated`] indicates scheduler state corruption
/// and is fatal to the owning guest process context; the syscall dispatch
/// layer is expected to tear the process down on seeing it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("scheduler invariant violated in {op} by thread #{thread}")]
    InvariantViolated { op: &'static str, thread: u32 },

    #[error("guest address {address:#x} is unmapped or unaligned")]
    BadAddress { address: u64 },

    #[error("priority {priority} outside permitted range {min}..={max}")]
    InvalidPriority { priority: u8, min: u8, max: u8 },

    #[error("core {core} does not exist (core count {count})")]
    InvalidCore { core: u8, count: u8 },

    #[error("affinity mask {mask:#x} selects no valid core")]
    InvalidAffinity { mask: u64 },

    #[error("unknown thread handle {handle:#x}")]
    UnknownHandle { handle: u32 },

    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(&'static str),
}
