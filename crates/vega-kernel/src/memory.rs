use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, Result};

/// Word-granular access to guest memory, consumed from the process/loader
/// component. Only the accesses the sync registry needs are modeled here.
///
/// `compare_exchange_u32` must be a single atomic operation: the guest mutex
/// fast path claims an unowned word with it and racing claimants must not
/// both succeed.
pub trait GuestMemory: Send + Sync {
    fn load_u32(&self, address: u64) -> Result<u32>;
    fn store_u32(&self, address: u64, value: u32) -> Result<()>;
    /// Returns `true` if the word held `current` and was replaced by `new`.
    fn compare_exchange_u32(&self, address: u64, current: u32, new: u32) -> Result<bool>;
}

/// Flat word-addressed guest memory backed by host atomics. Used by tests and
/// by hosts that map the guest address space into the emulator process.
pub struct FlatMemory {
    base: u64,
    words: Vec<AtomicU32>,
}

impl FlatMemory {
    pub fn new(base: u64, size_bytes: usize) -> Self {
        let mut words = Vec::with_capacity(size_bytes / 4);
        words.resize_with(size_bytes / 4, || AtomicU32::new(0));
        Self { base, words }
    }

    fn word(&self, address: u64) -> Result<&AtomicU32> {
        if address < self.base || address % 4 != 0 {
            return Err(KernelError::BadAddress { address });
        }
        let index = ((address - self.base) / 4) as usize;
        self.words
            .get(index)
            .ok_or(KernelError::BadAddress { address })
    }
}

impl GuestMemory for FlatMemory {
    fn load_u32(&self, address: u64) -> Result<u32> {
        Ok(self.word(address)?.load(Ordering::SeqCst))
    }

    fn store_u32(&self, address: u64, value: u32) -> Result<()> {
        self.word(address)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn compare_exchange_u32(&self, address: u64, current: u32, new: u32) -> Result<bool> {
        Ok(self
            .word(address)?
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_roundtrip() {
        let memory = FlatMemory::new(0x1000, 0x100);
        memory.store_u32(0x1004, 0xdead_beef).unwrap();
        assert_eq!(memory.load_u32(0x1004).unwrap(), 0xdead_beef);
        assert_eq!(memory.load_u32(0x1008).unwrap(), 0);
    }

    #[test]
    fn rejects_unaligned_and_out_of_range() {
        let memory = FlatMemory::new(0x1000, 0x10);
        assert_eq!(
            memory.load_u32(0x1002),
            Err(KernelError::BadAddress { address: 0x1002 })
        );
        assert!(memory.load_u32(0xff0).is_err());
        assert!(memory.store_u32(0x1010, 1).is_err());
    }

    #[test]
    fn compare_exchange_claims_once() {
        let memory = FlatMemory::new(0, 0x10);
        assert!(memory.compare_exchange_u32(0x4, 0, 7).unwrap());
        assert!(!memory.compare_exchange_u32(0x4, 0, 9).unwrap());
        assert_eq!(memory.load_u32(0x4).unwrap(), 7);
    }
}
