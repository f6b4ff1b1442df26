use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::thread::PriorityRange;

/// Kernel construction parameters.
///
/// Malformed thread requests (bad priority, bad core id) are rejected against
/// this configuration at the process layer; the scheduler itself assumes
/// validated inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Number of emulated cores.
    pub core_count: u8,
    /// Time quantum enforced on a running thread at its core's preemption
    /// threshold priority.
    pub preempt_quantum: Duration,
    /// Valid guest priority values (lower value = higher priority).
    pub priority_range: PriorityRange,
    /// Per-core preemption threshold priority, one entry per core.
    pub preempt_priority: Vec<u8>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        // Console defaults: four cores, the last reserved for the system and
        // preempting across the whole priority range.
        Self {
            core_count: 4,
            preempt_quantum: Duration::from_millis(10),
            priority_range: PriorityRange { min: 0, max: 63 },
            preempt_priority: vec![59, 59, 59, 63],
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.core_count == 0 || self.core_count > 64 {
            return Err(KernelError::InvalidConfig("core count must be 1..=64"));
        }
        if self.priority_range.min > self.priority_range.max || self.priority_range.max > 63 {
            return Err(KernelError::InvalidConfig("bad priority range"));
        }
        if self.preempt_priority.len() != self.core_count as usize {
            return Err(KernelError::InvalidConfig(
                "preempt_priority needs one entry per core",
            ));
        }
        if self.preempt_quantum.is_zero() {
            return Err(KernelError::InvalidConfig("zero preemption quantum"));
        }
        Ok(())
    }

    /// The quantum in clock ticks (nanoseconds).
    pub fn quantum_ticks(&self) -> u64 {
        self.preempt_quantum.as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_mismatched_threshold_table() {
        let mut config = KernelConfig::default();
        config.preempt_priority.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_quantum_and_zero_cores() {
        let mut config = KernelConfig::default();
        config.preempt_quantum = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.core_count = 0;
        config.preempt_priority.clear();
        assert!(config.validate().is_err());
    }
}
