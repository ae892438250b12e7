use log::LevelFilter;
use serde::Deserialize;

use crate::error::{KResult, KernelError};
use crate::mm::layout::{
    DEFAULT_MEMORY_SIZE, FLOW_STACK_SIZE, KERNEL_STACK_SIZE, NCPU, PAGE_SIZE, TIMER_INTERVAL,
};

/// Machine parameters, fixed at boot.
///
/// Every field has a default, so a TOML document only needs the keys it
/// wants to change:
///
/// ```toml
/// ncpu = 4
/// memory_size = 16777216
/// log_level = "debug"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// number of cores brought up, the bootstrap core included
    pub ncpu: usize,
    /// bytes of simulated physical memory handed to the frame allocator
    pub memory_size: usize,
    /// size of the block backing each PCB and each per-core boot stack
    pub kernel_stack_size: usize,
    /// host stack reserved for every flow thread
    pub flow_stack_size: usize,
    /// initial count of the periodic local timer
    pub timer_interval: u32,
    pub log_level: LevelFilter,
    /// ANSI colour in console timestamps
    pub color: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ncpu: 1,
            memory_size: DEFAULT_MEMORY_SIZE,
            kernel_stack_size: KERNEL_STACK_SIZE,
            flow_stack_size: FLOW_STACK_SIZE,
            timer_interval: TIMER_INTERVAL,
            log_level: LevelFilter::Warn,
            color: false,
        }
    }
}

impl KernelConfig {
    pub fn with_cpus(ncpu: usize) -> Self {
        Self {
            ncpu,
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> KResult<Self> {
        let config: KernelConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KResult<()> {
        if self.ncpu == 0 || self.ncpu > NCPU {
            return Err(KernelError::InvalidConfig(format!(
                "ncpu must be within 1..={}, got {}",
                NCPU, self.ncpu
            )));
        }
        if self.kernel_stack_size == 0 || self.kernel_stack_size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidConfig(format!(
                "kernel_stack_size must be a non-zero multiple of {}, got {}",
                PAGE_SIZE, self.kernel_stack_size
            )));
        }
        if self.memory_size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidConfig(format!(
                "memory_size must be page aligned, got {}",
                self.memory_size
            )));
        }
        // the per-core boot stacks come out of the same memory
        if self.memory_size < self.kernel_stack_size * self.ncpu {
            return Err(KernelError::InvalidConfig(format!(
                "memory_size {} cannot hold {} boot stacks",
                self.memory_size, self.ncpu
            )));
        }
        if self.flow_stack_size < 64 * 1024 {
            return Err(KernelError::InvalidConfig(format!(
                "flow_stack_size {} is too small for a flow thread",
                self.flow_stack_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ncpu, 1);
        assert_eq!(config.kernel_stack_size, KERNEL_STACK_SIZE);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = KernelConfig::from_toml("ncpu = 4\nlog_level = \"debug\"\n").unwrap();
        assert_eq!(config.ncpu, 4);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.memory_size, DEFAULT_MEMORY_SIZE);
    }

    #[test]
    fn rejects_too_many_cpus() {
        let err = KernelConfig::from_toml("ncpu = 64").unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unaligned_kernel_stack() {
        let config = KernelConfig {
            kernel_stack_size: PAGE_SIZE + 1,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KernelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = KernelConfig::from_toml("cores = 2").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }
}
