use thiserror::Error;

use crate::mm::memory::VirtAddr;
use crate::process::Pid;

/// Every failure the process core can report.
///
/// `CorruptedState` and `TerminalMisuse` are fatal: whoever discovers them
/// hands them to `Kernel::panic`, which halts the whole machine.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("out of memory: cannot satisfy a {0} byte request")]
    OutOfMemory(usize),

    #[error("corrupted process state: {0}")]
    CorruptedState(String),

    #[error("{0} is not a live process")]
    InvalidTarget(Pid),

    #[error("control returned past the one-way exit switch of {0}")]
    TerminalMisuse(Pid),

    #[error("{0:?} + {1:#x} is not a user range")]
    BadAddress(VirtAddr, usize),

    #[error("bad image: {0}")]
    BadImage(&'static str),

    #[error("unknown system call number {0}")]
    BadSyscall(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to spawn flow: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("machine halted")]
    Halted,
}

impl KernelError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::CorruptedState(_) | KernelError::TerminalMisuse(_)
        )
    }

    pub(crate) fn corrupted(what: impl Into<String>) -> Self {
        KernelError::CorruptedState(what.into())
    }
}

pub type KResult<T> = Result<T, KernelError>;
