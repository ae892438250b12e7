//! Process lifecycle and scheduling core of a small multiprocessor kernel,
//! run on the host: every core and every process is a thread, and a flow
//! only runs while it holds its core.

pub mod allocator;
pub mod arch;
pub mod common;
pub mod config;
pub mod cpu;
pub mod error;
pub mod ipc;
pub mod lapic;
pub mod loader;
pub mod machine;
pub mod mm;
pub mod print;
pub mod process;
pub mod start;
pub mod trap;

pub use config::KernelConfig;
pub use error::{KResult, KernelError};
pub use loader::Image;
pub use machine::{Kernel, Machine, TableSnapshot};
pub use mm::{memory::VirtAddr, page_table::PageFlags};
pub use process::Pid;
pub use start::boot;
pub use trap::{syscall::Syscall, UserContext};
