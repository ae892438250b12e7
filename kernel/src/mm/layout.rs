// 4KB per page
pub const PAGE_ORDER: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_ORDER;

// user space lives below KERNBASE, everything above belongs to the kernel
pub const KERNBASE: usize = 0xC000_0000;
// the initial user stack is one page just below this address
pub const USTACKTOP: usize = KERNBASE - PAGE_SIZE;

// the boot page table identity maps [0, BOOT_IDENTITY_LIMIT) so that
// secondary cores can turn on paging while still running at low addresses
pub const BOOT_IDENTITY_LIMIT: usize = 4 * 1024 * 1024;

// secondary cores start executing at this physical address
pub const MPENTRY_PADDR: usize = 0x7000;

// simulated RAM handed to the frame allocator starts here
pub const PHYS_BASE: usize = 0x0010_0000;
pub const DEFAULT_MEMORY_SIZE: usize = 8 * 1024 * 1024;

// maximum supported cores
pub const NCPU: usize = 8;

// each process has its own kernel stack, the PCB and its trap frame live at its top.
// Each core also gets one of these as its boot stack
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE * 2;

// host stack of the thread that carries a flow
pub const FLOW_STACK_SIZE: usize = 256 * 1024;

// local timer initial count
pub const TIMER_INTERVAL: u32 = 10_000_000;
