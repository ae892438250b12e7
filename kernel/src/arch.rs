use core::time::Duration;
use std::time::Instant;

use lazy_static::lazy_static;

/// Index of a core in the per-core table (not its hardware id)
pub type CpuId = usize;

/// The core that boots the machine
pub const BSP: CpuId = 0;

lazy_static! {
    static ref BOOT_INSTANT: Instant = Instant::now();
}

/// Time since the first call, stands in for the timer counter
pub fn time() -> Duration {
    BOOT_INSTANT.elapsed()
}

/// One iteration of a busy-wait loop.
/// Gives the host a chance to run other flows, cores here are threads.
#[inline]
pub fn relax() {
    core::hint::spin_loop();
    std::thread::yield_now();
}
