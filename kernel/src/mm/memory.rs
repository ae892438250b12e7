use crate::impl_address_arithmetics;

use super::layout::{KERNBASE, PAGE_SIZE};

// --------------------------- Physical Address ------------------------ //
// It does not own the underlying memory, just a representation
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(usize);

impl_address_arithmetics!(PhysAddr);

// --------------------------- Virtual Address ------------------------- //
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(usize);

impl_address_arithmetics!(VirtAddr);

impl VirtAddr {
    /// End of `[self, self + len)`, `None` if the range wraps or reaches
    /// past user space.
    pub fn user_end(self, len: usize) -> Option<VirtAddr> {
        self.0
            .checked_add(len)
            .filter(|&end| end <= KERNBASE)
            .map(VirtAddr)
    }

    /// base addresses of every page touched by `[self, self + len)`,
    /// `None` when that is not a user range
    pub fn pages(self, len: usize) -> Option<impl Iterator<Item = VirtAddr>> {
        let begin = self.align_down().0;
        let end = self.user_end(len)?.align_up().0;
        Some((begin..end).step_by(PAGE_SIZE).map(VirtAddr))
    }
}
