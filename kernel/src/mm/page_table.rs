use std::collections::BTreeMap;

use bitflags::bitflags;

use super::memory::{PhysAddr, VirtAddr};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u16 {
        const VALID = 1 << 0;
        const READABLE = 1 << 1;
        const WRITABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

impl From<PageFlags> for PTEFlags {
    fn from(perms: PageFlags) -> Self {
        Self::from_bits_retain(perms.bits()) | PTEFlags::VALID
    }
}

bitflags! {
    /// a subset of `PTEFlags` that are exposed
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const READABLE = 1 << 1;
        const WRITABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const USER = 1 << 4;
    }
}

impl From<PTEFlags> for PageFlags {
    fn from(flags: PTEFlags) -> Self {
        Self::from_bits_truncate(flags.bits())
    }
}

// represents a PTE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableEntry {
    frame: PhysAddr,
    flags: PTEFlags,
}

impl PageTableEntry {
    pub fn new(frame: PhysAddr, flags: PTEFlags) -> Self {
        Self { frame, flags }
    }

    pub fn frame(&self) -> PhysAddr {
        self.frame
    }

    pub fn flags(&self) -> PTEFlags {
        self.flags
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(PTEFlags::VALID)
    }
}

/// Page-granular translation: page base VA -> entry.
/// The tree stands in for the multi-level radix table.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<VirtAddr, PageTableEntry>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a mapping for the page containing `va`, returns the old one.
    pub fn map(&mut self, va: VirtAddr, entry: PageTableEntry) -> Option<PageTableEntry> {
        self.entries.insert(va.align_down(), entry)
    }

    pub fn walk(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        self.entries
            .get(&va.align_down())
            .filter(|entry| entry.is_valid())
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.walk(va).map(|entry| entry.frame() + va.page_offset())
    }

    pub fn unmap(&mut self, va: VirtAddr) -> Option<PageTableEntry> {
        self.entries.remove(&va.align_down())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VirtAddr, &PageTableEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (VirtAddr, PageTableEntry)> {
        std::mem::take(&mut self.entries).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::layout::PAGE_SIZE;

    #[test]
    fn translate_keeps_the_page_offset() {
        let mut pt = PageTable::new();
        let flags = PTEFlags::from(PageFlags::READABLE | PageFlags::USER);
        assert!(flags.contains(PTEFlags::VALID));
        pt.map(
            VirtAddr::new(PAGE_SIZE * 3 + 5),
            PageTableEntry::new(PhysAddr::new(PAGE_SIZE * 9), flags),
        );
        assert_eq!(
            pt.translate(VirtAddr::new(PAGE_SIZE * 3 + 42)),
            Some(PhysAddr::new(PAGE_SIZE * 9 + 42))
        );
        assert_eq!(pt.translate(VirtAddr::new(PAGE_SIZE * 4)), None);
        assert!(pt.unmap(VirtAddr::new(PAGE_SIZE * 3)).is_some());
        assert!(pt.is_empty());
    }
}
