use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::allocator::frame_allocator::PhysicalMemory;
use crate::cpu::PercpuBlock;
use crate::error::{KResult, KernelError};
use crate::trap::Routine;

use super::{
    layout::{BOOT_IDENTITY_LIMIT, PAGE_SIZE},
    memory::{PhysAddr, VirtAddr},
    page_table::{PTEFlags, PageFlags, PageTable, PageTableEntry},
};

// ------------------------- Address Space -------------------------------------
// a user address space owns
// (1) its root frame, whose address is what a core loads to switch to it
// (2) the data frames behind every mapped user page
// (3) the routines of its program text, indexed by virtual address
//
// The kernel half is shared by every space and never copied.
pub struct AddrSpace {
    root: PhysAddr,
    page_table: PageTable,
    text: BTreeMap<VirtAddr, Routine>,
}

impl AddrSpace {
    fn empty(memory: &PhysicalMemory) -> KResult<Self> {
        let root = memory
            .acquire(PAGE_SIZE)
            .ok_or(KernelError::OutOfMemory(PAGE_SIZE))?;
        Ok(Self {
            root,
            page_table: PageTable::new(),
            text: BTreeMap::new(),
        })
    }

    /// Copies every user page into fresh frames; text routines are shared.
    pub fn derive(&self, memory: &PhysicalMemory) -> KResult<Self> {
        let mut child = Self::empty(memory)?;
        child.text = self.text.clone();
        for (va, entry) in self.page_table.iter() {
            let Some(frame) = memory.acquire(PAGE_SIZE) else {
                child.release(memory);
                return Err(KernelError::OutOfMemory(PAGE_SIZE));
            };
            memory.copy_frame(entry.frame(), frame);
            child
                .page_table
                .map(*va, PageTableEntry::new(frame, entry.flags()));
        }
        debug!(
            "AddrSpace::derive: {:?} -> {:?}, {} pages copied",
            self.root,
            child.root,
            child.page_table.len()
        );
        Ok(child)
    }

    /// Backs `[va, va + len)` with zeroed frames. Pages already mapped are kept.
    pub fn map(
        &mut self,
        memory: &PhysicalMemory,
        va: VirtAddr,
        len: usize,
        perms: PageFlags,
    ) -> KResult<()> {
        let pages = va.pages(len).ok_or(KernelError::BadAddress(va, len))?;
        for page in pages {
            if self.page_table.walk(page).is_some() {
                continue;
            }
            let frame = memory
                .acquire(PAGE_SIZE)
                .ok_or(KernelError::OutOfMemory(PAGE_SIZE))?;
            let flags = PTEFlags::from(perms | PageFlags::USER);
            self.page_table.map(page, PageTableEntry::new(frame, flags));
        }
        Ok(())
    }

    /// Makes this space the one `cpu` translates through.
    pub fn activate(&self, cpu: &PercpuBlock) {
        cpu.load_root(self.root);
    }

    pub fn release(mut self, memory: &PhysicalMemory) {
        let pages = self.page_table.len();
        for (_, entry) in self.page_table.drain() {
            memory.release(entry.frame(), PAGE_SIZE);
        }
        memory.release(self.root, PAGE_SIZE);
        debug!("AddrSpace::release: {:?}, {} pages freed", self.root, pages);
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn mapped_pages(&self) -> usize {
        self.page_table.len()
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.page_table.translate(va)
    }

    pub fn flags(&self, va: VirtAddr) -> Option<PageFlags> {
        self.page_table.walk(va).map(|entry| entry.flags().into())
    }

    /// Reads user memory, `None` if any byte is unmapped.
    pub fn read(&self, memory: &PhysicalMemory, va: VirtAddr, len: usize) -> Option<Vec<u8>> {
        let mut pages = va.pages(len)?;
        if !pages.all(|page| self.translate(page).is_some()) {
            return None;
        }
        let mut out = vec![0u8; len];
        let mut done = 0;
        while done < len {
            let cur = va + done;
            let pa = self.translate(cur)?;
            let chunk = (PAGE_SIZE - cur.page_offset()).min(len - done);
            memory.read(pa, &mut out[done..done + chunk]);
            done += chunk;
        }
        Some(out)
    }

    /// Writes user memory as the user would: every page must be writable.
    pub fn write(&self, memory: &PhysicalMemory, va: VirtAddr, data: &[u8]) -> bool {
        let Some(mut pages) = va.pages(data.len()) else {
            return false;
        };
        let writable =
            pages.all(|page| matches!(self.flags(page), Some(f) if f.contains(PageFlags::WRITABLE)));
        writable && self.copy_in(memory, va, data)
    }

    /// Kernel side copy into the space, ignoring page permissions.
    pub fn copy_in(&self, memory: &PhysicalMemory, va: VirtAddr, data: &[u8]) -> bool {
        if va.user_end(data.len()).is_none() {
            return false;
        }
        let mut done = 0;
        while done < data.len() {
            let cur = va + done;
            let Some(pa) = self.translate(cur) else {
                return false;
            };
            let chunk = (PAGE_SIZE - cur.page_offset()).min(data.len() - done);
            memory.write(pa, &data[done..done + chunk]);
            done += chunk;
        }
        true
    }

    pub fn install_routine(&mut self, va: VirtAddr, routine: Routine) {
        if self.text.insert(va, routine).is_some() {
            warn!("AddrSpace::install_routine: {:?} redefined", va);
        }
    }

    pub fn routine_at(&self, va: VirtAddr) -> Option<Routine> {
        self.text.get(&va).cloned()
    }
}

// ------------------------- Kernel Space -------------------------------------
// The boot page table. Besides the kernel half it identity maps the low
// BOOT_IDENTITY_LIMIT bytes, which only matters until every core runs at
// its final addresses.
pub struct KernelSpace {
    root: PhysAddr,
    identity_mapped: AtomicBool,
    invalidations: AtomicUsize,
}

impl KernelSpace {
    pub fn new(memory: &PhysicalMemory) -> KResult<Self> {
        let root = memory
            .acquire(PAGE_SIZE)
            .ok_or(KernelError::OutOfMemory(PAGE_SIZE))?;
        Ok(Self {
            root,
            identity_mapped: AtomicBool::new(true),
            invalidations: AtomicUsize::new(0),
        })
    }

    /// A fresh user space: the kernel half only.
    pub fn derive_user(&self, memory: &PhysicalMemory) -> KResult<AddrSpace> {
        AddrSpace::empty(memory)
    }

    /// Back to the kernel-only mapping.
    pub fn activate(&self, cpu: &PercpuBlock) {
        cpu.load_root(self.root);
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Drops the `[0, BOOT_IDENTITY_LIMIT)` identity entry.
    pub fn clear_identity_map(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        if self.identity_mapped.swap(false, Ordering::SeqCst) {
            info!(
                "KernelSpace: identity map [0, {:#x}) cleared",
                BOOT_IDENTITY_LIMIT
            );
        } else {
            warn!("KernelSpace: identity map cleared twice");
        }
    }

    pub fn is_identity_mapped(&self) -> bool {
        self.identity_mapped.load(Ordering::SeqCst)
    }

    /// How many times the identity entry has been invalidated
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}
