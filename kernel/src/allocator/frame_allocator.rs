use buddy_system_allocator::FrameAllocator as BuddyFrames;
use log::{debug, trace};
use spin::Mutex;

use crate::mm::{
    arithmetics::N_PAGES,
    layout::{PAGE_ORDER, PAGE_SIZE},
    memory::PhysAddr,
};

// blocks of up to 2^31 frames
const FRAME_ORDER: usize = 32;

/// The physical memory collaborator.
///
/// Frames are handed out by a buddy allocator, their content lives in a
/// byte array standing in for RAM at `[base, base + size)`.
pub struct PhysicalMemory {
    frames: Mutex<FramesInner>,
    ram: Mutex<Vec<u8>>,
    base: PhysAddr,
    size: usize,
}

struct FramesInner {
    allocator: BuddyFrames<FRAME_ORDER>,
    pages_in_use: usize,
}

impl PhysicalMemory {
    pub fn new(base: PhysAddr, size: usize) -> Self {
        assert!(base.is_page_aligned() && size % PAGE_SIZE == 0);
        let mut allocator = BuddyFrames::<FRAME_ORDER>::new();
        let first = base.as_usize() >> PAGE_ORDER;
        allocator.add_frame(first, first + (size >> PAGE_ORDER));
        debug!(
            "PhysicalMemory::new: {:?} -- {:?}, {} pages",
            base,
            base + size,
            size >> PAGE_ORDER
        );
        Self {
            frames: Mutex::new(FramesInner {
                allocator,
                pages_in_use: 0,
            }),
            ram: Mutex::new(vec![0; size]),
            base,
            size,
        }
    }

    /// Reserves a zeroed, page aligned block of at least `size` bytes.
    pub fn acquire(&self, size: usize) -> Option<PhysAddr> {
        let npages = N_PAGES(size.max(1));
        let frame = {
            let mut frames = self.frames.lock();
            let frame = frames.allocator.alloc(npages)?;
            frames.pages_in_use += npages;
            frame
        };
        let pa = PhysAddr::new(frame << PAGE_ORDER);
        self.zero(pa, npages * PAGE_SIZE);
        trace!("PhysicalMemory::acquire: {} pages at {:?}", npages, pa);
        Some(pa)
    }

    pub fn release(&self, pa: PhysAddr, size: usize) {
        let npages = N_PAGES(size.max(1));
        assert!(pa.is_page_aligned(), "releasing unaligned block {:?}", pa);
        let mut frames = self.frames.lock();
        frames.allocator.dealloc(pa.as_usize() >> PAGE_ORDER, npages);
        frames.pages_in_use -= npages;
        trace!("PhysicalMemory::release: {} pages at {:?}", npages, pa);
    }

    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let offset = self.offset(pa, buf.len());
        let ram = self.ram.lock();
        buf.copy_from_slice(&ram[offset..offset + buf.len()]);
    }

    pub fn write(&self, pa: PhysAddr, data: &[u8]) {
        let offset = self.offset(pa, data.len());
        let mut ram = self.ram.lock();
        ram[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn zero(&self, pa: PhysAddr, len: usize) {
        let offset = self.offset(pa, len);
        self.ram.lock()[offset..offset + len].fill(0);
    }

    pub fn copy_frame(&self, src: PhysAddr, dst: PhysAddr) {
        let src = self.offset(src, PAGE_SIZE);
        let dst = self.offset(dst, PAGE_SIZE);
        self.ram.lock().copy_within(src..src + PAGE_SIZE, dst);
    }

    pub fn pages_in_use(&self) -> usize {
        self.frames.lock().pages_in_use
    }

    pub fn total_pages(&self) -> usize {
        self.size >> PAGE_ORDER
    }

    fn offset(&self, pa: PhysAddr, len: usize) -> usize {
        assert!(
            pa >= self.base && pa.as_usize() + len <= self.base.as_usize() + self.size,
            "PhysicalMemory: {:?} + {} is outside of RAM",
            pa,
            len
        );
        pa - self.base
    }
}
