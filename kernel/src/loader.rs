use std::sync::Arc;

use log::{debug, info};

use crate::{
    allocator::frame_allocator::PhysicalMemory,
    error::{KResult, KernelError},
    mm::{
        address_space::AddrSpace,
        layout::{KERNBASE, PAGE_SIZE, USTACKTOP},
        memory::VirtAddr,
        page_table::PageFlags,
    },
    process::context::TrapFrame,
    trap::{Routine, UserContext},
};

/// "\x7FELF" read as a little endian word
pub const ELF_MAGIC: u32 = 0x464C_457F;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramKind {
    Load,
    Note,
}

pub struct ProgramHeader {
    pub kind: ProgramKind,
    pub va: VirtAddr,
    pub data: Vec<u8>,
    pub memsz: usize,
    pub flags: PageFlags,
}

/// An in-memory program: header, program headers, and the routines that
/// make up its text.
pub struct Image {
    magic: u32,
    entry: VirtAddr,
    headers: Vec<ProgramHeader>,
    text: Vec<(VirtAddr, Routine)>,
}

impl Image {
    pub fn new(entry: VirtAddr) -> Self {
        Self {
            magic: ELF_MAGIC,
            entry,
            headers: Vec::new(),
            text: Vec::new(),
        }
    }

    pub fn with_magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    pub fn routine(
        mut self,
        va: VirtAddr,
        routine: impl Fn(&mut UserContext) + Send + Sync + 'static,
    ) -> Self {
        let routine: Routine = Arc::new(routine);
        self.text.push((va, routine));
        self
    }

    /// A loadable segment; memory past `data` up to `memsz` is BSS.
    pub fn segment(mut self, va: VirtAddr, data: &[u8], memsz: usize, flags: PageFlags) -> Self {
        self.headers.push(ProgramHeader {
            kind: ProgramKind::Load,
            va,
            data: data.to_vec(),
            memsz,
            flags,
        });
        self
    }

    pub fn note(mut self, data: &[u8]) -> Self {
        self.headers.push(ProgramHeader {
            kind: ProgramKind::Note,
            va: VirtAddr::new(0),
            data: data.to_vec(),
            memsz: data.len(),
            flags: PageFlags::empty(),
        });
        self
    }

    pub fn entry(&self) -> VirtAddr {
        self.entry
    }

    pub fn headers(&self) -> &[ProgramHeader] {
        &self.headers
    }
}

fn check(ph: &ProgramHeader) -> KResult<()> {
    let end = ph
        .va
        .as_usize()
        .checked_add(ph.memsz)
        .ok_or(KernelError::BadImage("segment wraps around"))?;
    if end <= ph.va.as_usize() {
        return Err(KernelError::BadImage("empty segment"));
    }
    if end > KERNBASE {
        return Err(KernelError::BadImage("segment reaches into the kernel"));
    }
    if ph.data.len() > ph.memsz {
        return Err(KernelError::BadImage("file size exceeds memory size"));
    }
    Ok(())
}

/// Populates `space` from `image` and points `tf` at its entry and at a
/// fresh one page user stack. The caller releases `space` on failure.
pub fn load(
    image: &Image,
    space: &mut AddrSpace,
    memory: &PhysicalMemory,
    tf: &mut TrapFrame,
) -> KResult<()> {
    if image.magic != ELF_MAGIC {
        return Err(KernelError::BadImage("not an ELF"));
    }
    for ph in image.headers.iter().filter(|ph| ph.kind == ProgramKind::Load) {
        check(ph)?;
        space.map(memory, ph.va, ph.memsz, ph.flags)?;
        let mut contents = ph.data.clone();
        contents.resize(ph.memsz, 0);
        if !space.copy_in(memory, ph.va, &contents) {
            return Err(KernelError::corrupted("segment mapped but not present"));
        }
        debug!(
            "load: {:?} -- {:?}, {} bytes from file",
            ph.va,
            ph.va + ph.memsz,
            ph.data.len()
        );
    }
    for (va, routine) in &image.text {
        space.install_routine(*va, routine.clone());
    }
    if space.routine_at(image.entry).is_none() {
        return Err(KernelError::BadImage("no code at the entry point"));
    }

    space.map(
        memory,
        VirtAddr::new(USTACKTOP - PAGE_SIZE),
        PAGE_SIZE,
        PageFlags::READABLE | PageFlags::WRITABLE,
    )?;
    tf.rip = image.entry.as_usize() as u64;
    tf.rsp = USTACKTOP as u64;
    info!("load: entry {:?}, {} routines", image.entry, image.text.len());
    Ok(())
}
