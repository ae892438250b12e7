use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use primitive_enum::primitive_enum;
use spin::rwlock::RwLock;

use crate::{
    arch::CpuId,
    mm::memory::PhysAddr,
    process::{context::Context, Pid},
};

primitive_enum! {
CpuStatus u32;
    Unused = 0,
    Started = 1,
    Halted = 2,
}

/// One per physical core.
///
/// `status` and the started counter are written by the core itself and
/// polled by the bootstrap core, everything else lives behind `inner`.
pub struct PercpuBlock {
    index: CpuId,
    hartid: u8,
    status: AtomicU32,
    started: AtomicUsize,
    // the flow the core returns to between dispatches
    scheduler: Arc<Context>,
    boot_stack: PhysAddr,
    inner: RwLock<PercpuInner>,
}

struct PercpuInner {
    running_process: Option<Pid>,
    active_root: PhysAddr,
    kstack_top: usize,
    dispatches: u64,
}

impl PercpuBlock {
    pub fn new(index: CpuId, hartid: u8, boot_stack: PhysAddr, kernel_root: PhysAddr) -> Self {
        Self {
            index,
            hartid,
            status: AtomicU32::new(CpuStatus::Unused as u32),
            started: AtomicUsize::new(0),
            scheduler: Context::new(format!("scheduler{}", index)),
            boot_stack,
            inner: RwLock::new(PercpuInner {
                running_process: None,
                active_root: kernel_root,
                kstack_top: 0,
                dispatches: 0,
            }),
        }
    }

    pub fn index(&self) -> CpuId {
        self.index
    }

    pub fn hartid(&self) -> u8 {
        self.hartid
    }

    pub fn boot_stack(&self) -> PhysAddr {
        self.boot_stack
    }

    pub fn scheduler(&self) -> &Arc<Context> {
        &self.scheduler
    }

    pub fn set_executing_process(&self, pid: Pid) {
        let mut inner = self.inner.write();
        assert!(
            inner.running_process.is_none(),
            "cpu{} already runs {:?}",
            self.index,
            inner.running_process
        );
        inner.running_process = Some(pid);
        inner.dispatches += 1;
    }

    pub fn take_executing_process(&self) -> Option<Pid> {
        self.inner.write().running_process.take()
    }

    pub fn running_process(&self) -> Option<Pid> {
        self.inner.read().running_process
    }

    pub fn dispatches(&self) -> u64 {
        self.inner.read().dispatches
    }

    pub fn load_root(&self, root: PhysAddr) {
        self.inner.write().active_root = root;
    }

    pub fn active_root(&self) -> PhysAddr {
        self.inner.read().active_root
    }

    /// the stack the core traps onto while a process runs
    pub fn set_kstack_top(&self, top: usize) {
        self.inner.write().kstack_top = top;
    }

    pub fn kstack_top(&self) -> usize {
        self.inner.read().kstack_top
    }

    pub fn publish_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.status
            .store(CpuStatus::Started as u32, Ordering::SeqCst);
        debug!("cpu{} (hart {}) started", self.index, self.hartid);
    }

    pub fn halt(&self) {
        self.status.store(CpuStatus::Halted as u32, Ordering::SeqCst);
    }

    pub fn status(&self) -> CpuStatus {
        CpuStatus::from(self.status.load(Ordering::SeqCst)).unwrap_or(CpuStatus::Unused)
    }

    /// number of Unused -> Started transitions this core made
    pub fn started_transitions(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}
