use std::{collections::VecDeque, sync::Arc};

use crate::mm::{address_space::AddrSpace, memory::PhysAddr};

use super::{
    context::{Context, TrapFrame},
    Pid,
};

/// Liveness tag of every PCB, overwritten when the PCB is freed
pub const PROC_MAGIC: u32 = 0xabcd_cccc;
const PROC_POISON: u32 = 0xdead_beef;

/// Where a PCB is linked. A PCB sits in at most one container at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    /// running, or allocated but never admitted
    Unlinked,
    Ready,
    Zombie,
    /// in the waiter queue of that process
    WaitingOn(Pid),
}

/// The block backing a PCB, taken from physical memory at allocation.
#[derive(Clone, Copy, Debug)]
pub struct KernelStack {
    base: PhysAddr,
    size: usize,
}

impl KernelStack {
    pub fn new(base: PhysAddr, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn top(&self) -> usize {
        self.base.as_usize() + self.size
    }
}

pub struct ProcessControlBlock {
    magic: u32,
    pid: Pid,
    kernel_stack: KernelStack,
    // None only between allocation and the first address space install
    addr_space: Option<AddrSpace>,
    context: Arc<Context>,
    pub trap_frame: TrapFrame,
    position: Position,
    // FIFO of the processes blocked in wait() on this one
    waiters: VecDeque<Pid>,
    // last integer handed to sendi
    mailbox: u64,
}

impl ProcessControlBlock {
    pub fn new(pid: Pid, kernel_stack: KernelStack, context: Arc<Context>) -> Self {
        Self {
            magic: PROC_MAGIC,
            pid,
            kernel_stack,
            addr_space: None,
            context,
            trap_frame: TrapFrame::user(),
            position: Position::Unlinked,
            waiters: VecDeque::new(),
            mailbox: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.magic == PROC_MAGIC
    }

    pub(super) fn poison(&mut self) {
        self.magic = PROC_POISON;
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub(super) fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    pub fn waiters(&self) -> &VecDeque<Pid> {
        &self.waiters
    }

    pub(super) fn waiters_mut(&mut self) -> &mut VecDeque<Pid> {
        &mut self.waiters
    }

    pub fn kernel_stack(&self) -> KernelStack {
        self.kernel_stack
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn addr_space(&self) -> Option<&AddrSpace> {
        self.addr_space.as_ref()
    }

    pub fn addr_space_mut(&mut self) -> Option<&mut AddrSpace> {
        self.addr_space.as_mut()
    }

    pub fn install_addr_space(&mut self, space: AddrSpace) {
        assert!(
            self.addr_space.is_none(),
            "{:?} already owns an address space",
            self.pid
        );
        self.addr_space = Some(space);
    }

    pub fn take_addr_space(&mut self) -> Option<AddrSpace> {
        self.addr_space.take()
    }

    pub fn mailbox(&self) -> u64 {
        self.mailbox
    }

    pub fn set_mailbox(&mut self, value: u64) {
        self.mailbox = value;
    }
}
