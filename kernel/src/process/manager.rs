use core::fmt::Write;
use std::collections::VecDeque;

use log::trace;

use crate::{
    common::resource_table::ResourceTable,
    error::{KResult, KernelError},
};

use super::{
    process::{Position, ProcessControlBlock},
    Pid,
};

const INITIAL_MAX_N_PROCS: usize = 64;

/// The shared registry. The kernel keeps it behind one lock and every
/// structural change goes through here, so positions and containers never
/// disagree while the lock is free.
pub struct ProcessTable {
    pcb_table: ResourceTable<ProcessControlBlock>,
    // runnable processes, FIFO
    ready_queue: VecDeque<Pid>,
    // exited, waiting for the next wait() to reclaim them
    zombie_queue: VecDeque<Pid>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            pcb_table: ResourceTable::new(INITIAL_MAX_N_PROCS, "pcb"),
            ready_queue: VecDeque::new(),
            zombie_queue: VecDeque::new(),
        }
    }

    /// Registers a new PCB, unlinked.
    pub fn allocate(&mut self, make: impl FnOnce(Pid) -> ProcessControlBlock) -> Pid {
        let pid = self.pcb_table.insert_with(make);
        trace!("ProcessTable::allocate: {:?}", pid);
        pid
    }

    /// The validity check: registered and carrying the liveness tag.
    pub fn is_valid(&self, pid: Pid) -> bool {
        self.pcb_table
            .get(pid)
            .is_some_and(|pcb| pcb.is_alive() && pcb.pid() == pid)
    }

    pub fn get(&self, pid: Pid) -> KResult<&ProcessControlBlock> {
        match self.pcb_table.get(pid) {
            Some(pcb) if pcb.is_alive() => Ok(pcb),
            _ => Err(KernelError::corrupted(format!("{:?} is not a live PCB", pid))),
        }
    }

    pub fn get_mut(&mut self, pid: Pid) -> KResult<&mut ProcessControlBlock> {
        match self.pcb_table.get_mut(pid) {
            Some(pcb) if pcb.is_alive() => Ok(pcb),
            _ => Err(KernelError::corrupted(format!("{:?} is not a live PCB", pid))),
        }
    }

    fn unlinked_mut(&mut self, pid: Pid) -> KResult<&mut ProcessControlBlock> {
        let pcb = self.get_mut(pid)?;
        match pcb.position() {
            Position::Unlinked => Ok(pcb),
            other => Err(KernelError::corrupted(format!(
                "{:?} is already linked as {:?}",
                pid, other
            ))),
        }
    }

    /// Makes an unlinked PCB runnable.
    pub fn admit(&mut self, pid: Pid) -> KResult<()> {
        self.unlinked_mut(pid)?.set_position(Position::Ready);
        self.ready_queue.push_back(pid);
        Ok(())
    }

    /// Takes the head of the ready queue and unlinks it.
    pub fn pop_ready(&mut self) -> KResult<Option<Pid>> {
        let Some(pid) = self.ready_queue.pop_front() else {
            return Ok(None);
        };
        let pcb = self.get_mut(pid)?;
        if pcb.position() != Position::Ready {
            return Err(KernelError::corrupted(format!(
                "{:?} dequeued from ready while {:?}",
                pid,
                pcb.position()
            )));
        }
        pcb.set_position(Position::Unlinked);
        Ok(Some(pid))
    }

    pub fn bury(&mut self, pid: Pid) -> KResult<()> {
        self.unlinked_mut(pid)?.set_position(Position::Zombie);
        self.zombie_queue.push_back(pid);
        Ok(())
    }

    /// Links `waiter` at the tail of `target`'s waiters.
    pub fn enqueue_waiter(&mut self, waiter: Pid, target: Pid) -> KResult<()> {
        if waiter == target {
            return Err(KernelError::InvalidTarget(target));
        }
        if !self.is_valid(target) {
            return Err(KernelError::InvalidTarget(target));
        }
        self.unlinked_mut(waiter)?
            .set_position(Position::WaitingOn(target));
        self.get_mut(target)?.waiters_mut().push_back(waiter);
        Ok(())
    }

    /// Moves the oldest waiter of `server` to the ready queue.
    pub fn serve_one(&mut self, server: Pid) -> KResult<Option<Pid>> {
        let Some(waiter) = self.get_mut(server)?.waiters_mut().pop_front() else {
            return Ok(None);
        };
        self.ready_waiter(waiter, server)?;
        Ok(Some(waiter))
    }

    /// Moves every waiter of `pid` to the ready queue, in FIFO order.
    pub fn release_waiters(&mut self, pid: Pid) -> KResult<usize> {
        let waiters = core::mem::take(self.get_mut(pid)?.waiters_mut());
        let count = waiters.len();
        for waiter in waiters {
            self.ready_waiter(waiter, pid)?;
        }
        Ok(count)
    }

    fn ready_waiter(&mut self, waiter: Pid, target: Pid) -> KResult<()> {
        let pcb = self.get_mut(waiter)?;
        if pcb.position() != Position::WaitingOn(target) {
            return Err(KernelError::corrupted(format!(
                "{:?} queued on {:?} while {:?}",
                waiter,
                target,
                pcb.position()
            )));
        }
        pcb.set_position(Position::Ready);
        self.ready_queue.push_back(waiter);
        Ok(())
    }

    /// Unregisters a zombie with no waiters and hands its PCB back for
    /// resource release. Its pid fails the validity check from now on.
    pub fn free(&mut self, pid: Pid) -> KResult<ProcessControlBlock> {
        let pcb = self.get(pid)?;
        if pcb.position() != Position::Zombie {
            return Err(KernelError::corrupted(format!(
                "freeing {:?} while {:?}",
                pid,
                pcb.position()
            )));
        }
        if !pcb.waiters().is_empty() {
            return Err(KernelError::corrupted(format!(
                "freeing {:?} with waiters {:?}",
                pid,
                pcb.waiters()
            )));
        }
        let at = self
            .zombie_queue
            .iter()
            .position(|&zombie| zombie == pid)
            .ok_or_else(|| KernelError::corrupted(format!("{:?} missing from zombies", pid)))?;
        self.zombie_queue.remove(at);
        let mut pcb = self
            .pcb_table
            .remove(pid)
            .ok_or_else(|| KernelError::corrupted(format!("{:?} vanished", pid)))?;
        pcb.poison();
        trace!("ProcessTable::free: {:?}", pid);
        Ok(pcb)
    }

    /// Frees every queued zombie, oldest first.
    pub fn reap_zombies(&mut self) -> KResult<Vec<ProcessControlBlock>> {
        let zombies: Vec<Pid> = self.zombie_queue.iter().copied().collect();
        zombies.into_iter().map(|pid| self.free(pid)).collect()
    }

    /// Drops a PCB that was never admitted anywhere.
    pub fn discard(&mut self, pid: Pid) -> KResult<ProcessControlBlock> {
        self.unlinked_mut(pid)?;
        let mut pcb = self
            .pcb_table
            .remove(pid)
            .ok_or_else(|| KernelError::corrupted(format!("{:?} vanished", pid)))?;
        pcb.poison();
        Ok(pcb)
    }

    pub fn ready_pids(&self) -> Vec<Pid> {
        self.ready_queue.iter().copied().collect()
    }

    pub fn zombie_pids(&self) -> Vec<Pid> {
        self.zombie_queue.iter().copied().collect()
    }

    pub fn live(&self) -> Vec<Pid> {
        self.pcb_table.handles()
    }

    pub fn len(&self) -> usize {
        self.pcb_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcb_table.is_empty()
    }

    pub fn waiters_of(&self, pid: Pid) -> Vec<Pid> {
        self.pcb_table
            .get(pid)
            .map(|pcb| pcb.waiters().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every PCB is linked exactly where its position says, and nowhere else.
    pub fn check_invariants(&self) -> KResult<()> {
        let mut seen = hashbrown::HashMap::<Pid, Position>::new();
        let mut link = |pid: Pid, position: Position| -> KResult<()> {
            if let Some(previous) = seen.insert(pid, position) {
                return Err(KernelError::corrupted(format!(
                    "{:?} linked as both {:?} and {:?}",
                    pid, previous, position
                )));
            }
            Ok(())
        };
        for &pid in &self.ready_queue {
            link(pid, Position::Ready)?;
        }
        for &pid in &self.zombie_queue {
            link(pid, Position::Zombie)?;
        }
        for (target, pcb) in self.pcb_table.iter() {
            for &waiter in pcb.waiters() {
                link(waiter, Position::WaitingOn(target))?;
            }
        }
        for (pid, pcb) in self.pcb_table.iter() {
            if !pcb.is_alive() || pcb.pid() != pid {
                return Err(KernelError::corrupted(format!("{:?} is registered dead", pid)));
            }
            let linked = seen.remove(&pid).unwrap_or(Position::Unlinked);
            if linked != pcb.position() {
                return Err(KernelError::corrupted(format!(
                    "{:?} says {:?} but is linked as {:?}",
                    pid,
                    pcb.position(),
                    linked
                )));
            }
        }
        match seen.keys().next() {
            Some(pid) => Err(KernelError::corrupted(format!(
                "{:?} is linked but not registered",
                pid
            ))),
            None => Ok(()),
        }
    }

    /// Human readable dump of the queues and every waiter set.
    pub fn stat(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ready: {:?}", self.ready_queue);
        let _ = writeln!(out, "zombie: {:?}", self.zombie_queue);
        for (pid, pcb) in self.pcb_table.iter() {
            let _ = writeln!(
                out,
                "  {:?} {:?} waiters {:?}",
                pid,
                pcb.position(),
                pcb.waiters()
            );
        }
        out
    }
}
