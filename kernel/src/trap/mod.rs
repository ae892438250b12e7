// User code runs as Rust routines installed in the address space text map.
// A routine enters the kernel through `UserContext::syscall`, the hosted
// counterpart of the trap gate: arguments travel in the saved trap frame.

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::{
    arch::CpuId,
    error::KernelError,
    machine::Kernel,
    mm::memory::VirtAddr,
    process::{context::TrapFrame, Current, Pid},
};

use self::syscall::Syscall;

pub mod syscall;

/// A piece of user program text, entered at its virtual address.
pub type Routine = Arc<dyn Fn(&mut UserContext) + Send + Sync>;

/// What `syscall` hands back on failure
pub const SYSCALL_FAILED: u64 = u64::MAX;

/// The user-mode view of a running process.
pub struct UserContext {
    kernel: Arc<Kernel>,
    current: Current,
}

impl UserContext {
    pub(crate) fn new(kernel: Arc<Kernel>, current: Current) -> Self {
        Self { kernel, current }
    }

    pub fn pid(&self) -> Pid {
        self.current.pid()
    }

    /// the core this process was last dispatched on
    pub fn cpu(&self) -> CpuId {
        self.current.cpu()
    }

    pub fn trap_frame(&self) -> TrapFrame {
        self.modify_trap_frame(|tf| tf.clone())
    }

    pub fn modify_trap_frame<T>(&self, f: impl FnOnce(&mut TrapFrame) -> T) -> T {
        let mut table = self.kernel.lock_table();
        match table.get_mut(self.current.pid()) {
            Ok(pcb) => f(&mut pcb.trap_frame),
            Err(err) => self.kernel.panic(err),
        }
    }

    /// Reads user memory, `None` on an unmapped byte.
    pub fn read(&self, va: VirtAddr, len: usize) -> Option<Vec<u8>> {
        let table = self.kernel.lock_table();
        let space = table.get(self.current.pid()).ok()?.addr_space()?;
        space.read(&self.kernel.memory, va, len)
    }

    /// Writes user memory, `false` unless every page is mapped writable.
    pub fn write(&self, va: VirtAddr, data: &[u8]) -> bool {
        let table = self.kernel.lock_table();
        let Some(space) = table
            .get(self.current.pid())
            .ok()
            .and_then(|pcb| pcb.addr_space())
        else {
            return false;
        };
        space.write(&self.kernel.memory, va, data)
    }

    /// Traps into the kernel with `call` and two arguments.
    /// Returns the value left in `rax`.
    pub fn syscall(&mut self, call: Syscall, a0: u64, a1: u64) -> u64 {
        self.modify_trap_frame(|tf| {
            tf.rax = call as u64;
            tf.rdi = a0;
            tf.rsi = a1;
        });
        let ret = match syscall::dispatch(self) {
            Ok(ret) => ret,
            Err(err) if err.is_fatal() => self.kernel.panic(err),
            Err(err) => {
                debug!("{:?}: {:?} failed: {}", self.pid(), call, err);
                SYSCALL_FAILED
            }
        };
        self.modify_trap_frame(|tf| tf.set_return(ret));
        ret
    }

    /// Forks; the child starts at the routine installed at `next`.
    pub fn fork(&mut self, next: VirtAddr) -> Option<Pid> {
        let resume =
            self.modify_trap_frame(|tf| core::mem::replace(&mut tf.rip, next.as_usize() as u64));
        let ret = self.syscall(Syscall::SysFork, 0, 0);
        self.modify_trap_frame(|tf| tf.rip = resume);
        match ret {
            SYSCALL_FAILED => None,
            child => Some(Pid::from_raw(child)),
        }
    }

    pub fn exit(&mut self) -> ! {
        self.syscall(Syscall::SysExit, 0, 0);
        // dispatch never comes back from an exit
        self.kernel
            .panic(KernelError::TerminalMisuse(self.current.pid()))
    }

    pub fn wait(&mut self, target: Pid) -> bool {
        self.syscall(Syscall::SysWait, target.as_raw(), 0) == 0
    }

    pub fn serve(&mut self) -> Pid {
        Pid::from_raw(self.syscall(Syscall::SysServe, 0, 0))
    }

    pub fn yield_now(&mut self) {
        self.syscall(Syscall::SysYield, 0, 0);
    }

    pub fn getpid(&mut self) -> Pid {
        Pid::from_raw(self.syscall(Syscall::SysGetpid, 0, 0))
    }

    /// Hands `value` to `target` and sleeps until it is received.
    pub fn sendi(&mut self, target: Pid, value: u64) -> bool {
        self.syscall(Syscall::SysSendi, target.as_raw(), value) == 0
    }

    /// Sleeps until some process sends, returns the sender and its value.
    pub fn recvi(&mut self) -> (Pid, u64) {
        let sender = self.syscall(Syscall::SysRecvi, 0, 0);
        let value = self.modify_trap_frame(|tf| tf.rdx);
        (Pid::from_raw(sender), value)
    }

    pub(crate) fn parts(&mut self) -> (&Arc<Kernel>, &mut Current) {
        (&self.kernel, &mut self.current)
    }
}

/// First code a new flow runs once dispatched.
pub fn forkret(ctx: &mut UserContext) -> ! {
    trace!("forkret: {:?} on cpu{}", ctx.pid(), ctx.cpu());
    trapret(ctx)
}

/// Enters user mode at the saved `rip`. A routine that returns exits.
pub fn trapret(ctx: &mut UserContext) -> ! {
    let (rip, routine) = {
        let table = ctx.kernel.lock_table();
        let found = table.get(ctx.pid()).map(|pcb| {
            let rip = VirtAddr::new(pcb.trap_frame.rip as usize);
            (rip, pcb.addr_space().and_then(|space| space.routine_at(rip)))
        });
        drop(table);
        match found {
            Ok(found) => found,
            Err(err) => ctx.kernel.panic(err),
        }
    };
    match routine {
        Some(routine) => {
            routine(&mut *ctx);
            debug!("{:?}: returned from {:?}, exiting", ctx.pid(), rip);
        }
        None => warn!("{:?}: no code at {:?}, exiting", ctx.pid(), rip),
    }
    ctx.exit()
}
