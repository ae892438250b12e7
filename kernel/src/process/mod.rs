use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use log::{debug, error, info, trace};

use crate::{
    arch::CpuId,
    common::resource_table::Handle,
    error::{KResult, KernelError},
    loader::{self, Image},
    machine::Kernel,
    trap::{self, UserContext},
};

use self::{
    context::{switch, Context, Resume, TrapFrame},
    manager::ProcessTable,
    process::{KernelStack, ProcessControlBlock},
};

pub mod context;
pub mod manager;
pub mod process;
pub mod scheduler;

/// Process identity: a generation-checked slot of the process table.
pub type Pid = Handle;

/// Unwind payload that ends a flow without it being a fault.
pub(crate) struct FlowTerminated;

/// The running process, as seen from its own flow.
pub struct Current {
    pid: Pid,
    // the core that dispatched us last
    cpu: CpuId,
    context: Arc<Context>,
}

impl Current {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

/// Tears the calling flow down.
pub(crate) fn terminate() -> ! {
    panic::resume_unwind(Box::new(FlowTerminated))
}

/// Allocates a PCB and the flow behind it. The PCB is registered but not
/// runnable and has no address space yet.
pub fn proc_alloc(kernel: &Arc<Kernel>) -> KResult<Pid> {
    if kernel.is_halted() {
        return Err(KernelError::Halted);
    }
    let size = kernel.config.kernel_stack_size;
    let base = kernel
        .memory
        .acquire(size)
        .ok_or(KernelError::OutOfMemory(size))?;
    let kernel_stack = KernelStack::new(base, size);

    let pid = kernel.lock_table().allocate(|pid| {
        ProcessControlBlock::new(pid, kernel_stack, Context::new(format!("proc {}", pid)))
    });
    let context = kernel.lock_table().get(pid)?.context().clone();
    kernel.register_context(&context);

    let spawned = thread::Builder::new()
        .name(format!("proc {}", pid))
        .stack_size(kernel.config.flow_stack_size)
        .spawn({
            let kernel = kernel.clone();
            move || flow_main(kernel, pid, context)
        });
    match spawned {
        Ok(flow) => kernel.track_flow(flow),
        Err(err) => {
            let pcb = kernel.lock_table().discard(pid)?;
            proc_free(kernel, pcb);
            return Err(err.into());
        }
    }
    debug!(
        "proc_alloc: {:?}, kernel stack {:?} -- {:#x}",
        pid,
        base,
        kernel_stack.top()
    );
    Ok(pid)
}

/// Releases what a PCB owns once it left the table, then retires its flow.
pub fn proc_free(kernel: &Kernel, mut pcb: ProcessControlBlock) {
    if let Some(space) = pcb.take_addr_space() {
        space.release(&kernel.memory);
    }
    let stack = pcb.kernel_stack();
    kernel.memory.release(stack.base(), stack.size());
    // an exited flow is parked for good, this is its last token
    if let Err(err) = pcb.context().post(Resume::Reap) {
        kernel.panic(err);
    }
    trace!("proc_free: {:?}", pcb.pid());
}

fn discard(kernel: &Kernel, pid: Pid) -> KResult<()> {
    let pcb = kernel.lock_table().discard(pid)?;
    proc_free(kernel, pcb);
    Ok(())
}

/// Creates the first process from `image` and makes it runnable.
pub fn user_init(kernel: &Arc<Kernel>, image: &Image) -> KResult<Pid> {
    let pid = proc_alloc(kernel)?;
    let loaded = kernel
        .kernel_space
        .derive_user(&kernel.memory)
        .and_then(|mut space| {
            let mut tf = TrapFrame::user();
            match loader::load(image, &mut space, &kernel.memory, &mut tf) {
                Ok(()) => Ok((space, tf)),
                Err(err) => {
                    space.release(&kernel.memory);
                    Err(err)
                }
            }
        });
    let (space, tf) = match loaded {
        Ok(loaded) => loaded,
        Err(err) => {
            discard(kernel, pid)?;
            return Err(err);
        }
    };

    let mut table = kernel.lock_table();
    let pcb = table.get_mut(pid)?;
    pcb.install_addr_space(space);
    pcb.trap_frame = tf;
    table.admit(pid)?;
    drop(table);
    info!("user_init: {:?} admitted", pid);
    Ok(pid)
}

/// Duplicates the caller. The child gets a copy of the address space and of
/// the trap frame, with a zero return value, and is made runnable. The
/// caller keeps running.
pub fn fork(kernel: &Arc<Kernel>, current: &mut Current) -> KResult<Pid> {
    let child = proc_alloc(kernel)?;
    let copied = {
        let mut table = kernel.lock_table();
        copy_into(kernel, &mut table, current.pid, child)
    };
    if let Err(err) = copied {
        if !err.is_fatal() {
            discard(kernel, child)?;
        }
        return Err(err);
    }
    debug!("fork: {:?} -> {:?}", current.pid, child);
    Ok(child)
}

fn copy_into(kernel: &Kernel, table: &mut ProcessTable, parent: Pid, child: Pid) -> KResult<()> {
    let parent = table.get(parent)?;
    let space = parent
        .addr_space()
        .ok_or_else(|| KernelError::corrupted(format!("{:?} has no address space", parent.pid())))?
        .derive(&kernel.memory)?;
    let mut tf = parent.trap_frame.clone();
    tf.set_return(0);

    let pcb = table.get_mut(child)?;
    pcb.install_addr_space(space);
    pcb.trap_frame = tf;
    table.admit(child)
}

/// Gives the core back to its scheduler. The caller has already published
/// where it goes next and dropped the table lock.
fn sched(kernel: &Kernel, current: &mut Current) -> KResult<()> {
    let scheduler = kernel.cpus[current.cpu].scheduler();
    match switch(&current.context, scheduler, current.cpu)? {
        Resume::Run(cpu) => {
            current.cpu = cpu;
            Ok(())
        }
        Resume::Halt => terminate(),
        Resume::Reap => Err(KernelError::corrupted(format!(
            "{:?} reaped while not a zombie",
            current.pid
        ))),
    }
}

/// Re-admits the caller to the ready queue and switches away.
pub fn yield_now(kernel: &Kernel, current: &mut Current) -> KResult<()> {
    {
        let mut table = kernel.lock_table();
        table.admit(current.pid)?;
        kernel.cpus[current.cpu].take_executing_process();
    }
    sched(kernel, current)
}

/// Releases every waiter, turns the caller into a zombie and leaves for
/// good. Control never comes back.
pub fn exit(kernel: &Kernel, current: &mut Current) -> ! {
    let buried = {
        let mut table = kernel.lock_table();
        let buried = table
            .release_waiters(current.pid)
            .and_then(|released| table.bury(current.pid).map(|()| released));
        if buried.is_ok() {
            kernel.cpus[current.cpu].take_executing_process();
            debug!("exit: {:?}\n{}", current.pid, table.stat());
        }
        buried
    };
    match buried {
        Ok(released) => info!("exit: {:?}, {} waiters released", current.pid, released),
        Err(err) => kernel.panic(err),
    }

    let scheduler = kernel.cpus[current.cpu].scheduler();
    match switch(&current.context, scheduler, current.cpu) {
        Ok(Resume::Run(_)) => kernel.panic(KernelError::TerminalMisuse(current.pid)),
        Ok(Resume::Reap) | Ok(Resume::Halt) => terminate(),
        Err(err) => kernel.panic(err),
    }
}

/// Reclaims every zombie, then sleeps until `target` exits or serves us.
/// Fails with `InvalidTarget`, without sleeping, if `target` is not live
/// (or is the caller).
pub fn wait(kernel: &Kernel, current: &mut Current, target: Pid) -> KResult<()> {
    let (zombies, queued) = {
        let mut table = kernel.lock_table();
        let zombies = table.reap_zombies()?;
        let queued = table.enqueue_waiter(current.pid, target);
        if queued.is_ok() {
            kernel.cpus[current.cpu].take_executing_process();
        }
        (zombies, queued)
    };
    for zombie in zombies {
        debug!("wait: reclaimed {:?}", zombie.pid());
        proc_free(kernel, zombie);
    }
    if let Err(err) = queued {
        debug!("wait: {:?} on {}", current.pid, err);
        return Err(err);
    }
    sched(kernel, current)
}

/// Poll-and-yield until someone waits on the caller, then readies the
/// oldest waiter and returns it.
pub fn serve(kernel: &Kernel, current: &mut Current) -> KResult<Pid> {
    serve_with(kernel, current, |_, _| Ok(())).map(|(waiter, ())| waiter)
}

/// `serve`, reading something off the served waiter while its position
/// change is still under the lock.
pub(crate) fn serve_with<R>(
    kernel: &Kernel,
    current: &mut Current,
    mut inspect: impl FnMut(&ProcessTable, Pid) -> KResult<R>,
) -> KResult<(Pid, R)> {
    loop {
        {
            let mut table = kernel.lock_table();
            if let Some(waiter) = table.serve_one(current.pid)? {
                let seen = inspect(&*table, waiter)?;
                trace!("serve: {:?} served {:?}", current.pid, waiter);
                return Ok((waiter, seen));
            }
            table.admit(current.pid)?;
            kernel.cpus[current.cpu].take_executing_process();
        }
        sched(kernel, current)?;
    }
}

/// Body of every process flow: wait for the first dispatch, then enter
/// user mode through forkret.
fn flow_main(kernel: Arc<Kernel>, pid: Pid, context: Arc<Context>) {
    let cpu = match context.park() {
        Resume::Run(cpu) => cpu,
        // freed or halted before it ever ran
        Resume::Reap | Resume::Halt => return,
    };
    let current = Current { pid, cpu, context };
    let mut ctx = UserContext::new(kernel.clone(), current);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| trap::forkret(&mut ctx)));
    if let Err(payload) = outcome {
        if payload.is::<FlowTerminated>() {
            trace!("{:?}: flow terminated", pid);
            return;
        }
        let reason = describe(&*payload);
        error!("{:?}: fault: {}", pid, reason);
        kernel.halt_all();
        kernel.record_fault(format!("{:?}: {}", pid, reason));
    }
}

fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
