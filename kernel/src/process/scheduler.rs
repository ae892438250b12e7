use std::sync::Arc;

use log::{info, trace};

use crate::{
    arch::{self, CpuId},
    cpu::PercpuBlock,
    error::{KResult, KernelError},
    machine::Kernel,
};

use super::{
    context::{switch, Context, Resume},
    manager::ProcessTable,
    Pid,
};

/// The per-core dispatch loop. Returns only once the machine halts.
pub fn scheduler(kernel: &Arc<Kernel>, cpu_id: CpuId) {
    let cpu = &kernel.cpus[cpu_id];
    info!("cpu{}: entering scheduler", cpu_id);
    while !kernel.is_halted() {
        if kernel.lapic.pending(cpu.hartid()) {
            kernel.lapic.eoi(cpu.hartid());
        }

        let picked = {
            let mut table = kernel.lock_table();
            pick(&mut table, cpu)
        };
        let (pid, context) = match picked {
            Ok(Some(picked)) => picked,
            Ok(None) => {
                arch::relax();
                continue;
            }
            Err(err) => kernel.panic(err),
        };

        trace!("cpu{}: dispatching {:?}", cpu_id, pid);
        match switch(cpu.scheduler(), &context, cpu_id) {
            Ok(Resume::Run(_)) => {}
            Ok(Resume::Halt) => break,
            Ok(Resume::Reap) => kernel.panic(KernelError::corrupted(format!(
                "scheduler of cpu{} reaped",
                cpu_id
            ))),
            Err(err) => kernel.panic(err),
        }
        trace!("cpu{}: back from {:?}", cpu_id, pid);

        // the process unlinked itself before switching back
        cpu.take_executing_process();
        kernel.kernel_space.activate(cpu);
    }
    cpu.halt();
    info!("cpu{}: halted", cpu_id);
}

/// Takes the head of the ready queue and installs it on `cpu`.
fn pick(table: &mut ProcessTable, cpu: &PercpuBlock) -> KResult<Option<(Pid, Arc<Context>)>> {
    let Some(pid) = table.pop_ready()? else {
        return Ok(None);
    };
    if !table.is_valid(pid) {
        return Err(KernelError::corrupted(format!("dispatching dead {:?}", pid)));
    }
    let pcb = table.get(pid)?;
    let space = pcb
        .addr_space()
        .ok_or_else(|| KernelError::corrupted(format!("{:?} has no address space", pid)))?;
    space.activate(cpu);
    cpu.set_kstack_top(pcb.kernel_stack().top());
    cpu.set_executing_process(pid);
    Ok(Some((pid, pcb.context().clone())))
}
