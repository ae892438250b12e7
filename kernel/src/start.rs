use core::sync::atomic::Ordering;
use std::{
    sync::{Arc, Weak},
    thread,
};

use log::{error, info};

use crate::{
    allocator::frame_allocator::PhysicalMemory,
    arch::{self, BSP},
    config::KernelConfig,
    cpu::{CpuStatus, PercpuBlock},
    error::{KResult, KernelError},
    lapic::{InterruptController, Lapic},
    loader::Image,
    machine::{Kernel, Machine},
    mm::{
        address_space::KernelSpace,
        layout::{MPENTRY_PADDR, PHYS_BASE},
        memory::PhysAddr,
    },
    print,
    process::{self, scheduler::scheduler},
};

/// Boots a machine with the simulated local APIC.
pub fn boot(config: KernelConfig, image: &Image) -> KResult<Machine> {
    let lapic = Arc::new(Lapic::new(config.flow_stack_size));
    boot_with(config, image, lapic)
}

/// The bootstrap sequence, run by the calling thread acting as the BSP.
/// Returns once every core is up and the first process is runnable.
pub fn boot_with(
    config: KernelConfig,
    image: &Image,
    lapic: Arc<dyn InterruptController>,
) -> KResult<Machine> {
    config.validate()?;
    print::init(config.log_level, config.color);
    info!("booting with {} cpus", config.ncpu);

    let memory = PhysicalMemory::new(PhysAddr::new(PHYS_BASE), config.memory_size);
    let kernel_space = KernelSpace::new(&memory)?;
    let cpus = (0..config.ncpu)
        .map(|index| -> KResult<PercpuBlock> {
            let stack = memory
                .acquire(config.kernel_stack_size)
                .ok_or(KernelError::OutOfMemory(config.kernel_stack_size))?;
            Ok(PercpuBlock::new(index, index as u8, stack, kernel_space.root()))
        })
        .collect::<KResult<Vec<_>>>()?;
    let kernel = Arc::new(Kernel::new(config, cpus, memory, kernel_space, lapic));

    let bsp = &kernel.cpus[BSP];
    bsp.set_kstack_top(bsp.boot_stack().as_usize() + kernel.config.kernel_stack_size);
    local_init(&kernel, bsp);
    bsp.publish_started();

    let booted = boot_aps(&kernel)
        .and_then(|()| process::user_init(&kernel, image))
        .and_then(|init| {
            let entry = kernel.clone();
            let bsp = thread::Builder::new()
                .name(format!("cpu{}", BSP))
                .stack_size(kernel.config.flow_stack_size)
                .spawn(move || scheduler(&entry, BSP))?;
            Ok((init, bsp))
        });
    match booted {
        Ok((init, bsp)) => {
            info!("boot finished, init is {:?}", init);
            Ok(Machine::new(kernel, init, bsp))
        }
        Err(err) => {
            error!("boot failed: {}", err);
            kernel.halt_all();
            kernel.lapic.shutdown();
            Err(err)
        }
    }
}

/// Brings the secondary cores up one at a time, then drops the boot
/// identity mapping.
fn boot_aps(kernel: &Arc<Kernel>) -> KResult<()> {
    let entry = PhysAddr::new(MPENTRY_PADDR);
    let weak = Arc::downgrade(kernel);
    kernel
        .lapic
        .load_boot_vector(entry, Arc::new(move |hartid| mp_main(&weak, hartid)));

    for cpu in kernel.cpus.iter().filter(|cpu| cpu.index() != BSP) {
        // the staging slot is read by the new core before it reports in
        let top = cpu.boot_stack().as_usize() + kernel.config.kernel_stack_size;
        kernel.mpentry_kstack.store(top, Ordering::SeqCst);
        kernel.lapic.start_core(cpu.hartid(), entry)?;
        while cpu.status() != CpuStatus::Started {
            if kernel.is_halted() {
                return Err(KernelError::Halted);
            }
            arch::relax();
        }
    }
    // every core runs on the final mapping by now
    kernel.kernel_space.clear_identity_map();
    Ok(())
}

/// Entry of a secondary core.
fn mp_main(kernel: &Weak<Kernel>, hartid: u8) {
    let Some(kernel) = kernel.upgrade() else {
        return;
    };
    let Some(cpu) = kernel.cpu_by_hartid(hartid) else {
        error!("mp_main: unknown hart {}", hartid);
        return;
    };
    cpu.set_kstack_top(kernel.mpentry_kstack.load(Ordering::SeqCst));
    local_init(&kernel, cpu);
    info!(
        "cpu{} (hart {}) initialization finished, stack top {:#x}",
        cpu.index(),
        hartid,
        cpu.kstack_top()
    );
    cpu.publish_started();
    scheduler(&kernel, cpu.index());
}

fn local_init(kernel: &Kernel, cpu: &PercpuBlock) {
    kernel.lapic.init(cpu.hartid());
    kernel
        .lapic
        .enable_timer(cpu.hartid(), kernel.config.timer_interval);
    kernel.kernel_space.activate(cpu);
}
