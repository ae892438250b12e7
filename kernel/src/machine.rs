use core::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Instant,
};

use log::{error, info, warn};
use spin::{Mutex, MutexGuard};

use crate::{
    arch::CpuId,
    allocator::frame_allocator::PhysicalMemory,
    config::KernelConfig,
    cpu::{CpuStatus, PercpuBlock},
    error::KernelError,
    lapic::InterruptController,
    mm::address_space::KernelSpace,
    process::{context::Context, manager::ProcessTable, Pid},
};

/// Kernel-wide state shared by every core and every flow.
pub struct Kernel {
    pub config: KernelConfig,
    // the single lock guarding every queue and every PCB
    table: Mutex<ProcessTable>,
    pub cpus: Vec<PercpuBlock>,
    pub memory: PhysicalMemory,
    pub kernel_space: KernelSpace,
    pub lapic: Arc<dyn InterruptController>,
    /// boot stack top for the core being started, one core at a time
    pub(crate) mpentry_kstack: AtomicUsize,
    halted: AtomicBool,
    fault: Mutex<Option<String>>,
    // leaf lock, never taken together with the table lock
    contexts: Mutex<Vec<Weak<Context>>>,
    flows: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    pub(crate) fn new(
        config: KernelConfig,
        cpus: Vec<PercpuBlock>,
        memory: PhysicalMemory,
        kernel_space: KernelSpace,
        lapic: Arc<dyn InterruptController>,
    ) -> Self {
        let contexts = cpus.iter().map(|cpu| Arc::downgrade(cpu.scheduler())).collect();
        Self {
            config,
            table: Mutex::new(ProcessTable::new()),
            cpus,
            memory,
            kernel_space,
            lapic,
            mpentry_kstack: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
            fault: Mutex::new(None),
            contexts: Mutex::new(contexts),
            flows: Mutex::new(Vec::new()),
        }
    }

    pub fn lock_table(&self) -> MutexGuard<'_, ProcessTable> {
        self.table.lock()
    }

    pub fn cpu_by_hartid(&self, hartid: u8) -> Option<&PercpuBlock> {
        self.cpus.iter().find(|cpu| cpu.hartid() == hartid)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn register_context(&self, context: &Arc<Context>) {
        let mut contexts = self.contexts.lock();
        contexts.retain(|weak| weak.strong_count() > 0);
        contexts.push(Arc::downgrade(context));
        if self.is_halted() {
            context.halt();
        }
    }

    pub(crate) fn track_flow(&self, flow: JoinHandle<()>) {
        let mut flows = self.flows.lock();
        flows.retain(|flow| !flow.is_finished());
        flows.push(flow);
    }

    /// Keeps the first fault only.
    pub(crate) fn record_fault(&self, what: String) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(what);
        }
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Stops every core and wakes every parked flow with `Resume::Halt`.
    pub fn halt_all(&self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        for cpu in &self.cpus {
            cpu.halt();
            cpu.scheduler().halt();
        }
        let contexts: Vec<_> = self.contexts.lock().iter().filter_map(Weak::upgrade).collect();
        for context in contexts {
            context.halt();
        }
    }

    /// A fatal condition: the whole machine halts, then the caller unwinds.
    pub fn panic(&self, err: KernelError) -> ! {
        let here = thread::current().name().unwrap_or("?").to_owned();
        error!("kernel panic on {}: {}", here, err);
        self.halt_all();
        self.record_fault(format!("{}: {}", here, err));
        panic!("kernel panic: {}", err)
    }
}

/// Process table contents at one instant, taken under the table lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    pub ready: Vec<Pid>,
    pub zombies: Vec<Pid>,
    pub live: Vec<Pid>,
    pub waiters: Vec<(Pid, Vec<Pid>)>,
    pub running: Vec<Option<Pid>>,
}

/// A booted machine. Dropping it shuts it down.
pub struct Machine {
    kernel: Arc<Kernel>,
    init: Pid,
    bsp: Option<JoinHandle<()>>,
}

impl Machine {
    pub(crate) fn new(kernel: Arc<Kernel>, init: Pid, bsp: JoinHandle<()>) -> Self {
        Self {
            kernel,
            init,
            bsp: Some(bsp),
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn init_pid(&self) -> Pid {
        self.init
    }

    pub fn snapshot(&self) -> TableSnapshot {
        let table = self.kernel.lock_table();
        let live = table.live();
        let waiters = live
            .iter()
            .map(|&pid| (pid, table.waiters_of(pid)))
            .filter(|(_, waiters)| !waiters.is_empty())
            .collect();
        let running = self.kernel.cpus.iter().map(|cpu| cpu.running_process()).collect();
        TableSnapshot {
            ready: table.ready_pids(),
            zombies: table.zombie_pids(),
            live,
            waiters,
            running,
        }
    }

    pub fn stat(&self) -> String {
        self.kernel.lock_table().stat()
    }

    pub fn check_invariants(&self) -> Result<(), KernelError> {
        self.kernel.lock_table().check_invariants()
    }

    pub fn is_valid(&self, pid: Pid) -> bool {
        self.kernel.lock_table().is_valid(pid)
    }

    pub fn cpu_status(&self, cpu: CpuId) -> CpuStatus {
        self.kernel.cpus[cpu].status()
    }

    pub fn started_transitions(&self, cpu: CpuId) -> usize {
        self.kernel.cpus[cpu].started_transitions()
    }

    /// Polls `pred` until it holds, the machine faults, or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, mut pred: impl FnMut(&Machine) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(self) {
                return true;
            }
            if self.kernel.fault().is_some() {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        pred(self)
    }

    pub fn fault(&self) -> Option<String> {
        self.kernel.fault()
    }

    pub fn shutdown(&mut self) {
        let Some(bsp) = self.bsp.take() else {
            return;
        };
        info!("machine: shutting down");
        self.kernel.halt_all();
        if bsp.join().is_err() {
            error!("machine: cpu0 went down with a panic");
        }
        self.kernel.lapic.shutdown();
        let flows: Vec<_> = core::mem::take(&mut *self.kernel.flows.lock());
        for flow in flows {
            if flow.join().is_err() {
                warn!("machine: a flow went down with a panic");
            }
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
