use core::time::Duration;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use hashbrown::HashMap;
use log::{debug, error, info, trace};
use spin::Mutex;

use crate::{
    arch,
    error::{KResult, KernelError},
    mm::{layout::NCPU, memory::PhysAddr},
};

/// What a started core executes, given its hardware id.
pub type BootRoutine = Arc<dyn Fn(u8) + Send + Sync>;

/// The local interrupt controller of every core, plus the startup IPI path.
pub trait InterruptController: Send + Sync {
    /// per-core programming, done by the core itself
    fn init(&self, hartid: u8);
    fn enable_timer(&self, hartid: u8, interval: u32);
    /// installs the code found at `entry` by cores started there
    fn load_boot_vector(&self, entry: PhysAddr, routine: BootRoutine);
    /// INIT + STARTUP directed at `hartid`
    fn start_core(&self, hartid: u8, entry: PhysAddr) -> KResult<()>;
    /// true if the timer of `hartid` has fired and is not yet acknowledged
    fn pending(&self, hartid: u8) -> bool;
    fn eoi(&self, hartid: u8);
    /// waits for every started core to leave its boot routine
    fn shutdown(&self);
}

#[derive(Default)]
struct LocalApic {
    enabled: bool,
    // timer period, in nanoseconds of host time
    interval: Option<Duration>,
    last_tick: Duration,
    in_service: bool,
    acknowledged: u64,
}

/// A host simulation: starting a core spawns a thread named after it.
pub struct Lapic {
    locals: Vec<Mutex<LocalApic>>,
    vectors: Mutex<HashMap<PhysAddr, BootRoutine>>,
    cores: Mutex<Vec<JoinHandle<()>>>,
    stack_size: usize,
}

impl Lapic {
    pub fn new(stack_size: usize) -> Self {
        Self {
            locals: (0..NCPU).map(|_| Mutex::new(LocalApic::default())).collect(),
            vectors: Mutex::new(HashMap::new()),
            cores: Mutex::new(Vec::new()),
            stack_size,
        }
    }

    fn local(&self, hartid: u8) -> &Mutex<LocalApic> {
        &self.locals[hartid as usize % NCPU]
    }

    pub fn is_enabled(&self, hartid: u8) -> bool {
        self.local(hartid).lock().enabled
    }

    /// interrupts acknowledged so far on `hartid`
    pub fn acknowledged(&self, hartid: u8) -> u64 {
        self.local(hartid).lock().acknowledged
    }
}

impl InterruptController for Lapic {
    fn init(&self, hartid: u8) {
        let mut local = self.local(hartid).lock();
        local.enabled = true;
        local.in_service = false;
        trace!("lapic{}: enabled", hartid);
    }

    fn enable_timer(&self, hartid: u8, interval: u32) {
        let mut local = self.local(hartid).lock();
        local.interval = Some(Duration::from_nanos(interval as u64));
        local.last_tick = arch::time();
        debug!("lapic{}: periodic timer, interval {}", hartid, interval);
    }

    fn load_boot_vector(&self, entry: PhysAddr, routine: BootRoutine) {
        self.vectors.lock().insert(entry, routine);
    }

    fn start_core(&self, hartid: u8, entry: PhysAddr) -> KResult<()> {
        let routine = self
            .vectors
            .lock()
            .get(&entry)
            .cloned()
            .ok_or_else(|| KernelError::corrupted(format!("no boot code at {:?}", entry)))?;
        info!("lapic: STARTUP hart {} at {:?}", hartid, entry);
        let handle = thread::Builder::new()
            .name(format!("cpu{}", hartid))
            .stack_size(self.stack_size)
            .spawn(move || routine(hartid))?;
        self.cores.lock().push(handle);
        Ok(())
    }

    fn pending(&self, hartid: u8) -> bool {
        let mut local = self.local(hartid).lock();
        let Some(interval) = local.interval else {
            return false;
        };
        if !local.enabled {
            return false;
        }
        let now = arch::time();
        if !local.in_service && now - local.last_tick >= interval {
            local.in_service = true;
            local.last_tick = now;
        }
        local.in_service
    }

    fn eoi(&self, hartid: u8) {
        let mut local = self.local(hartid).lock();
        if local.in_service {
            local.in_service = false;
            local.acknowledged += 1;
        }
    }

    fn shutdown(&self) {
        let cores: Vec<_> = core::mem::take(&mut *self.cores.lock());
        for core in cores {
            let name = core.thread().name().unwrap_or("cpu?").to_owned();
            if core.join().is_err() {
                error!("lapic: {} went down with a panic", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn started_core_runs_boot_vector() {
        let lapic = Lapic::new(64 * 1024);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        lapic.load_boot_vector(
            PhysAddr::new(0x7000),
            Arc::new(move |hartid| {
                let name = thread::current().name().map(str::to_owned);
                tx.lock().send((hartid, name)).unwrap();
            }),
        );
        lapic.start_core(3, PhysAddr::new(0x7000)).unwrap();
        let (hartid, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(hartid, 3);
        assert_eq!(name.as_deref(), Some("cpu3"));
        lapic.shutdown();
    }

    #[test]
    fn missing_boot_vector() {
        let lapic = Lapic::new(64 * 1024);
        assert!(matches!(
            lapic.start_core(1, PhysAddr::new(0x8000)),
            Err(KernelError::CorruptedState(_))
        ));
    }

    #[test]
    fn timer_fires_until_acknowledged() {
        let lapic = Lapic::new(64 * 1024);
        lapic.init(0);
        assert!(!lapic.pending(0));
        lapic.enable_timer(0, 1);
        thread::sleep(Duration::from_millis(1));
        assert!(lapic.pending(0));
        assert!(lapic.pending(0));
        lapic.eoi(0);
        assert_eq!(lapic.acknowledged(0), 1);
    }
}
