#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use kernel::{boot, Image, KernelConfig, Machine, VirtAddr};

pub const TIMEOUT: Duration = Duration::from_secs(20);

pub const MAIN: VirtAddr = VirtAddr::new(0x80_0000);
pub const CHILD: VirtAddr = VirtAddr::new(0x80_0100);
pub const DATA: VirtAddr = VirtAddr::new(0x90_0000);

/// Collects what user routines observed, shared with the test thread.
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, event: T) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub fn boot_cpus(ncpu: usize, image: &Image) -> Machine {
    boot(KernelConfig::with_cpus(ncpu), image).expect("boot")
}

/// Waits until the init process has exited and nothing is runnable.
pub fn settle(machine: &Machine) {
    let init = machine.init_pid();
    assert!(
        machine.wait_until(TIMEOUT, |m| {
            let snapshot = m.snapshot();
            snapshot.zombies.contains(&init)
                && snapshot.ready.is_empty()
                && snapshot.running.iter().all(Option::is_none)
        }),
        "machine did not settle: fault {:?}\n{}",
        machine.fault(),
        machine.stat()
    );
    assert_eq!(machine.fault(), None);
    machine.check_invariants().expect("invariants");
}
