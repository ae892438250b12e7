use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::{
    arch::CpuId,
    error::{KResult, KernelError},
};

/// User-mode register state saved on a trap.
///
/// System calls pass their number in `rax` and arguments in `rdi` and
/// `rsi`; the result comes back in `rax` (and `rdx` for a second value).
/// `rip` is where the user resumes.
#[repr(C)]
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub ss: u16,
}

const GD_UT: u16 = 0x18;
const GD_UD: u16 = 0x20;
const RPL_USER: u16 = 3;
const FL_IF: u64 = 0x200;

impl TrapFrame {
    /// A fresh frame that returns to user mode with interrupts on.
    pub fn user() -> Self {
        Self {
            cs: GD_UT | RPL_USER,
            ss: GD_UD | RPL_USER,
            rflags: FL_IF,
            ..Self::default()
        }
    }

    /// the value a system call returns to user
    pub fn set_return(&mut self, value: u64) {
        self.rax = value;
    }
}

/// What a parked flow is resumed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// keep running, now on this core
    Run(CpuId),
    /// the flow's process has been freed
    Reap,
    /// the machine is going down
    Halt,
}

struct ResumeSlot {
    pending: Option<Resume>,
    halted: bool,
    resumes: u64,
}

/// The saved context of a flow: a single-slot gate the flow parks on.
///
/// Exactly one party may hand the flow a token at a time. A token posted
/// before the flow parks stays in the slot, so no switch is ever lost.
pub struct Context {
    name: String,
    slot: Mutex<ResumeSlot>,
    wakeup: Condvar,
}

impl Context {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            slot: Mutex::new(ResumeSlot {
                pending: None,
                halted: false,
                resumes: 0,
            }),
            wakeup: Condvar::new(),
        })
    }

    fn slot(&self) -> MutexGuard<'_, ResumeSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, resume: Resume) -> KResult<()> {
        let mut slot = self.slot();
        if slot.halted {
            return Ok(());
        }
        if let Some(stale) = slot.pending {
            return Err(KernelError::corrupted(format!(
                "{}: {:?} posted over pending {:?}",
                self.name, resume, stale
            )));
        }
        trace!("{}: <- {:?}", self.name, resume);
        slot.pending = Some(resume);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Blocks until a token arrives. Halting wins over anything pending.
    pub fn park(&self) -> Resume {
        let mut slot = self.slot();
        loop {
            if slot.halted {
                return Resume::Halt;
            }
            if let Some(resume) = slot.pending.take() {
                slot.resumes += 1;
                return resume;
            }
            slot = self
                .wakeup
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn halt(&self) {
        let mut slot = self.slot();
        slot.halted = true;
        self.wakeup.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.slot().halted
    }

    /// number of tokens consumed
    pub fn resumes(&self) -> u64 {
        self.slot().resumes
    }
}

/// Hands `cpu` to `to` and suspends the caller on `from`.
///
/// Returns whatever token later resumes `from`. The caller must have
/// published its new position and released every lock beforehand.
pub fn switch(from: &Context, to: &Context, cpu: CpuId) -> KResult<Resume> {
    trace!("switch: {} -> {} on cpu{}", from.name, to.name, cpu);
    to.post(Resume::Run(cpu))?;
    Ok(from.park())
}
