use log::trace;
use primitive_enum::primitive_enum;

use crate::{
    error::{KResult, KernelError},
    ipc,
    process::{self, Pid},
};

use super::UserContext;

primitive_enum! {
Syscall u64;
    SysFork = 1,
    SysExit = 2,
    SysWait = 3,
    SysServe = 4,
    SysYield = 5,
    SysGetpid = 6,
    SysSendi = 7,
    SysRecvi = 8,
}

/// Runs the system call saved in the caller's trap frame and returns the
/// value for `rax`. `SysExit` does not return.
pub fn dispatch(ctx: &mut UserContext) -> KResult<u64> {
    let tf = ctx.trap_frame();
    let call = Syscall::from(tf.rax).ok_or(KernelError::BadSyscall(tf.rax))?;
    trace!("{:?}: {:?}({:#x}, {:#x})", ctx.pid(), call, tf.rdi, tf.rsi);

    let (kernel, current) = ctx.parts();
    match call {
        Syscall::SysFork => process::fork(kernel, current).map(|child| child.as_raw()),
        Syscall::SysExit => process::exit(kernel, current),
        Syscall::SysWait => process::wait(kernel, current, Pid::from_raw(tf.rdi)).map(|()| 0),
        Syscall::SysServe => process::serve(kernel, current).map(|waiter| waiter.as_raw()),
        Syscall::SysYield => process::yield_now(kernel, current).map(|()| 0),
        Syscall::SysGetpid => Ok(current.pid().as_raw()),
        Syscall::SysSendi => {
            ipc::sendi(kernel, current, Pid::from_raw(tf.rdi), tf.rsi).map(|()| 0)
        }
        Syscall::SysRecvi => {
            let (sender, value) = ipc::recvi(kernel, current)?;
            ctx.modify_trap_frame(|tf| tf.rdx = value);
            Ok(sender.as_raw())
        }
    }
}
