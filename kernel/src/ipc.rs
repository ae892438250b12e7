//! Integer messages on top of the wait/serve rendezvous.
//!
//! A sender parks its value in its own mailbox and waits on the receiver;
//! the receiver serves the oldest waiter and reads that mailbox. Messages
//! are therefore delivered in the order their senders started waiting.

use log::debug;

use crate::{
    error::KResult,
    machine::Kernel,
    process::{self, Current, Pid},
};

pub fn sendi(kernel: &Kernel, current: &mut Current, target: Pid, value: u64) -> KResult<()> {
    kernel
        .lock_table()
        .get_mut(current.pid())?
        .set_mailbox(value);
    process::wait(kernel, current, target)
}

pub fn recvi(kernel: &Kernel, current: &mut Current) -> KResult<(Pid, u64)> {
    let (sender, value) =
        process::serve_with(kernel, current, |table, waiter| Ok(table.get(waiter)?.mailbox()))?;
    debug!("recvi: {:?} <- {:?}: {}", current.pid(), sender, value);
    Ok((sender, value))
}
