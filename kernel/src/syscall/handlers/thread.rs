//! Thread and signal syscalls.

use crate::error::Kind;
use crate::ipc::signal::SignalConfiguration;
use crate::syscall::{Invocation, SysResult};
use crate::task::process::{Descriptor, Process};
use crate::task::scheduler;
use crate::task::thread::{StackDesc, WakeReason};
use crate::time::Timeout;

/// Create a thread and install a thread descriptor for it. The new thread
/// starts suspended; the descriptor owns the creation reference.
pub fn thread_create(
    proc: &Process,
    entry: u64,
    argument: u64,
    stack_size: u64,
    flags: u32,
) -> SysResult<u64> {
    let tid = scheduler::spawn(entry, argument, None, stack_size, flags)?;
    Ok(proc.install(Descriptor::Thread(tid)))
}

/// Make a suspended thread schedulable.
pub fn thread_resume(proc: &Process, desc: u64) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    Ok(scheduler::resume(tid)?)
}

/// Suspend a thread; `wait` blocks the caller until the stop is observed.
pub fn thread_suspend(proc: &Process, desc: u64, wait: bool) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    Ok(scheduler::suspend(tid, wait)?)
}

/// Kill a thread. Its descriptor remains installed until closed.
pub fn thread_kill(proc: &Process, desc: u64) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    Ok(scheduler::kill(tid)?)
}

/// Close a thread descriptor, dropping its scheduler reference.
pub fn thread_close(proc: &Process, desc: u64) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    proc.uninstall(desc)?;
    Ok(scheduler::release(tid)?)
}

/// Increment / decrement a thread's block count.
pub fn thread_block(proc: &Process, desc: u64) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    Ok(scheduler::block(tid)?)
}

pub fn thread_unblock(proc: &Process, desc: u64) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    Ok(scheduler::unblock(tid)?)
}

/// Voluntarily give up the CPU.
pub fn thread_yield() -> SysResult<()> {
    scheduler::yield_now();
    Ok(())
}

/// Sleep the current thread for the given timeout. Parks; the re-entered
/// call completes once the timer (or an early resume) woke the thread.
pub fn thread_sleep(timeout: Timeout) -> Invocation<()> {
    let Some(tid) = scheduler::current() else {
        return Invocation::Complete(Err(Kind::NoSuchResource.into()));
    };
    if scheduler::take_wake_reason(tid).is_some() {
        return Invocation::Complete(Ok(()));
    }
    match scheduler::suspend_timeout(tid, false, timeout) {
        Ok(()) => Invocation::Parked,
        Err(kind) => Invocation::Complete(Err(kind.into())),
    }
}

/// Exit the current thread.
pub fn thread_exit(code: u32) -> SysResult<()> {
    Ok(scheduler::exit_current(code)?)
}

// =========================================================================
// Signals
// =========================================================================

/// Install or clear a signal configuration slot on a thread.
pub fn signal_configure(
    proc: &Process,
    desc: u64,
    signal: u32,
    config: Option<SignalConfiguration>,
) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    Ok(scheduler::signal_configure(tid, signal, config)?)
}

/// Raise a signal on a thread.
pub fn signal_raise(proc: &Process, desc: u64, signal: u32) -> SysResult<()> {
    let tid = proc.lookup_thread(desc)?;
    Ok(scheduler::signal_raise(tid, signal)?)
}

/// Replace the calling thread's signal mask; returns the previous mask.
pub fn signal_mask(mask: u64) -> SysResult<u64> {
    let tid = scheduler::current().ok_or(Kind::NoSuchResource)?;
    Ok(scheduler::signal_set_mask(tid, mask)?)
}

/// Configure the calling thread's alternate signal stack.
pub fn signal_stack(stack: Option<StackDesc>) -> SysResult<()> {
    let tid = scheduler::current().ok_or(Kind::NoSuchResource)?;
    Ok(scheduler::signal_set_stack(tid, stack)?)
}

/// Return from the innermost signal handler frame.
pub fn signal_return() -> SysResult<()> {
    let tid = scheduler::current().ok_or(Kind::NoSuchResource)?;
    Ok(scheduler::signal_return(tid)?)
}

/// Kernel-to-user return boundary for a thread: deliver the next pending
/// signal, if any. The embedder calls this wherever a real kernel would
/// drop back to user mode. Returns the delivered signal number.
pub fn return_to_user(tid: u64) -> SysResult<Option<u32>> {
    Ok(scheduler::deliver_pending_signal(tid)?)
}

/// Leftover wake reason on the current thread, if the embedder needs to
/// inspect why a parked syscall resumed without re-entering it.
pub fn pending_wake_reason(tid: u64) -> Option<WakeReason> {
    scheduler::take_wake_reason(tid)
}
