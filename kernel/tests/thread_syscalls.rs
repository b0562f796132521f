//! Thread syscall tests: descriptors, lifecycle, sleep, and signal
//! configuration through the handler layer.

use anillo_kernel::error::Kind;
use anillo_kernel::ipc::signal::{SignalConfiguration, SignalFlags};
use anillo_kernel::syscall::handlers::thread::{
    signal_configure, signal_raise, thread_block, thread_close, thread_create, thread_kill,
    thread_resume, thread_sleep, thread_suspend, thread_unblock, thread_yield,
};
use anillo_kernel::task::process::Process;
use anillo_kernel::task::scheduler;
use anillo_kernel::task::thread::{CreateFlags, ExecutionState};
use anillo_kernel::time::{self, Timeout};
use std::sync::{Mutex, MutexGuard, OnceLock};

static KERNEL_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn kernel_test() -> MutexGuard<'static, ()> {
    let guard = KERNEL_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    anillo_kernel::reset();
    anillo_kernel::init();
    guard
}

#[test]
fn test_thread_lifecycle_through_descriptors() {
    let _k = kernel_test();
    let proc = Process::new();

    let desc = thread_create(&proc, 0x1000, 42, 0, 0).unwrap();
    let tid = proc.lookup_thread(desc).unwrap();
    assert_eq!(scheduler::execution_state(tid).unwrap(), ExecutionState::Suspended);

    thread_resume(&proc, desc).unwrap();
    assert_eq!(scheduler::schedule(), Some(tid));

    thread_suspend(&proc, desc, false).unwrap();
    assert_eq!(scheduler::execution_state(tid).unwrap(), ExecutionState::Suspended);

    thread_resume(&proc, desc).unwrap();
    thread_kill(&proc, desc).unwrap();
    assert_eq!(scheduler::execution_state(tid).unwrap(), ExecutionState::Dead);

    // Closing the descriptor drops the creation reference; the record goes
    // away with it.
    thread_close(&proc, desc).unwrap();
    assert_eq!(scheduler::execution_state(tid).err(), Some(Kind::NoSuchResource));
}

#[test]
fn test_thread_create_rejects_bad_arguments() {
    let _k = kernel_test();
    let proc = Process::new();
    let err = thread_create(&proc, 0, 0, 0, 0).err().unwrap();
    assert_eq!(err.kind, Kind::InvalidArgument);
    let err = thread_create(&proc, 0x1000, 0, 0, 0xF0).err().unwrap();
    assert_eq!(err.kind, Kind::InvalidArgument);
}

#[test]
fn test_block_unblock_through_descriptors() {
    let _k = kernel_test();
    let proc = Process::new();
    let desc = thread_create(&proc, 0x1000, 0, 0, 0).unwrap();
    thread_resume(&proc, desc).unwrap();

    thread_block(&proc, desc).unwrap();
    assert_eq!(scheduler::schedule(), None);
    thread_unblock(&proc, desc).unwrap();
    assert!(scheduler::schedule().is_some());
}

#[test]
fn test_sleep_parks_until_timer() {
    let _k = kernel_test();
    let proc = Process::new();
    let desc = thread_create(&proc, 0x1000, 0, 0, CreateFlags::USERSPACE.bits()).unwrap();
    let tid = proc.lookup_thread(desc).unwrap();
    thread_resume(&proc, desc).unwrap();
    assert_eq!(scheduler::schedule(), Some(tid));

    let step = thread_sleep(Timeout::relative(2_000));
    assert!(step.is_parked());
    assert_eq!(scheduler::execution_state(tid).unwrap(), ExecutionState::Suspended);

    time::advance(2_000);
    assert_eq!(scheduler::schedule(), Some(tid));
    thread_sleep(Timeout::relative(2_000)).expect_complete().unwrap();
}

#[test]
fn test_yield_rotates() {
    let _k = kernel_test();
    let proc = Process::new();
    let d1 = thread_create(&proc, 0x1000, 0, 0, 0).unwrap();
    let d2 = thread_create(&proc, 0x2000, 0, 0, 0).unwrap();
    let t1 = proc.lookup_thread(d1).unwrap();
    let t2 = proc.lookup_thread(d2).unwrap();
    thread_resume(&proc, d1).unwrap();
    thread_resume(&proc, d2).unwrap();

    assert_eq!(scheduler::schedule(), Some(t1));
    thread_yield().unwrap();
    assert_eq!(scheduler::current(), Some(t2));
    thread_yield().unwrap();
    assert_eq!(scheduler::current(), Some(t1));
}

#[test]
fn test_signal_configure_and_raise_through_descriptors() {
    let _k = kernel_test();
    let proc = Process::new();
    let desc = thread_create(&proc, 0x1000, 0, 0, CreateFlags::USERSPACE.bits()).unwrap();
    let tid = proc.lookup_thread(desc).unwrap();
    thread_resume(&proc, desc).unwrap();

    signal_configure(
        &proc,
        desc,
        4,
        Some(SignalConfiguration {
            handler: 0x6000,
            context: 0,
            flags: SignalFlags::ENABLED,
        }),
    )
    .unwrap();
    signal_raise(&proc, desc, 4).unwrap();
    assert_eq!(scheduler::deliver_pending_signal(tid).unwrap(), Some(4));
    assert_eq!(scheduler::thread_context(tid).unwrap().pc, 0x6000);
}

#[test]
fn test_signal_raise_on_kernel_thread_is_invalid() {
    let _k = kernel_test();
    let proc = Process::new();
    let desc = thread_create(&proc, 0x1000, 0, 0, 0).unwrap();
    let err = signal_raise(&proc, desc, 1).err().unwrap();
    assert_eq!(err.kind, Kind::InvalidArgument);
}
