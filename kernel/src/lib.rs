//! Anillo kernel core: wait queues, threads and scheduling, channel IPC,
//! and the syscall surface.
//!
//! This build is a host-runnable model of the kernel: the CPU context is a
//! portable register bank, and the clock, preemption timer, and
//! kernel-to-user returns are driven explicitly by the embedder. The state
//! machines, locking protocol, and error surface are the kernel's own; only
//! the platform edges are simulated.
//!
//! Global kernel state lives in per-subsystem singletons. [`init`] installs
//! them and [`reset`] tears them down; embedders running independent kernel
//! instances in one process serialize around that pair.

pub mod error;
pub mod ipc;
pub mod memory;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod time;

/// Bring up the kernel singletons. Idempotent.
pub fn init() {
    task::scheduler::init();
}

/// Tear down every kernel singleton: threads, timers, clock.
pub fn reset() {
    task::scheduler::reset();
}
