//! Thread data structure and lifecycle state management.
//!
//! Each thread has a unique 64-bit TID, a saved CPU context, a stack
//! descriptor (caller-provided or kernel-allocated), a reference count, one
//! wait link (membership in at most one wait queue), and four wait queues of
//! its own that other threads park on to observe death, destruction,
//! suspension, and blocking.

use crate::ipc::signal::SignalState;
use crate::sync::waitq::{WaiterId, Waitq};
use crate::task::context::CpuContext;
use crate::time::TimerId;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Default stack size for kernel-allocated thread stacks.
pub const DEFAULT_STACK_SIZE: u64 = 128 * 1024;

/// Execution state of a thread in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Eligible to run but not on the CPU.
    NotRunning,
    /// Taken off the eligible set until resumed or woken.
    Suspended,
    /// Currently executing.
    Running,
    /// Finished; terminal. A dead thread never changes state again.
    Dead,
    /// Blocked inside a kernel operation that a signal has interrupted.
    InterruptedInKernel,
}

bitflags! {
    /// Orthogonal thread flags, held alongside the execution state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Suspension requested; committed at the next scheduling point.
        const PENDING_SUSPEND     = 1 << 0;
        /// Death requested; committed at the next scheduling point.
        const PENDING_DEATH       = 1 << 1;
        /// On wakeup, transition to blocked instead of runnable.
        const PENDING_BLOCK       = 1 << 2;
        /// Mid-way through the wait-queue suspend protocol; the thread holds
        /// the queue's lock until the suspend transition commits.
        const HOLDING_WAITQ_LOCK  = 1 << 3;
        /// A signal arrived while the thread was in kernel space.
        const KERNEL_INTERRUPTED  = 1 << 4;
    }
}

bitflags! {
    /// Flags accepted by thread creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// The thread runs userspace code and carries signal state.
        const USERSPACE = 1 << 0;
    }
}

/// Why a parked thread was resumed. Consumed by the re-entered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The event the thread was waiting for occurred (or a spurious wake).
    Event,
    /// The thread's timeout expired before the event.
    TimedOut,
    /// A signal interrupted the wait.
    Interrupted,
}

/// A thread's stack: base address, size, and whether the kernel owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackDesc {
    pub base: u64,
    pub size: u64,
    /// True if the kernel allocated this stack and frees it on destruction;
    /// false for caller-provided stacks.
    pub owned: bool,
}

/// Wait-queue membership: the queue and this thread's waiter in it.
/// A thread is on at most one queue at a time.
pub struct WaitLink {
    pub wq: Waitq,
    pub waiter: WaiterId,
}

// Tri-state interrupt marker values.
const INT_CLEAR: u8 = 0;
const INT_MARKED: u8 = 1;
const INT_CONSUMED: u8 = 2;

/// Atomic tri-state flag an in-kernel blocking call polls to learn that a
/// signal arrived and it should unwind.
#[derive(Debug, Default)]
pub struct InterruptMarker(AtomicU8);

impl InterruptMarker {
    /// Mark the thread interrupted. Idempotent while unconsumed.
    pub fn mark(&self) {
        let _ = self
            .0
            .compare_exchange(INT_CLEAR, INT_MARKED, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Consume a pending mark. Returns true exactly once per mark.
    pub fn take(&self) -> bool {
        self.0
            .compare_exchange(INT_MARKED, INT_CONSUMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Reset to clear; called when the unwound call has reported
    /// `interrupted` to its caller.
    pub fn clear(&self) {
        self.0.store(INT_CLEAR, Ordering::Release);
    }

    /// True if a mark is pending and unconsumed.
    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::Acquire) == INT_MARKED
    }
}

/// A kernel or user thread.
pub struct Thread {
    pub tid: u64,
    pub state: ExecutionState,
    pub flags: ThreadFlags,
    pub context: CpuContext,
    pub stack: StackDesc,
    /// Strong references held by descriptors and kernel subsystems.
    /// Reaching zero (once dead) triggers destruction.
    pub refcount: u32,
    /// Membership in the one wait queue this thread is parked on, if any.
    pub wait_link: Option<WaitLink>,
    /// True if the current park may be aborted by a signal.
    pub wait_interruptible: bool,
    /// Timer armed for a timed suspension or timed wait.
    pub timeout_timer: Option<TimerId>,
    /// Why the last park ended; consumed by the re-entered operation.
    pub wake_reason: Option<WakeReason>,
    /// Nonzero means ineligible to run regardless of state.
    pub block_count: u32,
    /// Exit code recorded at death.
    pub exit_code: Option<u32>,
    /// Signal configuration and pending set; userspace threads only.
    pub signals: Option<SignalState>,
    pub interrupt_marker: InterruptMarker,
    /// Woken when the thread dies.
    pub death_wq: Waitq,
    /// Woken when the refcount reaches zero and the record is destroyed.
    pub destroy_wq: Waitq,
    /// Woken when a suspend transition commits.
    pub suspend_wq: Waitq,
    /// Woken when the thread stops running with a nonzero block count.
    pub block_wq: Waitq,
}

impl Thread {
    /// Create a new thread record in the suspended state with refcount 1.
    ///
    /// `stack` is used as-is when provided (caller retains ownership);
    /// otherwise a kernel-owned stack of `stack_size` bytes is described at a
    /// kernel-assigned base.
    pub fn new(
        entry: u64,
        argument: u64,
        stack: Option<StackDesc>,
        stack_size: u64,
        flags: CreateFlags,
        asid: u64,
    ) -> Self {
        static NEXT_STACK_BASE: AtomicU64 = AtomicU64::new(0x7000_0000_0000);

        let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        let stack = stack.unwrap_or_else(|| {
            let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
            let base = NEXT_STACK_BASE.fetch_add(size.next_power_of_two(), Ordering::Relaxed);
            StackDesc { base, size, owned: true }
        });

        let context = CpuContext::for_entry(entry, argument, stack.base + stack.size, asid);

        Thread {
            tid,
            state: ExecutionState::Suspended,
            flags: ThreadFlags::empty(),
            context,
            stack,
            refcount: 1,
            wait_link: None,
            wait_interruptible: false,
            timeout_timer: None,
            wake_reason: None,
            block_count: 0,
            exit_code: None,
            signals: if flags.contains(CreateFlags::USERSPACE) {
                Some(SignalState::new())
            } else {
                None
            },
            interrupt_marker: InterruptMarker::default(),
            death_wq: Waitq::new(),
            destroy_wq: Waitq::new(),
            suspend_wq: Waitq::new(),
            block_wq: Waitq::new(),
        }
    }

    /// True if the scheduler may pick this thread.
    pub fn is_eligible(&self) -> bool {
        self.state == ExecutionState::NotRunning
            && self.block_count == 0
            && !self
                .flags
                .intersects(ThreadFlags::PENDING_SUSPEND | ThreadFlags::PENDING_DEATH)
    }

    /// True once the thread has reached its terminal state.
    pub fn is_dead(&self) -> bool {
        self.state == ExecutionState::Dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thread_is_suspended_with_refcount_one() {
        let t = Thread::new(0x4000, 0, None, 0, CreateFlags::empty(), 1);
        assert_eq!(t.state, ExecutionState::Suspended);
        assert_eq!(t.refcount, 1);
        assert_eq!(t.context.pc, 0x4000);
        assert_eq!(t.context.sp, t.stack.base + t.stack.size);
        assert!(t.stack.owned);
        assert!(t.signals.is_none());
    }

    #[test]
    fn test_caller_provided_stack_is_not_owned() {
        let stack = StackDesc { base: 0x1_0000, size: 0x4000, owned: false };
        let t = Thread::new(0x4000, 0, Some(stack), 0, CreateFlags::USERSPACE, 1);
        assert_eq!(t.stack, stack);
        assert!(t.signals.is_some());
    }

    #[test]
    fn test_interrupt_marker_tri_state() {
        let m = InterruptMarker::default();
        assert!(!m.take());
        m.mark();
        assert!(m.is_marked());
        assert!(m.take());
        assert!(!m.take(), "consumed; second take must fail");
        m.mark();
        assert!(!m.is_marked(), "mark after consume is a no-op until cleared");
        m.clear();
        m.mark();
        assert!(m.take());
    }

    #[test]
    fn test_eligibility() {
        let mut t = Thread::new(0x4000, 0, None, 0, CreateFlags::empty(), 1);
        assert!(!t.is_eligible(), "suspended at creation");
        t.state = ExecutionState::NotRunning;
        assert!(t.is_eligible());
        t.block_count = 1;
        assert!(!t.is_eligible());
        t.block_count = 0;
        t.flags.insert(ThreadFlags::PENDING_SUSPEND);
        assert!(!t.is_eligible());
    }
}
