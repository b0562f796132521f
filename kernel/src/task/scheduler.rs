//! Preemptive scheduler: thread lifecycle, context switching, suspension,
//! blocking, timed sleep, and signal plumbing.
//!
//! One manager owns every thread record behind a single spinlock, in the
//! process-wide `SCHEDULER` singleton. The run queue is a FIFO of TIDs; the
//! scheduler picks the head of the eligible set (not-running, not blocked,
//! no pending suspend or death). Preemption is driven by a one-shot quantum
//! timer; voluntary switches use the immediate context-switch form and the
//! timer path uses the delayed form through the staged interrupt frame.
//!
//! Lock order: wait queue -> scheduler. The scheduler lock is never held
//! while invoking wait-queue callbacks; wakes are collected and performed
//! after the guard drops.

use crate::error::{Kind, Result};
use crate::ipc::signal::{RaiseDisposition, SignalConfiguration, SignalFlags, SignalFrame};
use crate::sync::spinlock::Spinlock;
use crate::sync::waitq::{WaiterId, Waitq};
use crate::task::context::{Cpu, CpuContext};
use crate::task::thread::{
    CreateFlags, ExecutionState, StackDesc, Thread, ThreadFlags, WaitLink, WakeReason,
};
use crate::time::{self, Timeout, TimerId};
use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Preemption quantum. One-shot; re-armed every dispatch.
pub const QUANTUM_NS: u64 = 10_000_000;

static NEXT_ASID: AtomicU64 = AtomicU64::new(1);

static SCHEDULER: Spinlock<Option<Scheduler>> = Spinlock::new(None);

struct Scheduler {
    cpu: Cpu,
    threads: Vec<Thread>,
    run_queue: VecDeque<u64>,
    current: Option<u64>,
    preempt_timer: Option<TimerId>,
}

/// Wait-queue wakes that must run after the scheduler lock drops.
#[derive(Default)]
struct DeferredWakes {
    wake_all: Vec<Waitq>,
    unwaits: Vec<(Waitq, WaiterId)>,
}

impl DeferredWakes {
    fn run(self) {
        for (wq, waiter) in self.unwaits {
            wq.unwait(waiter);
        }
        for wq in self.wake_all {
            wq.wake_all();
        }
    }
}

impl Scheduler {
    fn new() -> Self {
        Scheduler {
            cpu: Cpu::new(),
            threads: Vec::new(),
            run_queue: VecDeque::new(),
            current: None,
            preempt_timer: None,
        }
    }

    fn find_idx(&self, tid: u64) -> Option<usize> {
        self.threads.iter().position(|t| t.tid == tid)
    }

    fn enqueue(&mut self, tid: u64) {
        // Duplicates would let one thread occupy two scheduling slots.
        if !self.run_queue.contains(&tid) {
            self.run_queue.push_back(tid);
        }
    }

    fn dequeue(&mut self, tid: u64) {
        self.run_queue.retain(|&t| t != tid);
    }

    /// Save the live CPU bank into the current thread and leave the CPU
    /// without a thread. `delayed` selects the interrupt-return switch form.
    fn evict_current(&mut self, delayed: bool) {
        let Some(tid) = self.current.take() else { return };
        if let Some(idx) = self.find_idx(tid) {
            let mut saved = CpuContext::default();
            if delayed {
                self.cpu.switch_delayed(&mut saved, &CpuContext::default());
            } else {
                self.cpu.switch_immediate(&mut saved, &CpuContext::default());
            }
            self.threads[idx].context = saved;
        }
        if let Some(timer) = self.preempt_timer.take() {
            time::cancel(timer);
        }
    }

    /// Pick the head of the eligible set and install it on the CPU.
    /// Re-arms the quantum timer for the dispatched thread.
    fn dispatch_next(&mut self, delayed: bool) -> Option<u64> {
        debug_assert!(self.current.is_none());
        if let Some(timer) = self.preempt_timer.take() {
            time::cancel(timer);
        }
        let next = loop {
            let tid = self.run_queue.pop_front()?;
            match self.find_idx(tid) {
                Some(idx) if self.threads[idx].is_eligible() => break idx,
                _ => continue,
            }
        };

        // A store completed before arming the switch is visible to the
        // incoming thread after the switch.
        fence(Ordering::SeqCst);

        let tid = self.threads[next].tid;
        self.threads[next].state = ExecutionState::Running;
        let ctx = self.threads[next].context;
        let mut discard = CpuContext::default();
        if delayed {
            self.cpu.switch_delayed(&mut discard, &ctx);
        } else {
            self.cpu.switch_immediate(&mut discard, &ctx);
        }
        self.current = Some(tid);
        self.preempt_timer = Some(time::arm(
            time::now_ns() + QUANTUM_NS,
            Box::new(|| preempt()),
        ));
        Some(tid)
    }

    /// Transition a stopped thread's bookkeeping after it leaves the CPU or
    /// the run queue: wake block observers if it stopped while blocked.
    fn note_stopped(&mut self, idx: usize, wakes: &mut DeferredWakes) {
        let t = &mut self.threads[idx];
        if t.block_count > 0 {
            t.flags.remove(ThreadFlags::PENDING_BLOCK);
            wakes.wake_all.push(t.block_wq.clone());
        }
    }

    /// Claim a parked thread's wait link, if any, and disarm its timeout
    /// timer. Exactly one of the racing wakers (event callback, timer,
    /// resume, signal) gets `Some`; the rest see `None` and become no-ops.
    fn claim_wait_link(&mut self, idx: usize) -> Option<WaitLink> {
        let t = &mut self.threads[idx];
        if let Some(timer) = t.timeout_timer.take() {
            time::cancel(timer);
        }
        t.wait_link.take()
    }

    /// Make a suspended thread runnable again (or leave it blocked if its
    /// block count is nonzero). `reason` is recorded for a wake that ends a
    /// blocking operation; `None` clears any stale reason so a later
    /// blocking call cannot complete spuriously.
    fn make_runnable(&mut self, idx: usize, reason: Option<WakeReason>) {
        let t = &mut self.threads[idx];
        if t.state != ExecutionState::Suspended {
            return;
        }
        t.state = ExecutionState::NotRunning;
        t.wake_reason = reason;
        let tid = t.tid;
        if self.threads[idx].block_count == 0 {
            self.enqueue(tid);
        }
    }

    /// Destroy a dead thread whose refcount reached zero. Returns wakes that
    /// must run after the lock drops.
    fn maybe_destroy(&mut self, tid: u64, wakes: &mut DeferredWakes) {
        let Some(idx) = self.find_idx(tid) else { return };
        let t = &self.threads[idx];
        if !t.is_dead() || t.refcount != 0 {
            return;
        }
        let t = self.threads.remove(idx);
        #[cfg(feature = "debug_verbose")]
        if t.stack.owned {
            log::trace!("[sched] tid {} stack {:#x} freed", t.tid, t.stack.base);
        }
        wakes.wake_all.push(t.destroy_wq.clone());
    }
}

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("thread with no manager");
    f(sched)
}

/// Install the scheduler singleton. Idempotent.
pub fn init() {
    let mut guard = SCHEDULER.lock();
    if guard.is_none() {
        *guard = Some(Scheduler::new());
        log::debug!("[sched] manager initialized");
    }
}

/// Teardown: drop every thread record and disarm timers. The companion of
/// [`init`]; embedders and tests call this between independent runs.
pub fn reset() {
    let mut guard = SCHEDULER.lock();
    *guard = None;
    drop(guard);
    time::reset();
}

// =========================================================================
// Thread lifecycle
// =========================================================================

/// Create a new thread, suspended, refcount 1.
///
/// `entry` must be nonzero and `flags` must contain only known bits.
/// The stack is caller-provided (`stack`) or kernel-allocated (`stack_size`
/// bytes, default if zero).
pub fn spawn(
    entry: u64,
    argument: u64,
    stack: Option<StackDesc>,
    stack_size: u64,
    flags: u32,
) -> Result<u64> {
    let flags = CreateFlags::from_bits(flags).ok_or(Kind::InvalidArgument)?;
    if entry == 0 {
        return Err(Kind::InvalidArgument);
    }
    let asid = if flags.contains(CreateFlags::USERSPACE) {
        NEXT_ASID.fetch_add(1, Ordering::Relaxed)
    } else {
        0
    };
    let thread = Thread::new(entry, argument, stack, stack_size, flags, asid);
    let tid = thread.tid;
    with_scheduler(|sched| sched.threads.push(thread));
    log::debug!("[sched] spawned tid {} entry {:#x}", tid, entry);
    Ok(tid)
}

/// Make a previously suspended thread schedulable.
pub fn resume(tid: u64) -> Result<()> {
    let wakes = with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        match sched.threads[idx].state {
            ExecutionState::Dead => return Err(Kind::PermanentOutage),
            ExecutionState::Suspended => {}
            _ => return Err(Kind::AlreadyInProgress),
        }
        let mut wakes = DeferredWakes::default();
        // Resuming a thread that was inside a blocking operation counts as
        // that operation's wakeup; resuming a plainly suspended thread does
        // not fabricate one.
        let was_blocking_op = sched.threads[idx].wait_link.is_some()
            || sched.threads[idx].timeout_timer.is_some();
        if let Some(link) = sched.claim_wait_link(idx) {
            wakes.unwaits.push((link.wq, link.waiter));
        }
        sched.make_runnable(idx, was_blocking_op.then_some(WakeReason::Event));
        Ok(wakes)
    })?;
    wakes.run();
    Ok(())
}

/// Stop a thread from running. Self-suspension commits immediately; a ready
/// thread is removed from the eligible set on the spot.
///
/// `wait` asks to block the caller until the stop is observed; with a single
/// manager the commit is always synchronous, so the wait is already satisfied
/// when this returns.
pub fn suspend(tid: u64, wait: bool) -> Result<()> {
    suspend_inner(tid, wait, None)
}

/// As [`suspend`], arming `timeout` once the suspension has committed; on
/// expiry the thread is resumed and the timer cleared.
pub fn suspend_timeout(tid: u64, wait: bool, timeout: Timeout) -> Result<()> {
    suspend_inner(tid, wait, Some(timeout))
}

fn suspend_inner(tid: u64, _wait: bool, timeout: Option<Timeout>) -> Result<()> {
    let wakes = with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let t = &mut sched.threads[idx];
        match t.state {
            ExecutionState::Dead => return Err(Kind::PermanentOutage),
            ExecutionState::Suspended => return Err(Kind::AlreadyInProgress),
            _ if t.flags.contains(ThreadFlags::PENDING_SUSPEND) => {
                return Err(Kind::AlreadyInProgress)
            }
            _ => {}
        }
        t.flags.insert(ThreadFlags::PENDING_SUSPEND);

        let mut wakes = DeferredWakes::default();
        if sched.current == Some(tid) {
            // Self-suspension: evict now and pick the next thread.
            let delayed = sched.cpu.in_interrupt();
            sched.evict_current(delayed);
            let idx = sched.find_idx(tid).expect("current thread vanished");
            sched.threads[idx].state = ExecutionState::Suspended;
            sched.threads[idx].flags.remove(ThreadFlags::PENDING_SUSPEND);
            sched.note_stopped(idx, &mut wakes);
            sched.dispatch_next(delayed);
        } else {
            sched.dequeue(tid);
            let t = &mut sched.threads[idx];
            t.state = ExecutionState::Suspended;
            t.flags.remove(ThreadFlags::PENDING_SUSPEND);
            sched.note_stopped(idx, &mut wakes);
        }
        let idx = sched.find_idx(tid).expect("suspended thread vanished");
        wakes.wake_all.push(sched.threads[idx].suspend_wq.clone());

        // Timer armed only once the thread is observed stopped.
        if let Some(timeout) = timeout {
            let deadline = timeout.deadline(time::now_ns());
            sched.threads[idx].timeout_timer =
                Some(time::arm(deadline, Box::new(move || timeout_fire(tid))));
        }
        Ok(wakes)
    })?;
    wakes.run();
    Ok(())
}

/// Timer callback for timed suspension and timed waits: atomically resume
/// the thread and clear any pending wait link.
fn timeout_fire(tid: u64) {
    let wakes = with_scheduler(|sched| {
        let mut wakes = DeferredWakes::default();
        let Some(idx) = sched.find_idx(tid) else { return wakes };
        sched.threads[idx].timeout_timer = None;
        let parked = sched.threads[idx].wait_link.is_some();
        if let Some(link) = sched.claim_wait_link(idx) {
            wakes.unwaits.push((link.wq, link.waiter));
        }
        let reason = if parked { WakeReason::TimedOut } else { WakeReason::Event };
        sched.make_runnable(idx, Some(reason));
        wakes
    });
    wakes.run();
}

/// Kill a thread. The transition to dead is terminal; on a live thread this
/// always succeeds, otherwise it reports `already_in_progress`. Killing the
/// current thread evicts it; in a real build the call would not return on
/// self-kill.
pub fn kill(tid: u64) -> Result<()> {
    kill_with_code(tid, None)
}

/// Exit the current thread with an exit code.
pub fn exit_current(code: u32) -> Result<()> {
    let tid = current().ok_or(Kind::NoSuchResource)?;
    kill_with_code(tid, Some(code))
}

fn kill_with_code(tid: u64, code: Option<u32>) -> Result<()> {
    let wakes = with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        if sched.threads[idx].is_dead() {
            return Err(Kind::AlreadyInProgress);
        }
        let mut wakes = DeferredWakes::default();
        sched.threads[idx].flags.insert(ThreadFlags::PENDING_DEATH);
        if let Some(link) = sched.claim_wait_link(idx) {
            wakes.unwaits.push((link.wq, link.waiter));
        }
        if sched.current == Some(tid) {
            let delayed = sched.cpu.in_interrupt();
            sched.evict_current(delayed);
            sched.dispatch_next(delayed);
        } else {
            sched.dequeue(tid);
        }
        let idx = sched.find_idx(tid).expect("dying thread vanished");
        let t = &mut sched.threads[idx];
        t.state = ExecutionState::Dead;
        t.exit_code = code;
        wakes.wake_all.push(t.death_wq.clone());
        log::debug!("[sched] tid {} dead (code {:?})", tid, code);
        sched.maybe_destroy(tid, &mut wakes);
        Ok(wakes)
    })?;
    wakes.run();
    Ok(())
}

/// Increment a thread's block count. A blocked thread is never picked.
pub fn block(tid: u64) -> Result<()> {
    let wakes = with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        if sched.threads[idx].is_dead() {
            return Err(Kind::PermanentOutage);
        }
        let mut wakes = DeferredWakes::default();
        sched.threads[idx].block_count += 1;
        match sched.threads[idx].state {
            ExecutionState::Running => {
                // Evicted at this scheduling point; blocked, not suspended.
                sched.threads[idx].flags.insert(ThreadFlags::PENDING_BLOCK);
                let delayed = sched.cpu.in_interrupt();
                sched.evict_current(delayed);
                let idx = sched.find_idx(tid).expect("blocked thread vanished");
                sched.threads[idx].state = ExecutionState::NotRunning;
                sched.note_stopped(idx, &mut wakes);
                sched.dispatch_next(delayed);
            }
            ExecutionState::NotRunning => {
                sched.dequeue(tid);
                sched.note_stopped(idx, &mut wakes);
            }
            // Suspended threads transition to blocked on wakeup instead.
            _ => {}
        }
        Ok(wakes)
    })?;
    wakes.run();
    Ok(())
}

/// Decrement a thread's block count; at zero the thread becomes eligible.
pub fn unblock(tid: u64) -> Result<()> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        if sched.threads[idx].is_dead() {
            return Err(Kind::PermanentOutage);
        }
        let t = &mut sched.threads[idx];
        if t.block_count == 0 {
            panic!("unblock underflow on tid {}", tid);
        }
        t.block_count -= 1;
        if t.block_count == 0 && t.state == ExecutionState::NotRunning {
            sched.enqueue(tid);
        }
        Ok(())
    })
}

// =========================================================================
// Wait queues and parking
// =========================================================================

/// Park a thread on a wait queue.
///
/// The queue lock is taken first; the thread is marked pending-suspend with
/// the queue recorded, the waiter is appended, and the suspension commits
/// before the queue lock is released, so a concurrent wake serializes after
/// the commit and cannot be lost. Spurious wakeups are allowed: a woken
/// thread re-checks its condition.
pub fn wait(tid: u64, wq: &Waitq) -> Result<()> {
    park_on(tid, wq, None, false)
}

/// As [`wait`] with a timeout armed after the suspension commits.
pub fn wait_timeout(tid: u64, wq: &Waitq, timeout: Timeout) -> Result<()> {
    park_on(tid, wq, Some(timeout), false)
}

/// Park the current thread, optionally interruptible by signals. Used by
/// blocking channel operations.
pub fn park_current(wq: &Waitq, timeout: Option<Timeout>, interruptible: bool) -> Result<()> {
    let tid = current().ok_or(Kind::NoSuchResource)?;
    park_on(tid, wq, timeout, interruptible)
}

fn park_on(tid: u64, wq: &Waitq, timeout: Option<Timeout>, interruptible: bool) -> Result<()> {
    // The waiter's callback claims the wait link and resumes the thread.
    let callback = Box::new(move |data: u64| waitq_waiter_fired(data));

    let wq_clone = wq.clone();
    let (waiter_id, parked) = wq.wait_locked(callback, tid, move |waiter_id| {
        let wakes = with_scheduler(|sched| {
            let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
            let t = &mut sched.threads[idx];
            match t.state {
                ExecutionState::Dead => return Err(Kind::PermanentOutage),
                ExecutionState::Suspended => return Err(Kind::AlreadyInProgress),
                _ => {}
            }
            if t.wait_link.is_some() {
                // One wait queue at a time.
                return Err(Kind::AlreadyInProgress);
            }
            t.flags
                .insert(ThreadFlags::PENDING_SUSPEND | ThreadFlags::HOLDING_WAITQ_LOCK);
            t.wait_interruptible = interruptible;
            t.wake_reason = None;

            let mut wakes = DeferredWakes::default();
            if sched.current == Some(tid) {
                let delayed = sched.cpu.in_interrupt();
                sched.evict_current(delayed);
                sched.dispatch_next(delayed);
            } else {
                sched.dequeue(tid);
            }
            let idx = sched.find_idx(tid).expect("parking thread vanished");
            let t = &mut sched.threads[idx];
            t.state = ExecutionState::Suspended;
            t.flags
                .remove(ThreadFlags::PENDING_SUSPEND | ThreadFlags::HOLDING_WAITQ_LOCK);
            t.wait_link = Some(WaitLink { wq: wq_clone.clone(), waiter: waiter_id });
            sched.note_stopped(idx, &mut wakes);
            wakes.wake_all.push(sched.threads[idx].suspend_wq.clone());

            if let Some(timeout) = timeout {
                let deadline = timeout.deadline(time::now_ns());
                sched.threads[idx].timeout_timer =
                    Some(time::arm(deadline, Box::new(move || timeout_fire(tid))));
            }
            Ok(wakes)
        });
        wakes
    });

    match parked {
        Ok(wakes) => {
            wakes.run();
            Ok(())
        }
        Err(kind) => {
            // The waiter was appended under the lock; detach it again so a
            // failed park leaves no dangling queue entry.
            wq.unwait(waiter_id);
            Err(kind)
        }
    }
}

/// A wait-queue waiter for a parked thread fired: claim the link and make
/// the thread runnable. No-op if resume, timeout, or a signal won the race.
fn waitq_waiter_fired(tid: u64) {
    with_scheduler(|sched| {
        let Some(idx) = sched.find_idx(tid) else { return };
        // The waiter was already popped from its queue; claiming here only
        // clears bookkeeping and cancels the timeout.
        if sched.threads[idx].wait_link.is_some() {
            sched.claim_wait_link(idx);
            sched.make_runnable(idx, Some(WakeReason::Event));
        }
    });
}

/// Consume the reason the given thread's last park ended.
pub fn take_wake_reason(tid: u64) -> Option<WakeReason> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid)?;
        sched.threads[idx].wake_reason.take()
    })
}

// =========================================================================
// Scheduling points
// =========================================================================

/// Voluntary yield: rotate the current thread to the back of the run queue.
pub fn yield_now() {
    with_scheduler(|sched| {
        if let Some(tid) = sched.current {
            sched.evict_current(false);
            if let Some(idx) = sched.find_idx(tid) {
                sched.threads[idx].state = ExecutionState::NotRunning;
                if sched.threads[idx].block_count == 0 {
                    sched.enqueue(tid);
                }
            }
        }
        sched.dispatch_next(false);
    });
}

/// Preemption-timer path: enter interrupt context, switch with the delayed
/// form, and return from the interrupt.
pub fn preempt() {
    with_scheduler(|sched| {
        sched.cpu.interrupt_entry();
        if let Some(tid) = sched.current {
            sched.evict_current(true);
            if let Some(idx) = sched.find_idx(tid) {
                sched.threads[idx].state = ExecutionState::NotRunning;
                if sched.threads[idx].block_count == 0 {
                    sched.enqueue(tid);
                }
            }
        }
        sched.dispatch_next(true);
        sched.cpu.interrupt_return();
    });
}

/// Pick a thread if the CPU is idle. Returns the running thread's TID.
pub fn schedule() -> Option<u64> {
    with_scheduler(|sched| {
        if sched.current.is_none() {
            sched.dispatch_next(false);
        }
        sched.current
    })
}

// =========================================================================
// Introspection
// =========================================================================

/// TID of the thread currently on the CPU.
pub fn current() -> Option<u64> {
    with_scheduler(|sched| sched.current)
}

/// Snapshot of a thread's execution state.
pub fn execution_state(tid: u64) -> Result<ExecutionState> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let t = &sched.threads[idx];
        if t.flags.contains(ThreadFlags::KERNEL_INTERRUPTED) && !t.is_dead() {
            return Ok(ExecutionState::InterruptedInKernel);
        }
        Ok(t.state)
    })
}

/// Exit code recorded at death.
pub fn exit_code(tid: u64) -> Result<Option<u32>> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        Ok(sched.threads[idx].exit_code)
    })
}

/// Copy of a thread's saved context (the live bank if it is running).
pub fn thread_context(tid: u64) -> Result<CpuContext> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        if sched.current == Some(tid) {
            Ok(sched.cpu.live)
        } else {
            Ok(sched.threads[idx].context)
        }
    })
}

/// Clone of one of a thread's event wait queues.
pub fn thread_waitq(tid: u64, which: ThreadWaitq) -> Result<Waitq> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let t = &sched.threads[idx];
        Ok(match which {
            ThreadWaitq::Death => t.death_wq.clone(),
            ThreadWaitq::Destroy => t.destroy_wq.clone(),
            ThreadWaitq::Suspend => t.suspend_wq.clone(),
            ThreadWaitq::Block => t.block_wq.clone(),
        })
    })
}

/// Selects one of the four per-thread event queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadWaitq {
    Death,
    Destroy,
    Suspend,
    Block,
}

/// Number of threads in the eligible run queue.
pub fn runnable_count() -> usize {
    with_scheduler(|sched| sched.run_queue.len())
}

// =========================================================================
// Reference counting
// =========================================================================

/// Take a strong reference on a thread. Fails if the thread record has
/// already been destroyed.
pub fn retain(tid: u64) -> Result<()> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::PermanentOutage)?;
        sched.threads[idx].refcount += 1;
        Ok(())
    })
}

/// Drop a strong reference. At zero (and once dead) the record is destroyed,
/// destruction waiters are woken, and an owned stack is freed.
pub fn release(tid: u64) -> Result<()> {
    let wakes = with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let t = &mut sched.threads[idx];
        if t.refcount == 0 {
            panic!("release underflow on tid {}", tid);
        }
        t.refcount -= 1;
        let mut wakes = DeferredWakes::default();
        sched.maybe_destroy(tid, &mut wakes);
        Ok(wakes)
    })?;
    wakes.run();
    Ok(())
}

// =========================================================================
// Signals
// =========================================================================

/// Raise `signal` on a userspace thread.
///
/// A deliverable signal interrupts an interruptible wait: the thread is
/// unparked, marked interrupted, and its blocked call reports `interrupted`
/// when it unwinds. Unhandled or unblockable-while-masked signals kill the
/// thread.
pub fn signal_raise(tid: u64, signal: u32) -> Result<()> {
    enum Action {
        None,
        Kill,
    }
    let (wakes, action) = with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        if sched.threads[idx].is_dead() {
            return Err(Kind::PermanentOutage);
        }
        let signals = sched.threads[idx]
            .signals
            .as_mut()
            .ok_or(Kind::InvalidArgument)?;
        let disposition = signals.raise(signal)?;
        let deliverable = signals.next_deliverable() == Some(signal);
        let preempts = signals
            .configuration(signal)
            .map(|c| c.flags.contains(SignalFlags::PREEMPT))
            .unwrap_or(false);

        let mut wakes = DeferredWakes::default();
        let action = match disposition {
            RaiseDisposition::Unhandled | RaiseDisposition::Kill => Action::Kill,
            RaiseDisposition::Pending => {
                let t = &mut sched.threads[idx];
                if deliverable && t.wait_link.is_some() && t.wait_interruptible {
                    t.interrupt_marker.mark();
                    t.flags.insert(ThreadFlags::KERNEL_INTERRUPTED);
                    if let Some(link) = sched.claim_wait_link(idx) {
                        wakes.unwaits.push((link.wq, link.waiter));
                    }
                    sched.make_runnable(idx, Some(WakeReason::Interrupted));
                } else if deliverable && preempts {
                    // Eager delivery: make sure the thread gets a prompt
                    // kernel-to-user return by putting it at the queue head.
                    if sched.threads[idx].state == ExecutionState::NotRunning
                        && sched.threads[idx].block_count == 0
                    {
                        sched.dequeue(tid);
                        sched.run_queue.push_front(tid);
                    }
                }
                Action::None
            }
        };
        Ok((wakes, action))
    })?;
    wakes.run();
    if let Action::Kill = action {
        log::debug!("[sched] tid {} killed by signal {}", tid, signal);
        let _ = kill(tid);
    }
    Ok(())
}

/// Install or clear a signal configuration slot on a userspace thread.
pub fn signal_configure(
    tid: u64,
    signal: u32,
    config: Option<SignalConfiguration>,
) -> Result<()> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let signals = sched.threads[idx]
            .signals
            .as_mut()
            .ok_or(Kind::InvalidArgument)?;
        signals.configure(signal, config)
    })
}

/// Set a userspace thread's signal mask, returning the previous mask.
pub fn signal_set_mask(tid: u64, mask: u64) -> Result<u64> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let signals = sched.threads[idx]
            .signals
            .as_mut()
            .ok_or(Kind::InvalidArgument)?;
        let old = signals.mask;
        signals.mask = mask;
        Ok(old)
    })
}

/// Configure an alternate signal stack for handler frames.
pub fn signal_set_stack(tid: u64, stack: Option<StackDesc>) -> Result<()> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let signals = sched.threads[idx]
            .signals
            .as_mut()
            .ok_or(Kind::InvalidArgument)?;
        signals.signal_stack = stack;
        Ok(())
    })
}

/// Kernel-to-user return hook: deliver the highest-priority pending signal,
/// if any, by pushing a handler frame onto the signal stack (or the user
/// stack) and redirecting the thread at its handler. Returns the delivered
/// signal number.
pub fn deliver_pending_signal(tid: u64) -> Result<Option<u32>> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        if sched.threads[idx].is_dead() {
            return Err(Kind::PermanentOutage);
        }
        let is_current = sched.current == Some(tid);
        let t = &mut sched.threads[idx];
        let Some(signals) = t.signals.as_mut() else {
            return Ok(None);
        };
        let Some(signal) = signals.next_deliverable() else {
            t.flags.remove(ThreadFlags::KERNEL_INTERRUPTED);
            return Ok(None);
        };
        let config = signals
            .begin_delivery(signal)
            .expect("deliverable signal without configuration");
        let stack_top = signals
            .signal_stack
            .map(|s| s.base + s.size)
            .unwrap_or(0);

        // Split borrow: the frame mutates either the live bank or the saved
        // context, never both.
        let ctx: &mut CpuContext = if is_current {
            &mut sched.cpu.live
        } else {
            &mut sched.threads[idx].context
        };
        let saved = *ctx;
        ctx.pc = config.handler;
        ctx.gp[0] = signal as u64;
        ctx.gp[1] = config.context;
        ctx.sp = if stack_top != 0 { stack_top } else { saved.sp };

        let t = &mut sched.threads[idx];
        let signals = t.signals.as_mut().expect("signal state vanished");
        signals.frames.push(SignalFrame {
            signal,
            context: config.context,
            saved,
            masked_on_handle: config.flags.contains(SignalFlags::MASK_ON_HANDLE),
        });
        t.flags.remove(ThreadFlags::KERNEL_INTERRUPTED);
        t.interrupt_marker.clear();
        #[cfg(feature = "debug_verbose")]
        log::trace!("[sched] tid {} signal {} delivered", tid, signal);
        Ok(Some(signal))
    })
}

/// Return from a signal handler: pop the innermost frame, restore the
/// interrupted context, and clear any mask-on-handle bit.
pub fn signal_return(tid: u64) -> Result<()> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        let is_current = sched.current == Some(tid);
        let t = &mut sched.threads[idx];
        let signals = t.signals.as_mut().ok_or(Kind::InvalidArgument)?;
        let frame = signals.finish_delivery().ok_or(Kind::InvalidArgument)?;
        let ctx: &mut CpuContext = if is_current {
            &mut sched.cpu.live
        } else {
            &mut sched.threads[idx].context
        };
        *ctx = frame.saved;
        Ok(())
    })
}

/// True if a signal marked this thread interrupted and nothing consumed the
/// mark yet. In-kernel blocking paths poll this to decide to unwind.
pub fn consume_interrupt_marker(tid: u64) -> Result<bool> {
    with_scheduler(|sched| {
        let idx = sched.find_idx(tid).ok_or(Kind::NoSuchResource)?;
        Ok(sched.threads[idx].interrupt_marker.take())
    })
}
