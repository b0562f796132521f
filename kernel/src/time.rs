//! Monotonic clock and one-shot kernel timers.
//!
//! The clock is advanced explicitly by the embedder (the platform timer
//! interrupt in a real build, the test body here). Advancing the clock fires
//! every timer whose deadline has been reached, in deadline order. Timers
//! live in a slab arena: a [`TimerId`] is the slot key plus the slot's
//! generation, so cancellation is O(1) and a fired or cancelled key is
//! simply not found. Timers back the preemption tick, timed suspension, and
//! blocking-call timeouts.

use crate::sync::spinlock::Spinlock;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a timeout value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Nanoseconds from the moment the timeout is armed.
    RelativeNs,
    /// Absolute deadline on the monotonic clock.
    AbsoluteNsMonotonic,
}

/// A pending timeout request carried by a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub value: u64,
    pub kind: TimeoutKind,
}

impl Timeout {
    pub fn relative(ns: u64) -> Self {
        Timeout { value: ns, kind: TimeoutKind::RelativeNs }
    }

    pub fn absolute(ns: u64) -> Self {
        Timeout { value: ns, kind: TimeoutKind::AbsoluteNsMonotonic }
    }

    /// Absolute deadline for this timeout if armed at `now_ns`.
    pub fn deadline(&self, now_ns: u64) -> u64 {
        match self.kind {
            TimeoutKind::RelativeNs => now_ns.saturating_add(self.value),
            TimeoutKind::AbsoluteNsMonotonic => self.value,
        }
    }
}

/// Arena key of one armed timer: slot index plus the slot's generation at
/// arming time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u64);

impl TimerId {
    fn new(slot: usize, generation: u32) -> Self {
        TimerId((u64::from(generation) << 32) | slot as u64)
    }

    fn slot(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

type TimerFn = Box<dyn FnOnce() + Send>;

struct Timer {
    deadline_ns: u64,
    /// Arming order; tiebreak for same-deadline firing.
    seq: u64,
    fire: TimerFn,
}

/// Slab arena of one-shot timers with free-list slot reuse.
struct TimerArena {
    slots: Vec<Option<Timer>>,
    /// Bumped when a slot is vacated; part of the key handed out for it.
    generations: Vec<u32>,
    free: Vec<usize>,
}

impl TimerArena {
    const fn new() -> Self {
        TimerArena {
            slots: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, timer: Timer) -> TimerId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };
        self.slots[slot] = Some(timer);
        TimerId::new(slot, self.generations[slot])
    }

    /// Vacate the slot `id` names, if its key is still current.
    fn take(&mut self, id: TimerId) -> Option<Timer> {
        let slot = id.slot();
        if slot >= self.slots.len()
            || self.slots[slot].is_none()
            || self.generations[slot] != id.generation()
        {
            return None;
        }
        self.vacate(slot)
    }

    fn vacate(&mut self, slot: usize) -> Option<Timer> {
        let timer = self.slots[slot].take()?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free.push(slot);
        Some(timer)
    }

    fn armed(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

static NOW_NS: AtomicU64 = AtomicU64::new(0);
static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);
static TIMERS: Spinlock<TimerArena> = Spinlock::new(TimerArena::new());

/// Current monotonic time in nanoseconds.
pub fn now_ns() -> u64 {
    NOW_NS.load(Ordering::Relaxed)
}

/// Arm a one-shot timer. The callback runs from [`advance`] once the clock
/// reaches `deadline_ns`. A deadline at or before the current time fires on
/// the next `advance(0)`.
pub fn arm(deadline_ns: u64, fire: TimerFn) -> TimerId {
    let seq = NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed);
    TIMERS.lock().insert(Timer { deadline_ns, seq, fire })
}

/// Disarm a timer. O(1). Returns false if it already fired or was
/// cancelled.
pub fn cancel(id: TimerId) -> bool {
    TIMERS.lock().take(id).is_some()
}

/// Advance the monotonic clock by `delta_ns` and fire every due timer.
///
/// Callbacks run with no kernel lock held and may arm new timers; a timer
/// armed for a deadline inside the interval just skipped fires on the next
/// call. Returns the number of timers fired.
pub fn advance(delta_ns: u64) -> usize {
    let now = NOW_NS.fetch_add(delta_ns, Ordering::Relaxed) + delta_ns;
    let mut due: Vec<Timer> = {
        let mut timers = TIMERS.lock();
        let mut due = Vec::new();
        for slot in 0..timers.slots.len() {
            let is_due = timers.slots[slot]
                .as_ref()
                .map(|t| t.deadline_ns <= now)
                .unwrap_or(false);
            if is_due {
                due.push(timers.vacate(slot).expect("due slot vanished"));
            }
        }
        due
    };
    due.sort_by_key(|t| (t.deadline_ns, t.seq));
    let fired = due.len();
    for t in due {
        (t.fire)();
    }
    fired
}

/// Number of armed timers. Diagnostic only.
pub fn armed_count() -> usize {
    TIMERS.lock().armed()
}

/// Teardown: drop every armed timer and rewind the clock to zero.
/// Part of the kernel-wide reset sequence; see `crate::reset`.
pub fn reset() {
    let mut timers = TIMERS.lock();
    timers.slots.clear();
    timers.generations.clear();
    timers.free.clear();
    drop(timers);
    NOW_NS.store(0, Ordering::Relaxed);
}
