//! Wait queue: FIFO of suspended waiters with generic wakeup callbacks.
//!
//! The primitive under every blocking operation. Waiter nodes live in a
//! slab arena and are threaded into a doubly-linked FIFO; the queue hands
//! out arena keys, so detaching a specific waiter is O(1). A freed slot is
//! recycled under a new generation, so a stale key is simply not found,
//! never misdirected. Waiters are appended at the tail and woken from the
//! head; a waiter is never on two queues at once. Wakeup callbacks run
//! with the queue unlocked and may invoke other wait queue operations, but
//! must never block.

use crate::sync::spinlock::Spinlock;
use std::sync::Arc;

/// Sentinel for an empty link.
const NIL: usize = usize::MAX;

/// Arena key of one queued waiter: slot index plus the slot's generation
/// at insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterId(pub u64);

impl WaiterId {
    fn new(slot: usize, generation: u32) -> Self {
        WaiterId((u64::from(generation) << 32) | slot as u64)
    }

    fn slot(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Wakeup callback: invoked once with the waiter's user data.
pub type WakeFn = Box<dyn FnOnce(u64) + Send>;

/// One arena node: FIFO links plus the wakeup callback and its data.
struct Waiter {
    prev: usize,
    next: usize,
    wake: WakeFn,
    data: u64,
}

/// Slab arena of waiter nodes threaded into a doubly-linked FIFO.
struct WaitqInner {
    slots: Vec<Option<Waiter>>,
    /// Bumped when a slot is freed; part of the key handed out for it.
    generations: Vec<u32>,
    /// Free-list of vacant slots, reused before the arena grows.
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl WaitqInner {
    const fn new() -> Self {
        WaitqInner {
            slots: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Append a waiter at the tail, reusing a free slot when one exists.
    fn insert_tail(&mut self, wake: WakeFn, data: u64) -> WaiterId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };
        self.slots[slot] = Some(Waiter { prev: self.tail, next: NIL, wake, data });
        if self.tail != NIL {
            self.link_of(self.tail).next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.len += 1;
        WaiterId::new(slot, self.generations[slot])
    }

    /// Detach `slot` from the FIFO and retire it to the free list.
    fn unlink(&mut self, slot: usize) -> Waiter {
        let waiter = self.slots[slot].take().expect("waitq link to free slot");
        if waiter.prev != NIL {
            self.link_of(waiter.prev).next = waiter.next;
        } else {
            self.head = waiter.next;
        }
        if waiter.next != NIL {
            self.link_of(waiter.next).prev = waiter.prev;
        } else {
            self.tail = waiter.prev;
        }
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free.push(slot);
        self.len -= 1;
        waiter
    }

    fn pop_head(&mut self) -> Option<Waiter> {
        if self.head == NIL {
            None
        } else {
            Some(self.unlink(self.head))
        }
    }

    /// Detach the waiter `id` names, if its key is still current.
    fn take(&mut self, id: WaiterId) -> Option<Waiter> {
        let slot = id.slot();
        if slot >= self.slots.len()
            || self.slots[slot].is_none()
            || self.generations[slot] != id.generation()
        {
            return None;
        }
        Some(self.unlink(slot))
    }

    fn link_of(&mut self, slot: usize) -> &mut Waiter {
        self.slots[slot].as_mut().expect("waitq link to free slot")
    }
}

/// A shareable wait queue handle.
///
/// Clones refer to the same queue; kernel objects embed one handle per event
/// they expose (message arrival, queue removal, death, ...).
#[derive(Clone)]
pub struct Waitq {
    inner: Arc<Spinlock<WaitqInner>>,
}

impl Waitq {
    /// Create a new empty wait queue.
    pub fn new() -> Self {
        Waitq {
            inner: Arc::new(Spinlock::new(WaitqInner::new())),
        }
    }

    /// Append a waiter at the tail. O(1). Never fails.
    pub fn wait(&self, wake: WakeFn, data: u64) -> WaiterId {
        self.wait_locked(wake, data, |_| ()).0
    }

    /// Append a waiter and run `f` with the queue still locked.
    ///
    /// `f` receives the new waiter's key. The thread suspension path uses
    /// this to commit the suspend transition before the lock is released, so
    /// a concurrent wake serializes after the commit and no wakeup is lost.
    pub fn wait_locked<F, R>(&self, wake: WakeFn, data: u64, f: F) -> (WaiterId, R)
    where
        F: FnOnce(WaiterId) -> R,
    {
        let mut guard = self.inner.lock();
        let id = guard.insert_tail(wake, data);
        let r = f(id);
        (id, r)
    }

    /// Pop up to `count` waiters from the head and invoke their callbacks
    /// with the queue unlocked. Returns the number woken.
    ///
    /// The popped set is exactly the first `min(count, len)` waiters in
    /// insertion order, even if a callback re-queues itself.
    pub fn wake_many(&self, count: usize) -> usize {
        let popped: Vec<(WakeFn, u64)> = {
            let mut guard = self.inner.lock();
            let n = count.min(guard.len);
            let mut popped = Vec::with_capacity(n);
            for _ in 0..n {
                let w = guard.pop_head().expect("waitq len out of sync");
                popped.push((w.wake, w.data));
            }
            popped
        };
        let woken = popped.len();
        for (wake, data) in popped {
            wake(data);
        }
        woken
    }

    /// Wake every queued waiter.
    pub fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// Detach the given waiter and invoke its callback if it is still
    /// queued. O(1). Tolerates already-removed waiters (returns false).
    pub fn wake_specific(&self, id: WaiterId) -> bool {
        let w = self.inner.lock().take(id);
        match w {
            Some(w) => {
                (w.wake)(w.data);
                true
            }
            None => false,
        }
    }

    /// Detach the given waiter without invoking its callback. O(1).
    pub fn unwait(&self, id: WaiterId) -> bool {
        self.inner.lock().take(id).is_some()
    }

    /// Number of queued waiters.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// True if no waiters are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `self` and `other` are handles to the same queue.
    pub fn same_queue(&self, other: &Waitq) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Waitq {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Waitq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Waitq").field("len", &self.len()).finish()
    }
}
