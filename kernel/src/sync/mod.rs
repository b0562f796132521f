//! Kernel synchronization primitives.
//!
//! Provides the spinlock underlying every kernel object and the wait queue
//! that parks suspended threads until an event wakes them.

pub mod spinlock;
pub mod waitq;
