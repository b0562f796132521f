//! Inter-thread communication primitives.
//!
//! Provides bidirectional message channels with typed attachments and
//! per-thread signals delivered at the kernel-to-user return boundary.

pub mod channel;
pub mod message;
pub mod signal;
