//! Kernel error taxonomy.
//!
//! Every fallible kernel operation returns [`Result`]. The kinds double as
//! the numeric codes handed back to userspace in the syscall return register,
//! so the discriminant values here must match `libs/stdlib/src/error.rs`.

use thiserror::Error;

/// Error kinds returned across every kernel call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum Kind {
    /// Malformed input, wrong object class, or out-of-bounds access.
    #[error("invalid argument")]
    InvalidArgument = 1,
    /// Transient failure (allocation, scheduler unavailable); safe to retry.
    #[error("temporary outage")]
    TemporaryOutage = 2,
    /// The target is dead, closed, or already released.
    #[error("permanent outage")]
    PermanentOutage = 3,
    /// Lookup failed; no object with that name or identifier.
    #[error("no such resource")]
    NoSuchResource = 4,
    /// The state was already the requested one, or the operation is in flight.
    #[error("already in progress")]
    AlreadyInProgress = 5,
    /// The operation would block and the caller asked not to wait, or the
    /// requested message ID is not at the head of the queue.
    #[error("resource unavailable")]
    ResourceUnavailable = 6,
    /// The timer expired before the operation could complete.
    #[error("timed out")]
    TimedOut = 7,
    /// A signal aborted the blocking call; re-enter after handling it.
    #[error("interrupted")]
    Interrupted = 8,
    /// The caller's buffer is smaller than the operation needs.
    #[error("too big")]
    TooBig = 9,
    /// The backend does not implement this operation.
    #[error("unsupported")]
    Unsupported = 10,
    /// The server died mid-operation.
    #[error("aborted")]
    Aborted = 11,
    /// The server died but the operation is safe to re-issue after reconnect.
    #[error("should restart")]
    ShouldRestart = 12,
}

impl Kind {
    /// Numeric code for the syscall register convention. `0` is success.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a syscall register value back into a kind. `0` (success) and
    /// unknown codes yield `None`.
    pub fn from_code(code: u32) -> Option<Kind> {
        Some(match code {
            1 => Kind::InvalidArgument,
            2 => Kind::TemporaryOutage,
            3 => Kind::PermanentOutage,
            4 => Kind::NoSuchResource,
            5 => Kind::AlreadyInProgress,
            6 => Kind::ResourceUnavailable,
            7 => Kind::TimedOut,
            8 => Kind::Interrupted,
            9 => Kind::TooBig,
            10 => Kind::Unsupported,
            11 => Kind::Aborted,
            12 => Kind::ShouldRestart,
            _ => return None,
        })
    }
}

/// Result alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, Kind>;
