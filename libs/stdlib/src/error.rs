//! Error kinds shared across the userspace runtime.
//!
//! Numeric codes must match `kernel/src/error.rs`; syscalls return them in
//! the status register and userspace maps them back through
//! [`Kind::from_code`].

use thiserror::Error;

/// Error kinds returned across every call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum Kind {
    /// Malformed input, wrong object kind, or out-of-bounds access.
    #[error("invalid argument")]
    InvalidArgument = 1,
    /// Transient failure; safe to retry.
    #[error("temporary outage")]
    TemporaryOutage = 2,
    /// The target is dead, closed, or already released.
    #[error("permanent outage")]
    PermanentOutage = 3,
    /// Lookup failed.
    #[error("no such resource")]
    NoSuchResource = 4,
    /// The state was already the requested one.
    #[error("already in progress")]
    AlreadyInProgress = 5,
    /// The operation would block and the caller said no-wait.
    #[error("resource unavailable")]
    ResourceUnavailable = 6,
    /// The timer expired first.
    #[error("timed out")]
    TimedOut = 7,
    /// A signal aborted the blocking call.
    #[error("interrupted")]
    Interrupted = 8,
    /// The caller's buffer is too small.
    #[error("too big")]
    TooBig = 9,
    /// The backend does not implement this operation.
    #[error("unsupported")]
    Unsupported = 10,
    /// The server died mid-operation.
    #[error("aborted")]
    Aborted = 11,
    /// The server died; reconnect and re-issue.
    #[error("should restart")]
    ShouldRestart = 12,
}

impl Kind {
    pub fn code(self) -> u32 {
        self as u32
    }

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

pub type Result<T> = core::result::Result<T, Kind>;
