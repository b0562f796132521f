//! System call surface: numbers, flags, and the handler layer.
//!
//! Syscall numbers and numeric error codes must match
//! `libs/stdlib/src/syscall.rs`. Handlers execute on behalf of the current
//! thread; a blocking handler that cannot complete parks the thread and
//! reports [`Invocation::Parked`]. The caller re-enters the syscall with
//! the same arguments once the thread resumes, exactly as userspace
//! re-enters after `interrupted`.

pub mod handlers;
pub mod table;
pub mod wire;

use crate::error::Kind;
use bitflags::bitflags;

// =========================================================================
// Syscall numbers (must match libs/stdlib/src/syscall.rs)
// =========================================================================

// Thread management
pub const SYS_THREAD_CREATE: u32 = 1;
pub const SYS_THREAD_RESUME: u32 = 2;
pub const SYS_THREAD_SUSPEND: u32 = 3;
pub const SYS_THREAD_KILL: u32 = 4;
pub const SYS_THREAD_YIELD: u32 = 5;
pub const SYS_THREAD_SLEEP: u32 = 6;
pub const SYS_THREAD_EXIT: u32 = 7;
pub const SYS_THREAD_BLOCK: u32 = 8;
pub const SYS_THREAD_UNBLOCK: u32 = 9;

// Signals
pub const SYS_SIGNAL_CONFIGURE: u32 = 15;
pub const SYS_SIGNAL_RAISE: u32 = 16;
pub const SYS_SIGNAL_MASK: u32 = 17;
pub const SYS_SIGNAL_STACK: u32 = 18;
pub const SYS_SIGNAL_RETURN: u32 = 19;

// Channels
pub const SYS_CHANNEL_CREATE_PAIR: u32 = 30;
pub const SYS_CHANNEL_CONVERSATION_CREATE: u32 = 31;
pub const SYS_CHANNEL_SEND: u32 = 32;
pub const SYS_CHANNEL_RECEIVE: u32 = 33;
pub const SYS_CHANNEL_CLOSE: u32 = 34;

// Mappings
pub const SYS_MAPPING_CREATE: u32 = 40;
pub const SYS_MAPPING_CLOSE: u32 = 41;

bitflags! {
    /// Flags for `channel_send`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        /// Fail with `resource_unavailable` instead of blocking on a full
        /// queue.
        const NO_WAIT            = 1 << 0;
        /// Allocate a fresh conversation ID for this message.
        const START_CONVERSATION = 1 << 1;
    }
}

bitflags! {
    /// Flags for `channel_receive`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReceiveFlags: u32 {
        /// Fail with `resource_unavailable` instead of blocking on an empty
        /// queue.
        const NO_WAIT          = 1 << 0;
        /// A signal may abort the blocked receive with `interrupted`.
        const INTERRUPTIBLE    = 1 << 1;
        /// Inspect the head message's sizes without consuming it.
        const PRE_RECEIVE_PEEK = 1 << 2;
        /// Only consume the head if its message ID matches; requires
        /// `NO_WAIT`.
        const MATCH_MESSAGE_ID = 1 << 3;
    }
}

/// Required buffer sizes reported alongside `too_big`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageSizes {
    pub body: usize,
    pub attachments: usize,
}

/// Syscall-layer error: the numeric kind, plus the required sizes when the
/// kind is `too_big`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysError {
    pub kind: Kind,
    pub required: Option<MessageSizes>,
}

impl SysError {
    pub fn too_big(required: MessageSizes) -> Self {
        SysError { kind: Kind::TooBig, required: Some(required) }
    }

    /// The value returned in the syscall status register.
    pub fn code(&self) -> u32 {
        self.kind.code()
    }
}

impl From<Kind> for SysError {
    fn from(kind: Kind) -> Self {
        SysError { kind, required: None }
    }
}

impl core::fmt::Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.required {
            Some(sizes) => write!(
                f,
                "{} (requires body {} attachments {})",
                self.kind, sizes.body, sizes.attachments
            ),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Result alias for syscall handlers.
pub type SysResult<T> = core::result::Result<T, SysError>;

/// What one handler entry did.
#[derive(Debug)]
pub enum Invocation<T> {
    /// The syscall finished; the result is final.
    Complete(SysResult<T>),
    /// The calling thread was parked. Re-enter with the same arguments
    /// after it resumes.
    Parked,
}

impl<T> Invocation<T> {
    /// Unwrap a completed invocation; panics on `Parked`. Test helper shape.
    pub fn expect_complete(self) -> SysResult<T> {
        match self {
            Invocation::Complete(r) => r,
            Invocation::Parked => panic!("syscall parked; expected completion"),
        }
    }

    pub fn is_parked(&self) -> bool {
        matches!(self, Invocation::Parked)
    }
}
