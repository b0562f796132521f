//! Per-thread signals with a configuration slot per signal number.
//!
//! Signals are deferred messages: raising one records it as pending, and
//! delivery happens when the target crosses from kernel back to user mode.
//! Lower signal numbers deliver first. Userspace threads only; kernel
//! threads have no signal state.

use bitflags::bitflags;

/// Signal numbers run 0..64; the mask is one 64-bit word.
pub const MAX_SIGNALS: u32 = 64;

bitflags! {
    /// Per-configuration behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignalFlags: u32 {
        /// The slot is live; a disabled slot leaves the signal unhandled.
        const ENABLED           = 1 << 0;
        /// Collapse repeated raises while one is already pending.
        const COALESCE          = 1 << 1;
        /// A process-targeted signal may be redirected to this thread.
        const ALLOW_REDIRECTION = 1 << 2;
        /// Deliver eagerly: interrupt an interruptible wait instead of
        /// waiting for the next natural kernel-to-user return.
        const PREEMPT           = 1 << 3;
        /// When redirected here, block the sending thread until handled.
        const BLOCK_ON_REDIRECT = 1 << 4;
        /// Add the signal to the mask for the duration of its handler.
        const MASK_ON_HANDLE    = 1 << 5;
        /// If the signal cannot be handled (masked at raise time), kill the
        /// target instead of leaving it pending.
        const KILL_IF_UNHANDLED = 1 << 6;
    }
}

/// One signal number's configuration: handler entry point, an opaque context
/// word passed through to the handler, and behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalConfiguration {
    pub handler: u64,
    pub context: u64,
    pub flags: SignalFlags,
}

/// What a raise did to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseDisposition {
    /// Recorded as pending; will deliver at the next opportunity.
    Pending,
    /// No enabled configuration; the default action (kill) applies.
    Unhandled,
    /// Masked at raise time with `KILL_IF_UNHANDLED` set.
    Kill,
}

/// A handler frame pushed for one delivery; popped by signal return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame {
    pub signal: u32,
    pub context: u64,
    /// The interrupted user context, restored on return from the handler.
    pub saved: crate::task::context::CpuContext,
    /// True if delivery set the mask bit, so return must clear it.
    pub masked_on_handle: bool,
}

/// Per-thread signal state: configuration table, mask, pending set.
pub struct SignalState {
    configs: [Option<SignalConfiguration>; MAX_SIGNALS as usize],
    /// Bitmask of signals blocked from delivery.
    pub mask: u64,
    /// Bitmask of raised, undelivered signals.
    pending: u64,
    /// Extra queued occurrences for non-coalescing signals.
    extra: [u32; MAX_SIGNALS as usize],
    /// Alternate stack for handler frames, if configured.
    pub signal_stack: Option<crate::task::thread::StackDesc>,
    /// Live handler frames, innermost last.
    pub frames: Vec<SignalFrame>,
}

impl SignalState {
    pub fn new() -> Self {
        SignalState {
            configs: [None; MAX_SIGNALS as usize],
            mask: 0,
            pending: 0,
            extra: [0; MAX_SIGNALS as usize],
            signal_stack: None,
            frames: Vec::new(),
        }
    }

    /// Install or clear the configuration slot for `signal`.
    pub fn configure(&mut self, signal: u32, config: Option<SignalConfiguration>) -> crate::error::Result<()> {
        if signal >= MAX_SIGNALS {
            return Err(crate::error::Kind::InvalidArgument);
        }
        self.configs[signal as usize] = config;
        Ok(())
    }

    pub fn configuration(&self, signal: u32) -> Option<&SignalConfiguration> {
        self.configs.get(signal as usize).and_then(|c| c.as_ref())
    }

    /// Record a raised signal. The caller applies the disposition (killing
    /// the thread for `Unhandled`/`Kill`).
    pub fn raise(&mut self, signal: u32) -> crate::error::Result<RaiseDisposition> {
        if signal >= MAX_SIGNALS {
            return Err(crate::error::Kind::InvalidArgument);
        }
        let bit = 1u64 << signal;
        let config = match self.configs[signal as usize] {
            Some(c) if c.flags.contains(SignalFlags::ENABLED) => c,
            _ => return Ok(RaiseDisposition::Unhandled),
        };
        if self.mask & bit != 0 && config.flags.contains(SignalFlags::KILL_IF_UNHANDLED) {
            return Ok(RaiseDisposition::Kill);
        }
        if self.pending & bit != 0 {
            if !config.flags.contains(SignalFlags::COALESCE) {
                self.extra[signal as usize] += 1;
            }
        } else {
            self.pending |= bit;
        }
        Ok(RaiseDisposition::Pending)
    }

    /// Highest-priority deliverable signal (lowest pending, unmasked number).
    pub fn next_deliverable(&self) -> Option<u32> {
        let deliverable = self.pending & !self.mask;
        if deliverable == 0 {
            return None;
        }
        Some(deliverable.trailing_zeros())
    }

    /// Consume one pending occurrence of `signal` and return its
    /// configuration with the mask updated per `MASK_ON_HANDLE`.
    pub fn begin_delivery(&mut self, signal: u32) -> Option<SignalConfiguration> {
        let bit = 1u64 << signal;
        if self.pending & bit == 0 {
            return None;
        }
        if self.extra[signal as usize] > 0 {
            self.extra[signal as usize] -= 1;
        } else {
            self.pending &= !bit;
        }
        let config = self.configs[signal as usize]?;
        if config.flags.contains(SignalFlags::MASK_ON_HANDLE) {
            self.mask |= bit;
        }
        Some(config)
    }

    /// Pop the innermost handler frame, clearing its mask bit if delivery
    /// set it. Returns the frame so the caller can restore the saved context.
    pub fn finish_delivery(&mut self) -> Option<SignalFrame> {
        let frame = self.frames.pop()?;
        if frame.masked_on_handle {
            self.mask &= !(1u64 << frame.signal);
        }
        Some(frame)
    }

    /// True if any occurrence of `signal` is pending.
    pub fn is_pending(&self, signal: u32) -> bool {
        signal < MAX_SIGNALS && self.pending & (1u64 << signal) != 0
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    fn enabled(flags: SignalFlags) -> SignalConfiguration {
        SignalConfiguration {
            handler: 0x5000,
            context: 0xC0,
            flags: flags | SignalFlags::ENABLED,
        }
    }

    #[test]
    fn test_raise_unconfigured_is_unhandled() {
        let mut s = SignalState::new();
        assert_eq!(s.raise(3).unwrap(), RaiseDisposition::Unhandled);
        assert_eq!(s.raise(64), Err(Kind::InvalidArgument));
    }

    #[test]
    fn test_lowest_number_delivers_first() {
        let mut s = SignalState::new();
        s.configure(9, Some(enabled(SignalFlags::empty()))).unwrap();
        s.configure(2, Some(enabled(SignalFlags::empty()))).unwrap();
        s.raise(9).unwrap();
        s.raise(2).unwrap();
        assert_eq!(s.next_deliverable(), Some(2));
        s.begin_delivery(2).unwrap();
        assert_eq!(s.next_deliverable(), Some(9));
    }

    #[test]
    fn test_mask_blocks_delivery() {
        let mut s = SignalState::new();
        s.configure(5, Some(enabled(SignalFlags::empty()))).unwrap();
        s.mask = 1 << 5;
        assert_eq!(s.raise(5).unwrap(), RaiseDisposition::Pending);
        assert_eq!(s.next_deliverable(), None);
        s.mask = 0;
        assert_eq!(s.next_deliverable(), Some(5));
    }

    #[test]
    fn test_masked_unblockable_kills() {
        let mut s = SignalState::new();
        s.configure(1, Some(enabled(SignalFlags::KILL_IF_UNHANDLED))).unwrap();
        s.mask = 1 << 1;
        assert_eq!(s.raise(1).unwrap(), RaiseDisposition::Kill);
    }

    #[test]
    fn test_coalesce_vs_queued_occurrences() {
        let mut s = SignalState::new();
        s.configure(4, Some(enabled(SignalFlags::COALESCE))).unwrap();
        s.configure(6, Some(enabled(SignalFlags::empty()))).unwrap();
        s.raise(4).unwrap();
        s.raise(4).unwrap();
        s.raise(6).unwrap();
        s.raise(6).unwrap();

        // Coalesced: one delivery total.
        s.begin_delivery(4).unwrap();
        assert!(!s.is_pending(4));
        // Non-coalesced: both occurrences deliver.
        s.begin_delivery(6).unwrap();
        assert!(s.is_pending(6));
        s.begin_delivery(6).unwrap();
        assert!(!s.is_pending(6));
    }

    #[test]
    fn test_mask_on_handle_round_trip() {
        let mut s = SignalState::new();
        s.configure(7, Some(enabled(SignalFlags::MASK_ON_HANDLE))).unwrap();
        s.raise(7).unwrap();
        let config = s.begin_delivery(7).unwrap();
        assert!(config.flags.contains(SignalFlags::MASK_ON_HANDLE));
        assert_eq!(s.mask & (1 << 7), 1 << 7);

        s.frames.push(SignalFrame {
            signal: 7,
            context: config.context,
            saved: Default::default(),
            masked_on_handle: true,
        });
        let frame = s.finish_delivery().unwrap();
        assert_eq!(frame.signal, 7);
        assert_eq!(s.mask & (1 << 7), 0);
    }
}
