//! Thread CPU context for cooperative/preemptive context switching.
//!
//! The context is a portable register bank moved by value: sixteen
//! general-purpose registers, program counter, stack pointer, flags, the
//! thread's interrupt-disable depth, and its address-space identifier. A
//! context switch saves the live bank into the outgoing thread and installs
//! the incoming thread's bank, in one of two forms:
//!
//! - **immediate**: called from non-interrupt context; the banks are swapped
//!   directly through a scratch slot (the "switching stack") so neither side
//!   ever observes a half-written bank;
//! - **delayed**: called from an interrupt handler's return path; the staged
//!   interrupt frame is what actually restores register state, so the switch
//!   captures the frame as the outgoing context and rewrites the frame with
//!   the incoming one.

/// Number of general-purpose registers in the bank.
pub const NUM_GP_REGS: usize = 16;

/// CPU context saved and restored during a context switch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuContext {
    /// General-purpose register bank. `gp[0]` carries the entry argument for
    /// a freshly created thread, per the kernel calling convention.
    pub gp: [u64; NUM_GP_REGS],
    pub pc: u64,
    pub sp: u64,
    pub flags: u64,
    /// Interrupt-disable depth; 0 means interrupts enabled. Saved and
    /// restored across switches so a thread resumes with the nesting it had.
    pub interrupt_disable: u64,
    /// Address-space identifier; swapping it is part of the switch.
    pub asid: u64,
}

/// The register state an interrupt entry stub saves on arrival; restoring it
/// is what "returning from the interrupt" means.
pub type InterruptFrame = CpuContext;

/// One logical CPU: the live register bank plus interrupt bookkeeping.
#[derive(Debug, Default)]
pub struct Cpu {
    /// The context currently executing on this CPU.
    pub live: CpuContext,
    /// Frame captured at interrupt entry, consumed at interrupt return.
    staged_frame: Option<InterruptFrame>,
    /// Scratch bank used mid-switch so the red zone of the outgoing stack is
    /// never clobbered while both banks are in flight.
    switch_scratch: CpuContext,
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the currently executing context has interrupts enabled.
    pub fn interrupts_enabled(&self) -> bool {
        self.live.interrupt_disable == 0
    }

    /// Increase the interrupt-disable depth of the running context.
    pub fn interrupt_disable(&mut self) {
        self.live.interrupt_disable += 1;
    }

    /// Decrease the interrupt-disable depth of the running context.
    ///
    /// Panics on underflow; that is a kernel bug, not a recoverable error.
    pub fn interrupt_enable(&mut self) {
        if self.live.interrupt_disable == 0 {
            panic!("interrupt-disable count underflow");
        }
        self.live.interrupt_disable -= 1;
    }

    /// True between [`interrupt_entry`](Cpu::interrupt_entry) and
    /// [`interrupt_return`](Cpu::interrupt_return).
    pub fn in_interrupt(&self) -> bool {
        self.staged_frame.is_some()
    }

    /// Enter interrupt context: stage the live bank as the saved frame, the
    /// way the interrupt entry stub spills registers before the handler runs.
    pub fn interrupt_entry(&mut self) {
        assert!(
            self.staged_frame.is_none(),
            "nested interrupt entry without return"
        );
        self.staged_frame = Some(self.live);
    }

    /// Leave interrupt context: restore whatever frame is staged. If a
    /// delayed switch rewrote the frame, this is the moment the incoming
    /// thread actually starts running.
    pub fn interrupt_return(&mut self) {
        let frame = self
            .staged_frame
            .take()
            .expect("interrupt return without entry");
        self.live = frame;
    }

    /// Immediate context switch: save the live bank into `old`, install
    /// `new`. Must not be called from interrupt context.
    pub fn switch_immediate(&mut self, old: &mut CpuContext, new: &CpuContext) {
        assert!(!self.in_interrupt(), "immediate switch inside interrupt");
        self.switch_scratch = self.live;
        *old = self.switch_scratch;
        self.live = *new;
    }

    /// Delayed context switch: called from an interrupt handler. The staged
    /// frame (the outgoing thread's interrupted state) is captured into
    /// `old`, and `new` replaces it, so the switch takes effect at
    /// [`interrupt_return`](Cpu::interrupt_return).
    pub fn switch_delayed(&mut self, old: &mut CpuContext, new: &CpuContext) {
        let frame = self
            .staged_frame
            .as_mut()
            .expect("delayed switch outside interrupt");
        self.switch_scratch = *frame;
        *old = self.switch_scratch;
        *frame = *new;
    }
}

impl CpuContext {
    /// Initial context for a new thread: entry point in `pc`, argument in
    /// `gp[0]`, stack pointer at the top of the stack, interrupts enabled.
    pub fn for_entry(entry: u64, argument: u64, stack_top: u64, asid: u64) -> Self {
        let mut ctx = CpuContext::default();
        ctx.pc = entry;
        ctx.gp[0] = argument;
        ctx.sp = stack_top;
        ctx.asid = asid;
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_switch_swaps_banks() {
        let mut cpu = Cpu::new();
        cpu.live = CpuContext::for_entry(0x1000, 7, 0x8000, 1);
        let mut old = CpuContext::default();
        let new = CpuContext::for_entry(0x2000, 9, 0x9000, 2);

        cpu.switch_immediate(&mut old, &new);

        assert_eq!(old.pc, 0x1000);
        assert_eq!(old.gp[0], 7);
        assert_eq!(cpu.live.pc, 0x2000);
        assert_eq!(cpu.live.asid, 2);
    }

    #[test]
    fn test_delayed_switch_takes_effect_at_return() {
        let mut cpu = Cpu::new();
        cpu.live = CpuContext::for_entry(0x1000, 0, 0x8000, 1);
        cpu.interrupt_entry();

        // Handler runs; the live bank is scratch until return.
        let mut old = CpuContext::default();
        let new = CpuContext::for_entry(0x3000, 0, 0xA000, 3);
        cpu.switch_delayed(&mut old, &new);

        assert_eq!(old.pc, 0x1000, "frame captured as outgoing context");
        cpu.interrupt_return();
        assert_eq!(cpu.live.pc, 0x3000);
        assert_eq!(cpu.live.asid, 3);
    }

    #[test]
    fn test_interrupt_disable_depth() {
        let mut cpu = Cpu::new();
        assert!(cpu.interrupts_enabled());
        cpu.interrupt_disable();
        cpu.interrupt_disable();
        cpu.interrupt_enable();
        assert!(!cpu.interrupts_enabled());
        cpu.interrupt_enable();
        assert!(cpu.interrupts_enabled());
    }

    #[test]
    #[should_panic(expected = "interrupt-disable count underflow")]
    fn test_interrupt_enable_underflow_panics() {
        let mut cpu = Cpu::new();
        cpu.interrupt_enable();
    }
}
