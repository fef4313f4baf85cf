//! Per-core state and the execution loop.
use crate::{
    CpuSubsystem,
    handlers::Handlers,
    interpreter,
    interrupts::{DBG_BREAK, NONMASKABLE, SRESET},
    memory::{Memory, Primitive},
};
use easyerr::Error;
use espresso::{CALLBACK_ADDR, Ins, InsId, Registers};
use std::{fmt::Display, sync::Arc};

/// Number of cores in the Espresso.
pub const CORE_COUNT: usize = 3;

/// Identifier of one of the three cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(u8);

impl CoreId {
    pub const ALL: [CoreId; CORE_COUNT] = [CoreId(0), CoreId(1), CoreId(2)];

    pub fn new(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Bit of this core in core masks.
    #[inline(always)]
    pub(crate) fn bit(self) -> u32 {
        1 << self.0
    }

    /// The other two cores.
    pub fn others(self) -> impl Iterator<Item = CoreId> {
        Self::ALL.into_iter().filter(move |&other| other != self)
    }
}

impl Display for CoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Why an instruction could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("access violation at 0x{f0:08X}")]
    AccessViolation(u32),
    #[error("illegal instruction {f0:?}")]
    IllegalInstruction(Ins),
}

/// Why [`CoreContext::resume`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The guest branched to [`CALLBACK_ADDR`].
    Callback,
    /// The core received SRESET.
    Reset,
}

/// Address and value recorded by `lwarx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub addr: u32,
    pub value: u32,
}

/// State of a single core.
#[derive(Debug)]
pub struct Core {
    id: CoreId,
    pub regs: Registers,
    pub(crate) reservation: Option<Reservation>,
}

impl Core {
    pub(crate) fn new(id: CoreId) -> Self {
        Self {
            id,
            regs: Registers::default(),
            reservation: None,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> CoreId {
        self.id
    }

    pub(crate) fn reset(&mut self) {
        self.regs = Registers::default();
        self.reservation = None;
    }
}

/// A core together with the subsystem it belongs to. Every handler operates on one of these.
pub struct CoreContext<'a> {
    pub(crate) sys: &'a CpuSubsystem,
    pub(crate) handlers: Arc<Handlers>,
    pub(crate) core: &'a mut Core,
    reset: bool,
    check_pending: bool,
    /// Address this core was paused at. Its breakpoint does not fire again until the instruction
    /// there has executed.
    resumed_at: Option<u32>,
}

impl<'a> CoreContext<'a> {
    pub(crate) fn new(sys: &'a CpuSubsystem, core: &'a mut Core) -> Self {
        Self {
            handlers: sys.handlers(),
            sys,
            core,
            reset: false,
            check_pending: false,
            resumed_at: None,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> CoreId {
        self.core.id
    }

    #[inline(always)]
    pub fn regs(&self) -> &Registers {
        &self.core.regs
    }

    #[inline(always)]
    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.core.regs
    }

    #[inline(always)]
    pub fn memory(&self) -> &Memory {
        self.sys.memory()
    }

    #[inline(always)]
    pub fn sys(&self) -> &CpuSubsystem {
        self.sys
    }

    /// Whether this core has received SRESET.
    pub fn is_reset(&self) -> bool {
        self.reset
    }

    #[inline(always)]
    pub(crate) fn read<P: Primitive>(&self, addr: u32) -> Result<P, Fault> {
        self.sys
            .memory()
            .read(addr)
            .ok_or(Fault::AccessViolation(addr))
    }

    #[inline(always)]
    pub(crate) fn write<P: Primitive>(&self, addr: u32, value: P) -> Result<(), Fault> {
        if self.sys.memory().write(addr, value) {
            Ok(())
        } else {
            Err(Fault::AccessViolation(addr))
        }
    }

    /// Executes `ins` with its interpreter handler. CIA and NIA must already be set up.
    pub fn dispatch(&mut self, ins: Ins) -> Result<(), Fault> {
        let handler = self.handlers.table.get(ins.id).copied();
        debug_assert!(handler.is_some(), "no interpreter handler for {ins:?}");

        match handler {
            Some(handler) => handler(self, ins),
            None => Err(Fault::IllegalInstruction(ins)),
        }
    }

    /// Fetches, decodes and executes the instruction at NIA. Interrupts are not checked.
    pub fn execute_one(&mut self) -> Result<Ins, Fault> {
        let nia = self.core.regs.nia;
        let ins = Ins::new(self.read::<u32>(nia)?);

        self.core.regs.cia = nia;
        self.core.regs.nia = nia.wrapping_add(4);
        self.dispatch(ins)?;

        Ok(ins)
    }

    /// Routes a fault to the registered handlers.
    pub(crate) fn handle_fault(&mut self, fault: Fault) {
        match fault {
            Fault::AccessViolation(addr) => {
                tracing::error!(
                    core = %self.id(),
                    cia = format_args!("{:08X}", self.core.regs.cia),
                    "access violation at 0x{addr:08X}"
                );

                let handler = self.handlers.segfault.clone();
                handler(self, addr);

                panic!("segfault handler returned for address 0x{addr:08X}");
            }
            Fault::IllegalInstruction(ins) => {
                let handler = self.handlers.illegal_instruction.clone();
                handler(self, ins);
            }
        }
    }

    pub(crate) fn trace_branch(&self) {
        if let Some(handler) = &self.handlers.branch_trace {
            handler(self.id(), self.core.regs.nia);
        }
    }

    /// Requests an interrupt check before the next instruction.
    #[inline(always)]
    pub(crate) fn request_interrupt_check(&mut self) {
        self.check_pending = true;
    }

    /// Executes a single instruction in the interpreter, routing faults.
    pub(crate) fn step(&mut self) {
        match self.execute_one() {
            Ok(ins) => {
                if ins.id.is_branch() {
                    self.trace_branch();
                    self.request_interrupt_check();
                } else if ins.id == InsId::Kc {
                    self.request_interrupt_check();
                }
            }
            Err(fault) => self.handle_fault(fault),
        }
    }

    /// Runs guest code at NIA until it returns to [`CALLBACK_ADDR`] or the core is reset.
    ///
    /// Blocks are compiled and executed while the JIT is enabled and no breakpoint is armed,
    /// otherwise instructions are interpreted one at a time.
    pub fn resume(&mut self) -> Exit {
        interpreter::apply_rounding_mode(self.core.regs.rounding_mode());
        self.check_pending = true;

        loop {
            let breakpoints = self.sys.breakpoints().any();
            if self.check_pending || breakpoints {
                self.check_pending = false;
                self.check_interrupts();
            }

            if self.reset {
                return Exit::Reset;
            }

            if self.core.regs.nia == CALLBACK_ADDR {
                return Exit::Callback;
            }

            self.resumed_at = None;
            if self.sys.jit_enabled() && !breakpoints {
                self.run_block();
            } else {
                self.step();
            }
        }
    }

    /// Takes the pending interrupts allowed by the mask and services them. If NIA holds an armed
    /// breakpoint, it is consumed and DBG_BREAK is raised on every core, unless this core has just
    /// been resumed from that address.
    pub fn check_interrupts(&mut self) {
        let signals = self.sys.signals(self.id());
        let mask = signals.effective_mask();
        let mut flags = signals.take(mask);

        let nia = self.core.regs.nia;
        let resuming = self.resumed_at.take() == Some(nia);
        if !resuming && self.sys.breakpoints().pop(nia) {
            tracing::debug!(core = %self.id(), "hit breakpoint at 0x{nia:08X}");
            flags |= DBG_BREAK;
            for other in self.id().others() {
                self.sys.interrupt(other, DBG_BREAK);
            }
        }

        if flags & mask != 0 {
            self.service(flags);
        }
    }

    fn service(&mut self, flags: u32) {
        tracing::trace!(core = %self.id(), flags = format_args!("{flags:#X}"), "servicing interrupts");

        if flags & SRESET != 0 {
            tracing::debug!(core = %self.id(), "reset");
            self.reset = true;
        }

        if flags & DBG_BREAK != 0 && self.sys.config().debugger && !self.reset {
            self.sys.debug().enter(self);
            self.resumed_at = Some(self.core.regs.nia);
        }

        if let Some(handler) = self.handlers.interrupt.clone() {
            handler(self, flags);
        }

        // the handler might have changed FPSCR
        interpreter::apply_rounding_mode(self.core.regs.rounding_mode());
    }

    /// Blocks until an interrupt allowed by the mask is pending, then services it.
    ///
    /// # Panics
    /// Panics if every maskable interrupt is disabled, since nothing could wake the core.
    pub fn wait_for_interrupt(&mut self) {
        let signals = self.sys.signals(self.id());
        assert!(
            signals.mask() & !NONMASKABLE != 0,
            "{} is waiting for an interrupt with every interrupt disabled",
            self.id()
        );

        signals.wait(signals.effective_mask());
        self.check_interrupts();
    }

    /// Sets the interrupt mask of this core, returning the previous one.
    pub fn set_interrupt_mask(&self, mask: u32) -> u32 {
        self.sys.set_interrupt_mask(self.id(), mask)
    }
}
