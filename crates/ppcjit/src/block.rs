use crate::code::ExecutableCode;
use cranelift::{codegen::ir, prelude::isa};
use espresso::Registers;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Opaque context passed through to hooks.
pub type Context = std::ffi::c_void;
pub type ReadHook<T> = extern "sysv64-unwind" fn(*mut Context, u32, *mut T) -> bool;
pub type WriteHook<T> = extern "sysv64-unwind" fn(*mut Context, u32, T) -> bool;
pub type FallbackHook = extern "sysv64-unwind" fn(*mut Context, u32) -> bool;

/// External functions that JITed code calls.
///
/// Every hook returns whether it succeeded. On failure, the block exits with
/// [`Status::Fault`] and the hook is expected to have recorded the reason in the context.
#[repr(C)]
pub struct Hooks {
    // memory, in host byte order
    pub read_u8: ReadHook<u8>,
    pub write_u8: WriteHook<u8>,
    pub read_u16: ReadHook<u16>,
    pub write_u16: WriteHook<u16>,
    pub read_u32: ReadHook<u32>,
    pub write_u32: WriteHook<u32>,
    pub read_u64: ReadHook<u64>,
    pub write_u64: WriteHook<u64>,

    /// Executes a single instruction (given by its raw encoding) in the interpreter. CIA and NIA
    /// are set up as if the interpreter had fetched it.
    pub fallback: FallbackHook,
}

impl Hooks {
    /// Returns the function signature for a memory read hook.
    pub(crate) fn read_sig(ptr_type: ir::Type) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ir::types::I32), // address
                ir::AbiParam::new(ptr_type),       // value ptr
            ],
            returns: vec![ir::AbiParam::new(ir::types::I8)], // success
            call_conv: isa::CallConv::SystemV,
        }
    }

    /// Returns the function signature for a memory write hook.
    pub(crate) fn write_sig(ptr_type: ir::Type, write_type: ir::Type) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ir::types::I32), // address
                ir::AbiParam::new(write_type),     // value
            ],
            returns: vec![ir::AbiParam::new(ir::types::I8)], // success
            call_conv: isa::CallConv::SystemV,
        }
    }

    /// Returns the function signature for the fallback hook.
    pub(crate) fn fallback_sig(ptr_type: ir::Type) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ir::types::I32), // instruction
            ],
            returns: vec![ir::AbiParam::new(ir::types::I8)], // success
            call_conv: isa::CallConv::SystemV,
        }
    }
}

/// How a block exited.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Execution reached the end of the block. NIA holds the next address to execute.
    #[default]
    Ok = 0,
    /// A hook failed. CIA holds the address of the instruction that caused it.
    Fault = 1,
}

impl Status {
    #[inline(always)]
    pub fn is_fault(self) -> bool {
        self == Status::Fault
    }
}

/// Information regarding a block's execution.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Info {
    /// How many instructions were executed to completion.
    pub instructions: u32,
    /// How the block exited.
    pub status: Status,
}

pub type BlockFn =
    extern "sysv64-unwind" fn(*mut Info, *mut Context, *mut Registers, *const Hooks);

/// Meta information regarding a block.
#[derive(Debug, Clone)]
pub struct Meta {
    /// Address of the first instruction.
    pub addr: u32,
    /// How many instructions this block contains.
    pub instructions: u32,
    /// How many of them are executed through the fallback hook.
    pub fallbacks: u32,
    /// The Cranelift IR of this block. Only available if `cfg!(debug_assertions)` is true.
    pub clir: Option<String>,
}

/// Execution statistics of a block. Only updated by callers that profile it.
#[derive(Debug, Default)]
pub struct Stats {
    executions: AtomicU64,
    time_ns: AtomicU64,
}

impl Stats {
    /// Records one execution that took `elapsed`.
    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.time_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// How many executions were recorded.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Total time of the recorded executions.
    pub fn time(&self) -> Duration {
        Duration::from_nanos(self.time_ns.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.time_ns.store(0, Ordering::Relaxed);
    }
}

/// A compiled block of PowerPC instructions.
pub struct Block {
    meta: Meta,
    stats: Stats,
    code: ExecutableCode,
}

impl Block {
    pub(crate) fn new(code: ExecutableCode, meta: Meta) -> Self {
        Self {
            meta,
            stats: Stats::default(),
            code,
        }
    }

    /// Meta information regarding this block.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    #[inline(always)]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Executes this block of instructions.
    ///
    /// # Safety
    /// `regs` must be valid for reads and writes for the whole call, and `ctx` must be what the
    /// functions in `hooks` expect.
    #[inline(always)]
    pub unsafe fn call(
        &self,
        ctx: *mut Context,
        regs: *mut Registers,
        hooks: *const Hooks,
    ) -> Info {
        let mut info = Info::default();

        // SAFETY: the code was generated with the signature of `BlockFn`
        let func = unsafe { std::mem::transmute::<*const u8, BlockFn>(self.code.as_ptr()) };
        func(&raw mut info, ctx, regs, hooks);

        info
    }
}
