//! Handlers registered by the embedding application.
use crate::{
    core::{CoreContext, CoreId, Fault},
    interpreter,
};
use espresso::{HandlerTable, Ins};
use std::sync::Arc;

/// An interpreter instruction handler.
pub type ExecFn = fn(&mut CoreContext<'_>, Ins) -> Result<(), Fault>;

/// Called on each core thread once it starts. The thread exits when it returns.
pub type EntrypointHandler = Arc<dyn Fn(&mut CoreContext<'_>) + Send + Sync>;
/// Called with the faulting address on an access violation. Must not return.
pub type SegfaultHandler = Arc<dyn Fn(&mut CoreContext<'_>, u32) + Send + Sync>;
/// Called with the target of every branch that is executed. Compiled code reports the start of
/// every block it enters instead.
pub type BranchTraceHandler = Arc<dyn Fn(CoreId, u32) + Send + Sync>;
/// Called with the interrupt flags being serviced.
pub type InterruptHandler = Arc<dyn Fn(&mut CoreContext<'_>, u32) + Send + Sync>;
/// Called with the id of a `kc` instruction.
pub type KernelCallHandler = Arc<dyn Fn(&mut CoreContext<'_>, u32) + Send + Sync>;
/// Called with invalid or unimplemented instructions and taken traps. NIA already points past
/// the instruction.
pub type IllegalInstructionHandler = Arc<dyn Fn(&mut CoreContext<'_>, Ins) + Send + Sync>;

/// Every handler used by the cores.
#[derive(Clone)]
pub struct Handlers {
    pub(crate) table: HandlerTable<ExecFn>,
    pub(crate) entrypoint: Option<EntrypointHandler>,
    pub(crate) segfault: SegfaultHandler,
    pub(crate) branch_trace: Option<BranchTraceHandler>,
    pub(crate) interrupt: Option<InterruptHandler>,
    pub(crate) kernel_call: Option<KernelCallHandler>,
    pub(crate) illegal_instruction: IllegalInstructionHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            table: interpreter::default_handlers(),
            entrypoint: None,
            segfault: Arc::new(|ctx, addr| {
                panic!(
                    "{} segfaulted at 0x{addr:08X} (cia 0x{:08X})",
                    ctx.id(),
                    ctx.regs().cia
                )
            }),
            branch_trace: None,
            interrupt: None,
            kernel_call: None,
            illegal_instruction: Arc::new(|ctx, ins| {
                tracing::error!(
                    core = %ctx.id(),
                    cia = format_args!("{:08X}", ctx.regs().cia),
                    "illegal instruction {ins:?}, skipping"
                );
            }),
        }
    }
}
