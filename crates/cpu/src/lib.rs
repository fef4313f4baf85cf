//! The three Espresso cores of the Wii U, sharing a single guest memory image.
//!
//! A [`CpuSubsystem`] owns the cores, their interrupt state, the alarm timer, breakpoints, the
//! debugger barrier and the JIT block cache. The embedding application registers its handlers,
//! calls [`CpuSubsystem::start`] and drives guest code from the entry-point handler through
//! [`CoreContext::resume`].
mod breakpoints;
mod config;
mod core;
mod debug;
mod handlers;
mod interpreter;
mod jit;
mod memory;
mod timer;

pub mod interrupts;

pub use breakpoints::{Breakpoint, BreakpointMode, Breakpoints};
pub use config::{Config, JitMode};
pub use crate::core::{CORE_COUNT, Core, CoreContext, CoreId, Exit, Fault};
pub use espresso::{CALLBACK_ADDR, Ins, InsId, Registers};
pub use handlers::{
    BranchTraceHandler, EntrypointHandler, ExecFn, IllegalInstructionHandler, InterruptHandler,
    KernelCallHandler, SegfaultHandler,
};
pub use interpreter::Exec;
pub use jit::{BlockProfile, JitProfile};
pub use memory::{Memory, Primitive};

use crate::{
    debug::DebugState, handlers::Handlers, interrupts::Signals, jit::JitState, timer::Timer,
};
use easyerr::{Error, ResultExt};
use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

/// Frequency of the time base, in Hz.
pub const TIME_BASE_FREQUENCY: u64 = 62_156_250;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("no core entrypoint handler was set")]
    NoEntrypoint,
    #[error("the cpu subsystem was already started")]
    AlreadyStarted,
    #[error("failed to spawn thread")]
    Spawn { source: std::io::Error },
}

#[derive(Default)]
struct Threads {
    cores: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

/// The CPU subsystem.
pub struct CpuSubsystem {
    config: Config,
    memory: Arc<Memory>,
    handlers: RwLock<Arc<Handlers>>,
    cores: [Mutex<Core>; CORE_COUNT],
    signals: [Signals; CORE_COUNT],
    timer: Timer,
    breakpoints: Breakpoints,
    debug: DebugState,
    jit: JitState,
    jit_enabled: AtomicBool,
    epoch: Instant,
    started: AtomicBool,
    live: AtomicUsize,
    threads: Mutex<Threads>,
}

impl CpuSubsystem {
    /// Builds the three cores and populates the handler tables. Handlers should be set before
    /// calling [`CpuSubsystem::start`].
    pub fn initialise(config: Config, memory: Arc<Memory>) -> Arc<Self> {
        tracing::debug!(?memory, jit_mode = ?config.jit_mode, "initialising cpu subsystem");

        Arc::new(Self {
            jit: JitState::new(config.jit.clone()),
            jit_enabled: AtomicBool::new(config.jit_mode == JitMode::Enabled),
            memory,
            handlers: RwLock::new(Arc::new(Handlers::default())),
            cores: CoreId::ALL.map(|id| Mutex::new(Core::new(id))),
            signals: Default::default(),
            timer: Timer::default(),
            breakpoints: Breakpoints::default(),
            debug: DebugState::default(),
            epoch: Instant::now(),
            started: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            threads: Mutex::new(Threads::default()),
            config,
        })
    }

    #[inline(always)]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline(always)]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    #[inline(always)]
    pub(crate) fn signals(&self, core: CoreId) -> &Signals {
        &self.signals[core.index()]
    }

    #[inline(always)]
    pub(crate) fn debug(&self) -> &DebugState {
        &self.debug
    }

    #[inline(always)]
    pub(crate) fn jit(&self) -> &JitState {
        &self.jit
    }

    /// Current handlers. Contexts take a copy when they are created.
    pub(crate) fn handlers(&self) -> Arc<Handlers> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_handlers(&self, f: impl FnOnce(&mut Handlers)) {
        if self.started.load(Ordering::Acquire) {
            tracing::warn!("handlers changed after start, running cores will not observe it");
        }

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        f(Arc::make_mut(&mut handlers));
    }

    /// Number of core threads that have not exited yet.
    pub(crate) fn live_cores(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Spawns the timer thread and one thread per core, each of which calls the entrypoint
    /// handler.
    pub fn start(self: &Arc<Self>) -> Result<(), StartError> {
        let Some(entrypoint) = self.handlers().entrypoint.clone() else {
            return Err(StartError::NoEntrypoint);
        };

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StartError::AlreadyStarted);
        }

        tracing::info!(jit = self.jit_enabled(), "starting cpu subsystem");

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        self.timer.arm();
        let timer = std::thread::Builder::new()
            .name("cpu-timer".to_owned())
            .spawn({
                let sys = self.clone();
                move || {
                    sys.timer
                        .run(|core| sys.interrupt(core, interrupts::ALARM));
                }
            })
            .context(StartCtx::Spawn)?;
        threads.timer = Some(timer);

        self.live.store(CORE_COUNT, Ordering::Release);
        for id in CoreId::ALL {
            let spawned = std::thread::Builder::new()
                .name(format!("cpu-{id}"))
                .stack_size(self.config.stack_size)
                .spawn({
                    let sys = self.clone();
                    let entrypoint = entrypoint.clone();
                    move || sys.run_core(id, &*entrypoint)
                });

            match spawned {
                Ok(handle) => threads.cores.push(handle),
                Err(source) => {
                    // the missing cores will never exit on their own
                    self.live
                        .fetch_sub(CORE_COUNT - threads.cores.len(), Ordering::AcqRel);
                    drop(threads);
                    self.halt();

                    return Err(StartError::Spawn { source });
                }
            }
        }

        Ok(())
    }

    fn run_core(&self, id: CoreId, entrypoint: &(dyn Fn(&mut CoreContext<'_>) + Send + Sync)) {
        let _span = tracing::info_span!("core", %id).entered();
        tracing::debug!("core thread started");

        {
            let mut core = self.cores[id.index()]
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let mut ctx = CoreContext::new(self, &mut core);
            entrypoint(&mut ctx);
        }

        self.live.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!("core thread exited");
    }

    /// Waits for every core thread to exit, then stops the timer thread.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));

        for handle in threads.cores {
            let name = handle.thread().name().unwrap_or("cpu").to_owned();
            if handle.join().is_err() {
                tracing::error!("{name} panicked");
            }
        }

        self.timer.stop();
        if let Some(timer) = threads.timer
            && timer.join().is_err()
        {
            tracing::error!("timer thread panicked");
        }

        tracing::info!("cpu subsystem stopped");
    }

    /// Sends SRESET to every core, making their threads exit once they return to the scheduler.
    pub fn halt(&self) {
        tracing::info!("halting every core");
        for id in CoreId::ALL {
            self.interrupt(id, interrupts::SRESET);
        }
    }

    /// Runs `f` with the context of `core`. Blocks while the core thread is running, so this is
    /// meant for use before [`CpuSubsystem::start`] or after [`CpuSubsystem::join`].
    pub fn with_context<R>(&self, core: CoreId, f: impl FnOnce(&mut CoreContext<'_>) -> R) -> R {
        let mut state = self.cores[core.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut ctx = CoreContext::new(self, &mut state);
        f(&mut ctx)
    }

    // handlers

    pub fn set_core_entrypoint_handler(&self, handler: EntrypointHandler) {
        self.update_handlers(|h| h.entrypoint = Some(handler));
    }

    pub fn set_segfault_handler(&self, handler: SegfaultHandler) {
        self.update_handlers(|h| h.segfault = handler);
    }

    pub fn set_branch_trace_handler(&self, handler: Option<BranchTraceHandler>) {
        self.update_handlers(|h| h.branch_trace = handler);
    }

    pub fn set_interrupt_handler(&self, handler: InterruptHandler) {
        self.update_handlers(|h| h.interrupt = Some(handler));
    }

    pub fn set_kernel_call_handler(&self, handler: KernelCallHandler) {
        self.update_handlers(|h| h.kernel_call = Some(handler));
    }

    pub fn set_illegal_instruction_handler(&self, handler: IllegalInstructionHandler) {
        self.update_handlers(|h| h.illegal_instruction = handler);
    }

    /// Replaces the interpreter handler of `id`.
    pub fn register_interpreter_handler(&self, id: InsId, handler: ExecFn) {
        self.update_handlers(|h| {
            h.table.register(id, handler);
        });
    }

    // interrupts

    /// Raises `flags` on `core`.
    pub fn interrupt(&self, core: CoreId, flags: u32) {
        tracing::trace!(%core, flags = format_args!("{flags:#X}"), "raising interrupt");
        self.signals(core).raise(flags);
    }

    /// Sets the interrupt mask of `core`, returning the previous one.
    pub fn set_interrupt_mask(&self, core: CoreId, mask: u32) -> u32 {
        self.signals(core).set_mask(mask)
    }

    /// Schedules ALARM on `core` at `deadline`, or cancels it with `None`.
    pub fn set_next_alarm(&self, core: CoreId, deadline: Option<Instant>) {
        self.timer.set_deadline(core, deadline);
    }

    pub fn next_alarm(&self, core: CoreId) -> Option<Instant> {
        self.timer.deadline(core)
    }

    /// Ticks of the time base since initialisation.
    pub fn time_base(&self) -> u64 {
        let nanos = self.epoch.elapsed().as_nanos();
        (nanos * TIME_BASE_FREQUENCY as u128 / 1_000_000_000) as u64
    }

    // breakpoints

    #[inline(always)]
    pub fn breakpoints(&self) -> &Breakpoints {
        &self.breakpoints
    }

    /// Adds a breakpoint at `addr`, replacing any existing one.
    pub fn add_breakpoint(&self, addr: u32, mode: BreakpointMode) {
        tracing::debug!("adding {mode:?} breakpoint at 0x{addr:08X}");
        let original = self.memory.read::<u32>(addr);
        self.breakpoints.add(addr, mode, original);
    }

    pub fn remove_breakpoint(&self, addr: u32) {
        self.breakpoints.remove(addr);
    }

    pub fn has_breakpoint(&self, addr: u32) -> bool {
        self.breakpoints.has(addr)
    }

    /// Whether any breakpoint is armed.
    pub fn has_breakpoints(&self) -> bool {
        self.breakpoints.any()
    }

    // debugger

    /// Sends DBG_BREAK to every core.
    pub fn pause(&self) {
        for id in CoreId::ALL {
            self.interrupt(id, interrupts::DBG_BREAK);
        }
    }

    /// Releases the cores if they are paused. Returns whether they were.
    pub fn resume(&self) -> bool {
        self.debug.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.debug.is_paused()
    }

    /// The core that started the current pause.
    pub fn pause_initiator(&self) -> Option<CoreId> {
        self.debug.initiator()
    }

    /// Registers of `core` at the time it paused, if the cores are paused.
    pub fn paused_context(&self, core: CoreId) -> Option<Registers> {
        self.debug.snapshot(core)
    }

    fn step(&self, core: CoreId, over: bool) -> bool {
        let Some(regs) = self.paused_context(core) else {
            return false;
        };

        let target = debug::step_target(&self.memory, &regs, over);
        self.add_breakpoint(target, BreakpointMode::SingleFire);
        self.resume()
    }

    /// Arms a single fire breakpoint at the next instruction `core` executes and resumes. Returns
    /// whether the cores were paused.
    pub fn step_into(&self, core: CoreId) -> bool {
        self.step(core, false)
    }

    /// Like [`CpuSubsystem::step_into`], but calls stop at the instruction after them.
    pub fn step_over(&self, core: CoreId) -> bool {
        self.step(core, true)
    }

    // jit

    pub fn jit_mode(&self) -> JitMode {
        if self.jit_enabled() {
            JitMode::Enabled
        } else {
            JitMode::Disabled
        }
    }

    pub fn set_jit_mode(&self, mode: JitMode) {
        tracing::debug!(?mode, "changing jit mode");
        self.jit_enabled
            .store(mode == JitMode::Enabled, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn jit_enabled(&self) -> bool {
        self.jit_enabled.load(Ordering::Acquire)
    }

    /// Drops every compiled block. Blocks being executed finish normally.
    pub fn clear_instruction_cache(&self) {
        self.jit.clear();
    }

    /// Number of blocks currently in the JIT cache.
    pub fn cached_blocks(&self) -> usize {
        self.jit.cached()
    }

    /// Number of blocks compiled so far.
    pub fn compiled_blocks(&self) -> u64 {
        self.jit.compiled_count()
    }

    /// Number of blocks whose results differed from the interpreter. Only counted if the JIT
    /// settings enable verification.
    pub fn jit_divergences(&self) -> u64 {
        self.jit.divergences()
    }

    /// Selects the cores whose block executions are profiled, one bit per core. Blocks are not
    /// profiled while verifying.
    pub fn set_jit_profiling_mask(&self, mask: u32) {
        self.jit.set_profiling_mask(mask);
    }

    pub fn jit_profiling_mask(&self) -> u32 {
        self.jit.profiling_mask()
    }

    /// Statistics of the cached blocks executed while profiled.
    pub fn jit_profile(&self) -> JitProfile {
        self.jit.profile()
    }

    /// Clears every profiling statistic.
    pub fn reset_jit_profile(&self) {
        self.jit.reset_profile();
    }
}
