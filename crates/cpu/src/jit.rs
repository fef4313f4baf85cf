//! Block cache and the glue between compiled blocks and a core.
use crate::{
    core::{CoreContext, Fault},
    memory::{Memory, Primitive},
};
use espresso::{Ins, InsId, Registers};
use ppcjit::{Block, BuildError, Hooks};
use rustc_hash::FxHashMap;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

/// Execution statistics of a cached block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockProfile {
    pub addr: u32,
    pub instructions: u32,
    pub executions: u64,
    pub time: Duration,
}

/// Statistics collected while profiling, with the most expensive blocks first.
#[derive(Debug, Clone, Default)]
pub struct JitProfile {
    /// Time spent in profiled blocks, including blocks dropped from the cache since the last reset.
    pub total_time: Duration,
    pub blocks: Vec<BlockProfile>,
}

/// The compiler and the blocks it produced, shared by every core.
///
/// Blocks are reference counted: clearing the cache only affects future lookups, a core that is
/// executing a block keeps it alive until it exits.
pub(crate) struct JitState {
    compiler: Mutex<ppcjit::Jit>,
    blocks: Mutex<FxHashMap<u32, Arc<Block>>>,
    generation: AtomicU64,
    verify: bool,
    /// Held while a block is executed and replayed, so no other core touches memory in between.
    verify_lock: Mutex<()>,
    divergences: AtomicU64,
    profiling_mask: AtomicU32,
    profile_time: AtomicU64,
}

impl JitState {
    pub fn new(settings: ppcjit::Settings) -> Self {
        Self {
            verify: settings.verify,
            compiler: Mutex::new(ppcjit::Jit::new(settings)),
            blocks: Mutex::new(FxHashMap::default()),
            generation: AtomicU64::new(0),
            verify_lock: Mutex::new(()),
            divergences: AtomicU64::new(0),
            profiling_mask: AtomicU32::new(0),
            profile_time: AtomicU64::new(0),
        }
    }

    /// Number of verified blocks whose results differed from the interpreter.
    pub fn divergences(&self) -> u64 {
        self.divergences.load(Ordering::Relaxed)
    }

    pub fn set_profiling_mask(&self, mask: u32) {
        tracing::debug!(mask = format_args!("{mask:#b}"), "changing jit profiling mask");
        self.profiling_mask.store(mask, Ordering::Relaxed);
    }

    pub fn profiling_mask(&self) -> u32 {
        self.profiling_mask.load(Ordering::Relaxed)
    }

    fn record(&self, block: &Block, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.profile_time.fetch_add(nanos, Ordering::Relaxed);
        block.stats().record(elapsed);
    }

    /// Statistics of every cached block that was executed while profiled.
    pub fn profile(&self) -> JitProfile {
        let mut blocks = self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|block| block.stats().executions() > 0)
            .map(|block| BlockProfile {
                addr: block.meta().addr,
                instructions: block.meta().instructions,
                executions: block.stats().executions(),
                time: block.stats().time(),
            })
            .collect::<Vec<_>>();

        blocks.sort_by(|a, b| b.time.cmp(&a.time).then(a.addr.cmp(&b.addr)));
        JitProfile {
            total_time: Duration::from_nanos(self.profile_time.load(Ordering::Relaxed)),
            blocks,
        }
    }

    pub fn reset_profile(&self) {
        for block in self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            block.stats().reset();
        }

        self.profile_time.store(0, Ordering::Relaxed);
    }

    /// Drops every cached block.
    pub fn clear(&self) {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(blocks = blocks.len(), "clearing block cache");
        blocks.clear();
    }

    /// Number of cached blocks.
    pub fn cached(&self) -> usize {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of blocks compiled since initialisation, including discarded ones.
    pub fn compiled_count(&self) -> u64 {
        self.compiler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .compiled_count()
    }

    /// Returns the block starting at `addr`, compiling it if needed.
    fn block(&self, memory: &Memory, addr: u32) -> Result<Arc<Block>, BuildError> {
        if let Some(block) = self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&addr)
        {
            return Ok(block.clone());
        }

        let generation = self.generation.load(Ordering::Acquire);
        let block = {
            let mut compiler = self.compiler.lock().unwrap_or_else(|e| e.into_inner());
            let instructions = (0u32..)
                .map_while(|i| memory.read::<u32>(addr.wrapping_add(i.wrapping_mul(4))))
                .map(Ins::new);

            Arc::new(compiler.compile(addr, instructions)?)
        };

        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::Acquire) != generation {
            // the cache was cleared while compiling, the code might be stale already
            return Ok(block);
        }

        // another core might have compiled the same block in the meantime
        Ok(blocks.entry(addr).or_insert(block).clone())
    }
}

/// Memory contents overwritten by a block, recorded while verifying.
#[derive(Debug, Clone, Copy)]
struct Overwritten {
    addr: u32,
    size: u32,
    bits: u64,
}

fn read_bits(memory: &Memory, addr: u32, size: u32) -> Option<u64> {
    match size {
        1 => memory.read::<u8>(addr).map(u64::from),
        2 => memory.read::<u16>(addr).map(u64::from),
        4 => memory.read::<u32>(addr).map(u64::from),
        _ => memory.read::<u64>(addr),
    }
}

fn write_bits(memory: &Memory, addr: u32, size: u32, bits: u64) -> bool {
    match size {
        1 => memory.write(addr, bits as u8),
        2 => memory.write(addr, bits as u16),
        4 => memory.write(addr, bits as u32),
        _ => memory.write(addr, bits),
    }
}

/// Context passed to the hooks of a running block.
struct JitContext<'ctx, 'sys> {
    core: &'ctx mut CoreContext<'sys>,
    /// Why the block exited with a fault.
    fault: Option<Fault>,
    /// Whether the block called into the kernel.
    kernel_call: bool,
    /// Previous contents of every location written, if verifying.
    journal: Option<Vec<Overwritten>>,
}

const CTX_HOOKS: Hooks = {
    extern "sysv64-unwind" fn read<P: Primitive>(
        ctx: &mut JitContext<'_, '_>,
        addr: u32,
        value: &mut P,
    ) -> bool {
        match ctx.core.memory().read(addr) {
            Some(read) => {
                *value = read;
                true
            }
            None => {
                ctx.fault = Some(Fault::AccessViolation(addr));
                false
            }
        }
    }

    extern "sysv64-unwind" fn write<P: Primitive>(
        ctx: &mut JitContext<'_, '_>,
        addr: u32,
        value: P,
    ) -> bool {
        if let Some(journal) = &mut ctx.journal
            && let Some(previous) = ctx.core.memory().read::<P>(addr)
        {
            journal.push(Overwritten {
                addr,
                size: P::SIZE,
                bits: previous.to_bits(),
            });
        }

        if ctx.core.memory().write(addr, value) {
            true
        } else {
            ctx.fault = Some(Fault::AccessViolation(addr));
            false
        }
    }

    extern "sysv64-unwind" fn fallback(ctx: &mut JitContext<'_, '_>, raw: u32) -> bool {
        let ins = Ins::new(raw);
        tracing::trace!(
            core = %ctx.core.id(),
            cia = format_args!("{:08X}", ctx.core.regs().cia),
            "interpreting {ins:?}"
        );

        ctx.kernel_call |= ins.id == InsId::Kc;

        match ctx.core.dispatch(ins) {
            Ok(()) => true,
            Err(fault) => {
                ctx.fault = Some(fault);
                false
            }
        }
    }

    #[expect(
        clippy::missing_transmute_annotations,
        reason = "unnecessary - the definitions are above"
    )]
    unsafe {
        use ppcjit::block::{FallbackHook, ReadHook, WriteHook};
        use std::mem::transmute;

        let read_u8 =
            transmute::<_, ReadHook<u8>>(read::<u8> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let write_u8 =
            transmute::<_, WriteHook<u8>>(write::<u8> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let read_u16 =
            transmute::<_, ReadHook<u16>>(read::<u16> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let write_u16 =
            transmute::<_, WriteHook<u16>>(write::<u16> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let read_u32 =
            transmute::<_, ReadHook<u32>>(read::<u32> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let write_u32 =
            transmute::<_, WriteHook<u32>>(write::<u32> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let read_u64 =
            transmute::<_, ReadHook<u64>>(read::<u64> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let write_u64 =
            transmute::<_, WriteHook<u64>>(write::<u64> as extern "sysv64-unwind" fn(_, _, _) -> _);
        let fallback =
            transmute::<_, FallbackHook>(fallback as extern "sysv64-unwind" fn(_, _) -> _);

        Hooks {
            read_u8,
            write_u8,
            read_u16,
            write_u16,
            read_u32,
            write_u32,
            read_u64,
            write_u64,
            fallback,
        }
    }
};

impl CoreContext<'_> {
    /// Executes the block starting at NIA, compiling it first if it is not cached.
    ///
    /// Blocks that cannot be compiled are skipped by interpreting a single instruction, which also
    /// routes a failed instruction fetch to the segfault handler.
    pub(crate) fn run_block(&mut self) {
        let nia = self.core.regs.nia;
        let block = match self.sys.jit().block(self.memory(), nia) {
            Ok(block) => block,
            Err(BuildError::EmptyBlock) => {
                self.step();
                return;
            }
            Err(e) => {
                tracing::warn!(
                    core = %self.id(),
                    "failed to compile block at 0x{nia:08X}, interpreting: {e}"
                );
                self.step();
                return;
            }
        };

        self.trace_branch();

        let sys = self.sys;
        let jit = sys.jit();
        let verifying = jit.verify && block.meta().fallbacks == 0;
        let _guard = verifying.then(|| jit.verify_lock.lock().unwrap_or_else(|e| e.into_inner()));
        let before = verifying.then(|| self.core.regs.clone());
        let start = (!verifying && jit.profiling_mask() & self.id().bit() != 0).then(Instant::now);

        let regs = &raw mut self.core.regs;
        let mut ctx = JitContext {
            core: self,
            fault: None,
            kernel_call: false,
            journal: verifying.then(Vec::new),
        };

        // SAFETY: `regs` points into the core owned by `ctx`, which outlives the call, and the
        // hooks are the ones written for `JitContext`
        let info = unsafe {
            block.call(
                (&raw mut ctx).cast::<ppcjit::block::Context>(),
                regs,
                &CTX_HOOKS,
            )
        };

        let JitContext {
            fault,
            kernel_call,
            journal,
            ..
        } = ctx;

        // kernel calls run host code, which says nothing about the block
        if let Some(start) = start
            && !kernel_call
        {
            jit.record(&block, start.elapsed());
        }

        if info.status.is_fault() {
            match fault {
                Some(fault) => self.handle_fault(fault),
                None => unreachable!("block at 0x{nia:08X} faulted without recording why"),
            }
        } else if let (Some(before), Some(journal)) = (before, journal) {
            self.replay(before, &journal, info.instructions);
        }

        self.request_interrupt_check();
    }

    /// Undoes the effects of a block that executed `count` instructions and executes them again
    /// in the interpreter, reporting every difference. The interpreted results are kept.
    fn replay(&mut self, before: Registers, journal: &[Overwritten], count: u32) {
        let sys = self.sys;
        let memory = sys.memory();
        let written = journal
            .iter()
            .map(|write| read_bits(memory, write.addr, write.size))
            .collect::<Vec<_>>();

        for write in journal.iter().rev() {
            write_bits(memory, write.addr, write.size, write.bits);
        }

        let compiled = std::mem::replace(&mut self.core.regs, before);
        let cia = self.core.regs.nia;
        let mut differences = Vec::new();
        for _ in 0..count {
            if let Err(fault) = self.execute_one() {
                differences.push(format!("interpreter faulted: {fault}"));
                break;
            }
        }

        differences.extend(register_differences(&compiled, &self.core.regs));
        for (write, found) in journal.iter().zip(written) {
            let expected = read_bits(memory, write.addr, write.size);
            if found != expected {
                differences.push(format!(
                    "memory at 0x{:08X}: found {found:X?}, expected {expected:X?}",
                    write.addr
                ));
            }
        }

        if !differences.is_empty() {
            sys.jit().divergences.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                core = %self.id(),
                "block at 0x{cia:08X} diverged from the interpreter: {}",
                differences.join(", ")
            );
        }
    }
}

/// Describes every register that differs between `found` and `expected`. FPSCR is not compared,
/// compiled code does not maintain its status bits.
fn register_differences(found: &Registers, expected: &Registers) -> Vec<String> {
    let mut differences = Vec::new();
    let mut compare = |name: String, found: u64, expected: u64| {
        if found != expected {
            differences.push(format!("{name}: found {found:#X}, expected {expected:#X}"));
        }
    };

    for i in 0..32 {
        compare(format!("r{i}"), found.gpr[i] as u64, expected.gpr[i] as u64);
    }

    for i in 0..32 {
        for slot in 0..2 {
            compare(
                format!("f{i}[{slot}]"),
                found.fpr[i][slot].to_bits(),
                expected.fpr[i][slot].to_bits(),
            );
        }
    }

    for i in 0..8 {
        compare(format!("gqr{i}"), found.gqr[i] as u64, expected.gqr[i] as u64);
    }

    compare("cr".to_owned(), found.cr as u64, expected.cr as u64);
    compare("xer".to_owned(), found.xer as u64, expected.xer as u64);
    compare("lr".to_owned(), found.lr as u64, expected.lr as u64);
    compare("ctr".to_owned(), found.ctr as u64, expected.ctr as u64);
    compare("msr".to_owned(), found.msr as u64, expected.msr as u64);
    compare("nia".to_owned(), found.nia as u64, expected.nia as u64);

    differences
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, CoreId, CpuSubsystem, JitMode};
    use ppcjit::{Action, JitHandler};

    fn system(code: &[u32], settings: ppcjit::Settings) -> Arc<CpuSubsystem> {
        let memory = Arc::new(Memory::new(0x1000, 0x100));
        assert!(memory.load_words(0x1000, code));

        let config = Config {
            jit_mode: JitMode::Enabled,
            jit: settings,
            ..Default::default()
        };

        CpuSubsystem::initialise(config, memory)
    }

    fn verifying(code: &[u32]) -> Arc<CpuSubsystem> {
        system(
            code,
            ppcjit::Settings {
                verify: true,
                ..Default::default()
            },
        )
    }

    /// Runs `count` blocks on `core` starting at 0x1000, with r4 pointing at the start of memory.
    fn run_blocks(sys: &CpuSubsystem, core: CoreId, count: usize) -> Registers {
        sys.with_context(core, |ctx| {
            ctx.regs_mut().nia = 0x1000;
            ctx.regs_mut().gpr[4] = 0x1000;
            for _ in 0..count {
                ctx.run_block();
            }

            ctx.regs().clone()
        })
    }

    #[test]
    fn verified_blocks_match_the_interpreter() {
        let sys = verifying(&[
            0x3860_0005, // addi r3, r0, 5
            0x9064_0040, // stw r3, 0x40(r4)
            0x80A4_0040, // lwz r5, 0x40(r4)
        ]);

        let regs = run_blocks(&sys, CoreId::ALL[0], 3);
        assert_eq!(regs.gpr[3], 5);
        assert_eq!(regs.gpr[5], 5);
        assert_eq!(regs.nia, 0x100C);
        assert_eq!(sys.memory().read::<u32>(0x1040), Some(5));

        assert_eq!(sys.jit_divergences(), 0);
        assert_eq!(sys.cached_blocks(), 3);
    }

    #[test]
    fn wrong_translations_are_reported() {
        let sys = verifying(&[
            0x3C60_1234, // addis r3, r0, 0x1234
            0x6063_5678, // ori r3, r3, 0x5678
            0x9064_0040, // stw r3, 0x40(r4)
            0x38C0_0001, // addi r6, r0, 1
        ]);

        {
            let mut compiler = sys.jit().compiler.lock().unwrap();
            let handlers = compiler.handlers_mut();
            handlers.register(
                InsId::Stw,
                JitHandler::Emit(|bd, ins| {
                    bd.sth(ins);
                    Action::Continue
                }),
            );
            handlers.register(
                InsId::Addi,
                JitHandler::Emit(|bd, ins| {
                    bd.addis(ins);
                    Action::Continue
                }),
            );
        }

        let regs = run_blocks(&sys, CoreId::ALL[0], 4);
        assert_eq!(sys.jit_divergences(), 2);

        // the interpreted results are kept
        assert_eq!(regs.gpr[3], 0x1234_5678);
        assert_eq!(regs.gpr[6], 1);
        assert_eq!(sys.memory().read::<u32>(0x1040), Some(0x1234_5678));
    }

    #[test]
    fn profiling_counts_block_executions() {
        let sys = system(
            &[
                0x3863_0001, // addi r3, r3, 1
                0x4BFF_FFFC, // b -4
            ],
            ppcjit::Settings::default(),
        );

        run_blocks(&sys, CoreId::ALL[0], 5);
        assert!(sys.jit_profile().blocks.is_empty());

        sys.set_jit_profiling_mask(0b001);
        assert_eq!(sys.jit_profiling_mask(), 0b001);

        let regs = run_blocks(&sys, CoreId::ALL[0], 5);
        assert_eq!(regs.gpr[3], 10);
        run_blocks(&sys, CoreId::ALL[1], 3);

        let profile = sys.jit_profile();
        assert_eq!(profile.blocks.len(), 1);

        let block = &profile.blocks[0];
        assert_eq!(block.addr, 0x1000);
        assert_eq!(block.instructions, 2);
        assert_eq!(block.executions, 5);
        assert_eq!(profile.total_time, block.time);

        sys.reset_jit_profile();
        let profile = sys.jit_profile();
        assert!(profile.blocks.is_empty());
        assert_eq!(profile.total_time, Duration::ZERO);
    }

    #[test]
    fn blocks_are_cached_until_cleared() {
        let memory = Memory::new(0x1000, 0x100);
        assert!(memory.load_words(
            0x1000,
            &[
                0x3860_0005, // addi r3, r0, 5
                0x4E80_0020, // blr
            ],
        ));

        let jit = JitState::new(ppcjit::Settings::default());
        let first = jit.block(&memory, 0x1000).unwrap();
        let second = jit.block(&memory, 0x1000).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.meta().instructions, 2);
        assert_eq!(jit.cached(), 1);
        assert_eq!(jit.compiled_count(), 1);

        jit.clear();
        assert_eq!(jit.cached(), 0);

        let third = jit.block(&memory, 0x1000).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(jit.compiled_count(), 2);
    }

    #[test]
    fn unreadable_code_is_an_empty_block() {
        let memory = Memory::new(0x1000, 0x10);
        let jit = JitState::new(ppcjit::Settings::default());

        assert!(matches!(
            jit.block(&memory, 0x2000),
            Err(BuildError::EmptyBlock)
        ));
        assert_eq!(jit.cached(), 0);
    }

    #[test]
    fn blocks_stop_at_the_end_of_memory() {
        let memory = Memory::new(0x1000, 0x8);
        assert!(memory.load_words(0x1000, &[0x3860_0005, 0x3880_0007]));

        let jit = JitState::new(ppcjit::Settings::default());
        let block = jit.block(&memory, 0x1000).unwrap();
        assert_eq!(block.meta().instructions, 2);
    }
}
