//! A JIT compiler for Espresso PowerPC code, built on cranelift.
//!
//! Guest code is translated one block at a time. A block runs until a branch, an instruction that
//! needs the outside world to observe it (kernel calls, traps, MSR changes) or the configured
//! instruction limit. Instructions without a native translation are executed through the
//! fallback hook, which hands them to the interpreter one at a time.

mod builder;
mod code;

pub mod block;

use crate::{block::Meta, code::ExecutableCode};
use cranelift::{
    codegen::{self, ir},
    frontend, native,
    prelude::{Configurable, isa::TargetIsa},
};
use easyerr::{Error, ResultExt};
use espresso::{HandlerTable, Ins, InsId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::VariantArray;

pub use block::{Block, Hooks, Info, Stats};
pub use builder::{Action, BlockBuilder, EmitFn, JitHandler};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum number of instructions in a single block.
    pub max_instructions: u32,
    /// Whether to execute every floating point instruction through the fallback.
    pub fallback_float: bool,
    /// Whether blocks are compiled for verification against the interpreter. Every block then
    /// holds a single instruction, so its effects can be replayed one instruction at a time.
    pub verify: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_instructions: 3000,
            fallback_float: false,
            verify: false,
        }
    }
}

struct Compiler {
    settings: Settings,
    isa: Arc<dyn TargetIsa>,
}

impl Compiler {
    /// Maximum number of instructions in a block compiled with the current settings.
    fn block_limit(&self) -> u32 {
        if self.settings.verify {
            1
        } else {
            self.settings.max_instructions
        }
    }

    fn new(settings: Settings) -> Self {
        let verifier = if cfg!(debug_assertions) {
            "true"
        } else {
            "false"
        };

        let mut codegen = codegen::settings::builder();
        codegen.set("preserve_frame_pointers", "true").unwrap();
        codegen.set("use_colocated_libcalls", "false").unwrap();
        codegen.set("is_pic", "false").unwrap();

        // affect runtime performance
        codegen.set("opt_level", "speed").unwrap();
        codegen.set("enable_verifier", verifier).unwrap();
        codegen.set("enable_alias_analysis", "true").unwrap();
        codegen.set("regalloc_algorithm", "backtracking").unwrap();
        codegen.set("regalloc_checker", "false").unwrap();
        codegen
            .set("enable_heap_access_spectre_mitigation", "false")
            .unwrap();
        codegen
            .set("enable_table_access_spectre_mitigation", "false")
            .unwrap();

        let isa_builder = native::builder().unwrap_or_else(|msg| {
            panic!("host machine is not supported: {}", msg);
        });

        let flags = codegen::settings::Flags::new(codegen);
        let isa = isa_builder.finish(flags).unwrap();

        Compiler { settings, isa }
    }

    fn block_signature(&self) -> ir::Signature {
        let ptr = self.isa.pointer_type();
        ir::Signature {
            // info, ctx, regs, hooks
            params: vec![ir::AbiParam::new(ptr); 4],
            returns: vec![],
            call_conv: codegen::isa::CallConv::SystemV,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("block contains no instructions")]
    EmptyBlock,
    #[error(transparent)]
    Codegen { source: codegen::CodegenError },
    #[error("failed to allocate executable memory")]
    Allocation { source: std::io::Error },
}

macro_rules! native {
    ($table:ident; $($id:ident => $method:ident),* $(,)?) => {
        $(
            $table.register(
                InsId::$id,
                JitHandler::Emit(|bd, ins| {
                    bd.$method(ins);
                    Action::Continue
                }),
            );
        )*
    };
}

macro_rules! native_action {
    ($table:ident; $($id:ident => $method:ident),* $(,)?) => {
        $(
            $table.register(InsId::$id, JitHandler::Emit(|bd, ins| bd.$method(ins)));
        )*
    };
}

/// Returns the handler table with every native translation registered. Every other instruction is
/// marked as fallback.
pub fn default_handlers(settings: &Settings) -> HandlerTable<JitHandler> {
    let mut table = HandlerTable::new();

    native! {
        table;
        // arithmetic
        Add => add, Addc => addc, Adde => adde, Addi => addi, Addic => addic,
        AddicRc => addic_record, Addis => addis, Addme => addme, Addze => addze,
        Subf => subf, Subfc => subfc, Subfe => subfe, Subfic => subfic, Subfme => subfme,
        Subfze => subfze, Neg => neg, Mulli => mulli, Mullw => mullw, Mulhw => mulhw,
        Mulhwu => mulhwu,

        // logic
        And => and, Andc => andc, AndiRc => andi_record, AndisRc => andis_record, Or => or,
        Orc => orc, Ori => ori, Oris => oris, Xor => xor, Xori => xori, Xoris => xoris,
        Nand => nand, Nor => nor, Eqv => eqv, Extsb => extsb, Extsh => extsh,
        Cntlzw => cntlzw, Rlwimi => rlwimi, Rlwinm => rlwinm, Rlwnm => rlwnm, Slw => slw,
        Srw => srw, Sraw => sraw, Srawi => srawi,

        // compare and condition register
        Cmp => cmp, Cmpi => cmpi, Cmpl => cmpl, Cmpli => cmpli, Crand => crand,
        Crandc => crandc, Creqv => creqv, Crnand => crnand, Crnor => crnor, Cror => cror,
        Crorc => crorc, Crxor => crxor, Mcrf => mcrf, Mcrxr => mcrxr,

        // memory
        Lbz => lbz, Lbzu => lbzu, Lbzx => lbzx, Lbzux => lbzux, Lhz => lhz, Lhzu => lhzu,
        Lhzx => lhzx, Lhzux => lhzux, Lha => lha, Lhau => lhau, Lhax => lhax, Lhaux => lhaux,
        Lwz => lwz, Lwzu => lwzu, Lwzx => lwzx, Lwzux => lwzux, Lhbrx => lhbrx,
        Lwbrx => lwbrx, Stb => stb, Stbu => stbu, Stbx => stbx, Stbux => stbux, Sth => sth,
        Sthu => sthu, Sthx => sthx, Sthux => sthux, Stw => stw, Stwu => stwu, Stwx => stwx,
        Stwux => stwux, Sthbrx => sthbrx, Stwbrx => stwbrx,

        // system
        Mfcr => mfcr, Mtcrf => mtcrf, Mfmsr => mfmsr, Sync => nop, Eieio => nop, Dcbt => nop,
        Dcbtst => nop, Dcbf => nop, Dcbst => nop, Dcbi => nop, Tlbie => nop, Tlbsync => nop,
    }

    native_action! {
        table;
        B => b, Bc => bc, Bclr => bclr, Bcctr => bcctr, Mfspr => mfspr, Mtspr => mtspr,
        Mtmsr => mtmsr, Isync => isync,
    }

    if !settings.fallback_float {
        native! {
            table;
            Fadd => fadd, Fadds => fadds, Fsub => fsub, Fsubs => fsubs, Fmul => fmul,
            Fmuls => fmuls, Fdiv => fdiv, Fdivs => fdivs, Frsp => frsp, Fmr => fmr,
            Fneg => fneg, Fabs => fabs, Fnabs => fnabs, Fcmpu => fcmpu, Fcmpo => fcmpo,
            Lfd => lfd, Lfdu => lfdu, Lfdx => lfdx, Lfdux => lfdux, Stfd => stfd,
            Stfdu => stfdu, Stfdx => stfdx, Stfdux => stfdux, Stfiwx => stfiwx,
        }
    }

    for &id in InsId::VARIANTS {
        if table.get(id).is_none() {
            table.register(id, JitHandler::Fallback);
        }
    }

    table
}

/// A JIT context, producing [`Block`]s.
pub struct Jit {
    compiler: Compiler,
    code_ctx: codegen::Context,
    func_ctx: frontend::FunctionBuilderContext,
    handlers: HandlerTable<JitHandler>,
    compiled_count: u64,
}

impl Jit {
    pub fn new(settings: Settings) -> Self {
        let handlers = default_handlers(&settings);
        Self::with_handlers(settings, handlers)
    }

    pub fn with_handlers(settings: Settings, handlers: HandlerTable<JitHandler>) -> Self {
        Self {
            compiler: Compiler::new(settings),
            code_ctx: codegen::Context::new(),
            func_ctx: frontend::FunctionBuilderContext::new(),
            handlers,
            compiled_count: 0,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.compiler.settings
    }

    /// The handler table used for translation. Changes only affect blocks compiled afterwards.
    pub fn handlers_mut(&mut self) -> &mut HandlerTable<JitHandler> {
        &mut self.handlers
    }

    /// How many blocks have been compiled by this context.
    pub fn compiled_count(&self) -> u64 {
        self.compiled_count
    }

    /// Compiles a block starting at `addr` with the given instructions (up until a block ending
    /// instruction, the instruction limit or the end of the iterator).
    pub fn compile(
        &mut self,
        addr: u32,
        instructions: impl Iterator<Item = Ins>,
    ) -> Result<Block, BuildError> {
        let _span = tracing::trace_span!("compiling new block", addr = format_args!("{addr:08X}"))
            .entered();

        let mut func = ir::Function::new();
        func.signature = self.compiler.block_signature();

        let func_builder = frontend::FunctionBuilder::new(&mut func, &mut self.func_ctx);
        let builder = BlockBuilder::new(
            func_builder,
            self.compiler.isa.pointer_type(),
            &self.handlers,
        );

        let (count, fallbacks) = builder.build(addr, instructions, self.compiler.block_limit());
        if count == 0 {
            return Err(BuildError::EmptyBlock);
        }

        let clir = cfg!(debug_assertions).then(|| func.display().to_string());

        self.code_ctx.clear();
        self.code_ctx.func = func;
        let compiled = self
            .code_ctx
            .compile(&*self.compiler.isa, &mut Default::default())
            .map_err(|e| e.inner)
            .context(BuildCtx::Codegen)?;

        let code = ExecutableCode::new(compiled.code_buffer()).context(BuildCtx::Allocation)?;
        let meta = Meta {
            addr,
            instructions: count,
            fallbacks,
            clir,
        };

        tracing::trace!(
            instructions = count,
            fallbacks,
            size = code.size(),
            "compiled block"
        );

        self.compiled_count += 1;
        Ok(Block::new(code, meta))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::{Context, Status};
    use espresso::Registers;

    extern "sysv64-unwind" fn fail_read<T>(_: *mut Context, _: u32, _: *mut T) -> bool {
        false
    }

    extern "sysv64-unwind" fn fail_write<T>(_: *mut Context, _: u32, _: T) -> bool {
        false
    }

    /// Records the instruction in the context, which must point to a `u32`.
    extern "sysv64-unwind" fn record_fallback(ctx: *mut Context, raw: u32) -> bool {
        unsafe { *ctx.cast::<u32>() = raw };
        true
    }

    const TEST_HOOKS: Hooks = Hooks {
        read_u8: fail_read::<u8>,
        write_u8: fail_write::<u8>,
        read_u16: fail_read::<u16>,
        write_u16: fail_write::<u16>,
        read_u32: fail_read::<u32>,
        write_u32: fail_write::<u32>,
        read_u64: fail_read::<u64>,
        write_u64: fail_write::<u64>,
        fallback: record_fallback,
    };

    fn compile(addr: u32, code: &[u32]) -> Block {
        let mut jit = Jit::new(Settings::default());
        jit.compile(addr, code.iter().copied().map(Ins::new))
            .unwrap()
    }

    fn run(block: &Block, regs: &mut Registers) -> (Info, u32) {
        let mut recorded = 0u32;
        let info = unsafe {
            block.call(
                (&raw mut recorded).cast(),
                regs as *mut Registers,
                &TEST_HOOKS,
            )
        };

        (info, recorded)
    }

    #[test]
    fn every_instruction_has_a_handler() {
        let table = default_handlers(&Settings::default());
        assert_eq!(table.missing().count(), 0);

        let table = default_handlers(&Settings {
            fallback_float: true,
            ..Default::default()
        });
        assert!(matches!(
            table.get(InsId::Fadd),
            Some(JitHandler::Fallback)
        ));
    }

    #[test]
    fn empty_block() {
        let mut jit = Jit::new(Settings::default());
        let result = jit.compile(0x1000, std::iter::empty());
        assert!(matches!(result, Err(BuildError::EmptyBlock)));
        assert_eq!(jit.compiled_count(), 0);
    }

    #[test]
    fn block_ends_at_branch() {
        let block = compile(
            0x1000,
            &[
                0x3860_0005, // addi r3, r0, 5
                0x3880_0007, // addi r4, r0, 7
                0x7CA3_2214, // add r5, r3, r4
                0x4800_0000, // b 0
                0x3860_0001, // addi r3, r0, 1
            ],
        );
        assert_eq!(block.meta().instructions, 4);
        assert_eq!(block.meta().fallbacks, 0);

        let mut regs = Registers::default();
        let (info, _) = run(&block, &mut regs);

        assert_eq!(info.status, Status::Ok);
        assert_eq!(info.instructions, 4);
        assert_eq!(regs.gpr[3], 5);
        assert_eq!(regs.gpr[4], 7);
        assert_eq!(regs.gpr[5], 12);
        assert_eq!(regs.cia, 0x100C);
        assert_eq!(regs.nia, 0x100C);
    }

    #[test]
    fn conditional_branch() {
        let block = compile(
            0x1000,
            &[
                0x2C03_0005, // cmpwi r3, 5
                0x4182_0008, // beq +8
            ],
        );

        let mut regs = Registers::default();
        regs.gpr[3] = 5;
        let (info, _) = run(&block, &mut regs);
        assert_eq!(info.instructions, 2);
        assert_eq!(regs.cr, 0x2000_0000);
        assert_eq!(regs.nia, 0x100C);

        let mut regs = Registers::default();
        regs.gpr[3] = 3;
        run(&block, &mut regs);
        assert_eq!(regs.cr, 0x8000_0000);
        assert_eq!(regs.nia, 0x1008);
    }

    #[test]
    fn block_limit() {
        let mut jit = Jit::new(Settings {
            max_instructions: 2,
            ..Default::default()
        });

        let block = jit
            .compile(0x2000, std::iter::repeat(Ins::new(0x3863_0001))) // addi r3, r3, 1
            .unwrap();
        assert_eq!(block.meta().instructions, 2);

        let mut regs = Registers::default();
        let (info, _) = run(&block, &mut regs);
        assert_eq!(info.instructions, 2);
        assert_eq!(regs.gpr[3], 2);
        assert_eq!(regs.cia, 0x2004);
        assert_eq!(regs.nia, 0x2008);
    }

    #[test]
    fn verify_compiles_single_instructions() {
        let mut jit = Jit::new(Settings {
            verify: true,
            ..Default::default()
        });

        let block = jit
            .compile(0x1000, [0x3860_0005, 0x3880_0007].into_iter().map(Ins::new))
            .unwrap();
        assert_eq!(block.meta().instructions, 1);

        let mut regs = Registers::default();
        let (info, _) = run(&block, &mut regs);
        assert_eq!(info.instructions, 1);
        assert_eq!(regs.gpr[3], 5);
        assert_eq!(regs.gpr[4], 0);
        assert_eq!(regs.nia, 0x1004);
    }

    #[test]
    fn fresh_blocks_have_no_stats() {
        let block = compile(0x1000, &[0x4E80_0020]); // blr
        assert_eq!(block.stats().executions(), 0);
        assert_eq!(block.stats().time(), std::time::Duration::ZERO);

        block.stats().record(std::time::Duration::from_micros(3));
        block.stats().record(std::time::Duration::from_micros(4));
        assert_eq!(block.stats().executions(), 2);
        assert_eq!(block.stats().time(), std::time::Duration::from_micros(7));

        block.stats().reset();
        assert_eq!(block.stats().executions(), 0);
        assert_eq!(block.stats().time(), std::time::Duration::ZERO);
    }

    #[test]
    fn failed_access_faults() {
        let block = compile(
            0x1000,
            &[
                0x38A0_0001, // addi r5, r0, 1
                0x8064_0000, // lwz r3, 0(r4)
                0x38A0_0002, // addi r5, r0, 2
                0x4800_0000, // b 0
            ],
        );

        let mut regs = Registers::default();
        regs.gpr[3] = 0xDEAD;
        let (info, _) = run(&block, &mut regs);

        assert!(info.status.is_fault());
        assert_eq!(info.instructions, 1);
        assert_eq!(regs.gpr[3], 0xDEAD);
        assert_eq!(regs.gpr[5], 1);
        assert_eq!(regs.cia, 0x1004);
    }

    #[test]
    fn fallback_is_called() {
        let block = compile(
            0x1000,
            &[
                0x3880_0009, // addi r4, r0, 9
                0x7C64_2BD6, // divw r3, r4, r5
                0x4800_0000, // b 0
            ],
        );
        assert_eq!(block.meta().fallbacks, 1);

        let mut regs = Registers::default();
        let (info, recorded) = run(&block, &mut regs);

        assert_eq!(info.status, Status::Ok);
        assert_eq!(recorded, 0x7C64_2BD6);
        // registers are written back before the fallback runs
        assert_eq!(regs.gpr[4], 9);
        assert_eq!(regs.nia, 0x1008);
    }
}
