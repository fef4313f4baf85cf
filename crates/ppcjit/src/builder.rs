mod arithmetic;
mod branch;
mod compare;
mod floating;
mod logic;
mod memory;
mod system;
mod util;

use crate::block::{Hooks, Info, Status};
use cranelift::{
    codegen::ir::{self, SigRef},
    frontend::{self, FunctionBuilder},
    prelude::InstBuilder,
};
use espresso::{HandlerTable, Ins, Reg};
use rustc_hash::FxHashMap;
use std::{collections::hash_map::Entry, mem::offset_of};

pub use util::IntoIrValue;

/// Memory flags for accesses to the register file, info and hooks.
const MEMFLAGS: ir::MemFlags = ir::MemFlags::trusted();

/// What the builder should do after an instruction has been emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Continue with the next instruction.
    Continue,
    /// The instruction has already exited the block.
    Finish,
}

/// Emits the translation of a single instruction.
pub type EmitFn = fn(&mut BlockBuilder<'_>, Ins) -> Action;

/// How the JIT handles an instruction identity.
#[derive(Clone, Copy)]
pub enum JitHandler {
    /// Translate with the given function.
    Emit(EmitFn),
    /// Call into the interpreter for this instruction.
    Fallback,
}

struct Consts {
    ptr_type: ir::Type,
    info_ptr: ir::Value,
    ctx_ptr: ir::Value,
    regs_ptr: ir::Value,
    hooks_ptr: ir::Value,
    hooks_sig: FxHashMap<i32, SigRef>,
    multiply_sig: Option<SigRef>,
    read_slot: ir::StackSlot,
}

struct RegState {
    var: frontend::Variable,
    modified: bool,
}

#[inline(always)]
fn reg_type(reg: Reg) -> ir::Type {
    if reg.is_float() {
        ir::types::F64
    } else {
        ir::types::I32
    }
}

/// Translates a sequence of instructions into a single cranelift function.
///
/// Guest registers are cached in cranelift variables and only written back when the block exits
/// or before control is handed to the interpreter.
pub struct BlockBuilder<'ctx> {
    bd: FunctionBuilder<'ctx>,
    consts: Consts,
    handlers: &'ctx HandlerTable<JitHandler>,
    regs: FxHashMap<Reg, RegState>,
    cia: u32,
    executed: u32,
    fallbacks: u32,
}

impl<'ctx> BlockBuilder<'ctx> {
    pub(crate) fn new(
        mut bd: FunctionBuilder<'ctx>,
        ptr_type: ir::Type,
        handlers: &'ctx HandlerTable<JitHandler>,
    ) -> Self {
        let entry_bb = bd.create_block();
        bd.append_block_params_for_function_params(entry_bb);
        bd.switch_to_block(entry_bb);
        bd.seal_block(entry_bb);

        let read_slot = bd.create_sized_stack_slot(ir::StackSlotData::new(
            ir::StackSlotKind::ExplicitSlot,
            size_of::<u64>() as u32,
            3,
        ));

        let params = bd.block_params(entry_bb);
        let consts = Consts {
            ptr_type,
            info_ptr: params[0],
            ctx_ptr: params[1],
            regs_ptr: params[2],
            hooks_ptr: params[3],
            hooks_sig: FxHashMap::default(),
            multiply_sig: None,
            read_slot,
        };

        Self {
            bd,
            consts,
            handlers,
            regs: FxHashMap::default(),
            cia: 0,
            executed: 0,
            fallbacks: 0,
        }
    }

    /// Address of the instruction being translated.
    #[inline(always)]
    pub fn cia(&self) -> u32 {
        self.cia
    }

    /// Returns the current value of `reg`.
    pub fn get(&mut self, reg: impl Into<Reg>) -> ir::Value {
        let reg = reg.into();
        let var = match self.regs.entry(reg) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                let loaded = self.bd.ins().load(
                    reg_type(reg),
                    MEMFLAGS,
                    self.consts.regs_ptr,
                    reg.offset() as i32,
                );

                let var = self.bd.declare_var(reg_type(reg));
                self.bd.def_var(var, loaded);
                v.insert(RegState {
                    var,
                    modified: false,
                })
            }
        }
        .var;

        self.bd.use_var(var)
    }

    /// Sets the value of `reg`.
    pub fn set(&mut self, reg: impl Into<Reg>, value: ir::Value) {
        let reg = reg.into();
        let var = match self.regs.entry(reg) {
            Entry::Occupied(o) => {
                let state = o.into_mut();
                state.modified = true;
                state.var
            }
            Entry::Vacant(v) => {
                let var = self.bd.declare_var(reg_type(reg));
                v.insert(RegState {
                    var,
                    modified: true,
                });

                var
            }
        };

        self.bd.def_var(var, value);
    }

    fn store_reg(&mut self, reg: Reg, value: ir::Value) {
        self.bd
            .ins()
            .store(MEMFLAGS, value, self.consts.regs_ptr, reg.offset() as i32);
    }

    /// Writes back every modified register, leaving the cache untouched.
    fn store_modified(&mut self) {
        let modified = self
            .regs
            .iter()
            .filter(|(_, state)| state.modified)
            .map(|(reg, state)| (*reg, state.var))
            .collect::<Vec<_>>();

        for (reg, var) in modified {
            let value = self.bd.use_var(var);
            self.store_reg(reg, value);
        }
    }

    /// Writes back every modified register and forgets all cached values.
    fn flush_and_forget(&mut self) {
        self.store_modified();
        self.regs.clear();
    }

    fn switch_to_bb(&mut self, bb: ir::Block) {
        self.bd.switch_to_block(bb);
    }

    /// Emits a return from the block. If `nia` is given, CIA and NIA are updated as well.
    fn exit(&mut self, nia: Option<ir::Value>, executed: u32, status: Status) {
        self.store_modified();

        if let Some(nia) = nia {
            let cia = self.ir_value(self.cia);
            self.store_reg(Reg::CIA, cia);
            self.store_reg(Reg::NIA, nia);
        }

        let executed = self.ir_value(executed);
        self.bd.ins().store(
            MEMFLAGS,
            executed,
            self.consts.info_ptr,
            offset_of!(Info, instructions) as i32,
        );

        let status = self.ir_value(status as u32);
        self.bd.ins().store(
            MEMFLAGS,
            status,
            self.consts.info_ptr,
            offset_of!(Info, status) as i32,
        );

        self.bd.ins().return_(&[]);
    }

    /// Exits the block after the current instruction, continuing at `nia`.
    pub fn exit_to(&mut self, nia: ir::Value) {
        self.exit(Some(nia), self.executed, Status::Ok);
    }

    /// Calls the hook at `offset` in [`Hooks`] with the given arguments.
    fn call_hook(
        &mut self,
        offset: usize,
        sig: impl FnOnce(ir::Type) -> ir::Signature,
        args: &[ir::Value],
    ) -> ir::Inst {
        let offset = offset as i32;
        let hook = self.bd.ins().load(
            self.consts.ptr_type,
            ir::MemFlags::trusted().with_readonly(),
            self.consts.hooks_ptr,
            offset,
        );

        let sig = *self
            .consts
            .hooks_sig
            .entry(offset)
            .or_insert_with(|| self.bd.import_signature(sig(self.consts.ptr_type)));

        self.bd.ins().call_indirect(sig, hook, args)
    }

    /// Continues only if `success` (an I8) is set. Otherwise, the block exits with
    /// [`Status::Fault`] at the current instruction.
    fn exit_unless(&mut self, success: ir::Value, store_addresses: bool) {
        let exit_block = self.bd.create_block();
        let continue_block = self.bd.create_block();

        self.bd.set_cold_block(exit_block);
        self.bd
            .ins()
            .brif(success, continue_block, &[], exit_block, &[]);

        self.bd.seal_block(exit_block);
        self.bd.seal_block(continue_block);

        // => failure
        self.switch_to_bb(exit_block);
        let nia = store_addresses.then(|| self.ir_value(self.cia.wrapping_add(4)));
        self.exit(nia, self.executed - 1, Status::Fault);

        // => success
        self.switch_to_bb(continue_block);
    }

    /// Executes `ins` through the interpreter.
    pub fn fallback(&mut self, ins: Ins) -> Action {
        self.fallbacks += 1;
        self.flush_and_forget();

        let cia = self.ir_value(self.cia);
        let nia = self.ir_value(self.cia.wrapping_add(4));
        self.store_reg(Reg::CIA, cia);
        self.store_reg(Reg::NIA, nia);

        let raw = self.ir_value(ins.raw);
        let inst = self.call_hook(
            offset_of!(Hooks, fallback),
            Hooks::fallback_sig,
            &[self.consts.ctx_ptr, raw],
        );

        let success = self.bd.inst_results(inst)[0];
        self.exit_unless(success, false);

        if ins.id.ends_block() {
            // the interpreter has already written NIA
            self.exit(None, self.executed, Status::Ok);
            Action::Finish
        } else {
            Action::Continue
        }
    }

    /// Emits `ins` with its registered handler. Returns `None` if there is no handler.
    fn dispatch(&mut self, ins: Ins) -> Option<Action> {
        Some(match *self.handlers.get(ins.id)? {
            JitHandler::Emit(emit) => emit(self, ins),
            JitHandler::Fallback => self.fallback(ins),
        })
    }

    fn emit(&mut self, ins: Ins) -> Action {
        self.bd.set_srcloc(ir::SourceLoc::new(self.executed));
        self.executed += 1;

        match self.dispatch(ins) {
            Some(action) => action,
            None => {
                tracing::trace!("no jit handler for {ins:?}, falling back");
                self.fallback(ins)
            }
        }
    }

    /// Translates instructions starting at `addr` until one of them ends the block, `max` of them
    /// have been translated or the iterator is exhausted. Returns how many were translated and how
    /// many of those use the fallback.
    pub(crate) fn build(
        mut self,
        addr: u32,
        instructions: impl Iterator<Item = Ins>,
        max: u32,
    ) -> (u32, u32) {
        self.cia = addr;
        for ins in instructions.take(max as usize) {
            if self.emit(ins) == Action::Finish {
                self.bd.finalize();
                return (self.executed, self.fallbacks);
            }

            self.cia = self.cia.wrapping_add(4);
        }

        if self.executed > 0 {
            let nia = self.ir_value(self.cia);
            self.cia = self.cia.wrapping_sub(4);
            self.exit_to(nia);
        } else {
            self.bd.ins().return_(&[]);
        }

        self.bd.finalize();
        (self.executed, self.fallbacks)
    }
}
