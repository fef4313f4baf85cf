use super::BlockBuilder;
use crate::block::Hooks;
use cranelift::{codegen::ir, prelude::InstBuilder};
use espresso::{Ins, Reg};
use std::mem::offset_of;

/// A type that can be read from or written to guest memory through the hooks.
pub trait ReadWriteAble {
    const IR_TYPE: ir::Type;
    const READ_HOOK: usize;
    const WRITE_HOOK: usize;
}

impl ReadWriteAble for u8 {
    const IR_TYPE: ir::Type = ir::types::I8;
    const READ_HOOK: usize = offset_of!(Hooks, read_u8);
    const WRITE_HOOK: usize = offset_of!(Hooks, write_u8);
}

impl ReadWriteAble for u16 {
    const IR_TYPE: ir::Type = ir::types::I16;
    const READ_HOOK: usize = offset_of!(Hooks, read_u16);
    const WRITE_HOOK: usize = offset_of!(Hooks, write_u16);
}

impl ReadWriteAble for u32 {
    const IR_TYPE: ir::Type = ir::types::I32;
    const READ_HOOK: usize = offset_of!(Hooks, read_u32);
    const WRITE_HOOK: usize = offset_of!(Hooks, write_u32);
}

impl ReadWriteAble for u64 {
    const IR_TYPE: ir::Type = ir::types::I64;
    const READ_HOOK: usize = offset_of!(Hooks, read_u64);
    const WRITE_HOOK: usize = offset_of!(Hooks, write_u64);
}

/// Helpers
impl BlockBuilder<'_> {
    /// Reads a `P` from `addr`, exiting the block with a fault if the read fails.
    pub fn mem_read<P: ReadWriteAble>(&mut self, addr: ir::Value) -> ir::Value {
        let slot_addr = self
            .bd
            .ins()
            .stack_addr(self.consts.ptr_type, self.consts.read_slot, 0);

        let inst = self.call_hook(
            P::READ_HOOK,
            Hooks::read_sig,
            &[self.consts.ctx_ptr, addr, slot_addr],
        );

        let success = self.bd.inst_results(inst)[0];
        self.exit_unless(success, true);

        self.bd
            .ins()
            .stack_load(P::IR_TYPE, self.consts.read_slot, 0)
    }

    /// Writes `value` (a `P`) to `addr`, exiting the block with a fault if the write fails.
    pub fn mem_write<P: ReadWriteAble>(&mut self, addr: ir::Value, value: ir::Value) {
        let inst = self.call_hook(
            P::WRITE_HOOK,
            |ptr| Hooks::write_sig(ptr, P::IR_TYPE),
            &[self.consts.ctx_ptr, addr, value],
        );

        let success = self.bd.inst_results(inst)[0];
        self.exit_unless(success, true);
    }
}

#[derive(Clone, Copy)]
enum Addressing {
    /// `(rA|0) + d`
    Imm,
    /// `rA + d`, rA updated
    ImmUpdate,
    /// `(rA|0) + rB`
    Indexed,
    /// `rA + rB`, rA updated
    IndexedUpdate,
}

impl Addressing {
    fn updates(self) -> bool {
        matches!(self, Self::ImmUpdate | Self::IndexedUpdate)
    }
}

#[derive(Clone, Copy)]
enum Extend {
    Zero,
    Sign,
    /// Zero extended, byte reversed.
    Reverse,
}

impl BlockBuilder<'_> {
    fn effective_address(&mut self, ins: Ins, mode: Addressing) -> ir::Value {
        let base = if mode.updates() {
            self.get(ins.gpr_a())
        } else {
            self.gpr_or_zero(ins.gpr_a())
        };

        match mode {
            Addressing::Imm | Addressing::ImmUpdate => {
                self.bd.ins().iadd_imm(base, ins.field_d() as i64)
            }
            Addressing::Indexed | Addressing::IndexedUpdate => {
                let rb = self.get(ins.gpr_b());
                self.bd.ins().iadd(base, rb)
            }
        }
    }

    fn commit_update(&mut self, ins: Ins, mode: Addressing, ea: ir::Value) {
        if mode.updates() {
            self.set(ins.gpr_a(), ea);
        }
    }

    fn load<P: ReadWriteAble>(&mut self, ins: Ins, mode: Addressing, extend: Extend) {
        let ea = self.effective_address(ins, mode);
        let value = self.mem_read::<P>(ea);

        let value = match extend {
            Extend::Zero if P::IR_TYPE == ir::types::I32 => value,
            Extend::Zero => self.bd.ins().uextend(ir::types::I32, value),
            Extend::Sign => self.bd.ins().sextend(ir::types::I32, value),
            Extend::Reverse => {
                let swapped = self.bd.ins().bswap(value);
                if P::IR_TYPE == ir::types::I32 {
                    swapped
                } else {
                    self.bd.ins().uextend(ir::types::I32, swapped)
                }
            }
        };

        self.commit_update(ins, mode, ea);
        self.set(ins.gpr_d(), value);
    }

    fn store<P: ReadWriteAble>(&mut self, ins: Ins, mode: Addressing, reverse: bool) {
        let ea = self.effective_address(ins, mode);
        let rs = self.get(ins.gpr_s());

        let value = if P::IR_TYPE == ir::types::I32 {
            rs
        } else {
            self.bd.ins().ireduce(P::IR_TYPE, rs)
        };

        let value = if reverse {
            self.bd.ins().bswap(value)
        } else {
            value
        };

        self.mem_write::<P>(ea, value);
        self.commit_update(ins, mode, ea);
    }

    fn load_double(&mut self, ins: Ins, mode: Addressing) {
        let ea = self.effective_address(ins, mode);
        let value = self.mem_read::<u64>(ea);
        let value = self
            .bd
            .ins()
            .bitcast(ir::types::F64, ir::MemFlags::new(), value);

        self.commit_update(ins, mode, ea);
        self.set(Reg::PS0(ins.fpr_d()), value);
    }

    fn store_double(&mut self, ins: Ins, mode: Addressing) {
        let ea = self.effective_address(ins, mode);
        let value = self.get(Reg::PS0(ins.fpr_s()));
        let value = self
            .bd
            .ins()
            .bitcast(ir::types::I64, ir::MemFlags::new(), value);

        self.mem_write::<u64>(ea, value);
        self.commit_update(ins, mode, ea);
    }
}

/// Integer loads
impl BlockBuilder<'_> {
    pub fn lbz(&mut self, ins: Ins) {
        self.load::<u8>(ins, Addressing::Imm, Extend::Zero);
    }

    pub fn lbzu(&mut self, ins: Ins) {
        self.load::<u8>(ins, Addressing::ImmUpdate, Extend::Zero);
    }

    pub fn lbzx(&mut self, ins: Ins) {
        self.load::<u8>(ins, Addressing::Indexed, Extend::Zero);
    }

    pub fn lbzux(&mut self, ins: Ins) {
        self.load::<u8>(ins, Addressing::IndexedUpdate, Extend::Zero);
    }

    pub fn lhz(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::Imm, Extend::Zero);
    }

    pub fn lhzu(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::ImmUpdate, Extend::Zero);
    }

    pub fn lhzx(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::Indexed, Extend::Zero);
    }

    pub fn lhzux(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::IndexedUpdate, Extend::Zero);
    }

    pub fn lha(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::Imm, Extend::Sign);
    }

    pub fn lhau(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::ImmUpdate, Extend::Sign);
    }

    pub fn lhax(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::Indexed, Extend::Sign);
    }

    pub fn lhaux(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::IndexedUpdate, Extend::Sign);
    }

    pub fn lwz(&mut self, ins: Ins) {
        self.load::<u32>(ins, Addressing::Imm, Extend::Zero);
    }

    pub fn lwzu(&mut self, ins: Ins) {
        self.load::<u32>(ins, Addressing::ImmUpdate, Extend::Zero);
    }

    pub fn lwzx(&mut self, ins: Ins) {
        self.load::<u32>(ins, Addressing::Indexed, Extend::Zero);
    }

    pub fn lwzux(&mut self, ins: Ins) {
        self.load::<u32>(ins, Addressing::IndexedUpdate, Extend::Zero);
    }

    pub fn lhbrx(&mut self, ins: Ins) {
        self.load::<u16>(ins, Addressing::Indexed, Extend::Reverse);
    }

    pub fn lwbrx(&mut self, ins: Ins) {
        self.load::<u32>(ins, Addressing::Indexed, Extend::Reverse);
    }
}

/// Integer stores
impl BlockBuilder<'_> {
    pub fn stb(&mut self, ins: Ins) {
        self.store::<u8>(ins, Addressing::Imm, false);
    }

    pub fn stbu(&mut self, ins: Ins) {
        self.store::<u8>(ins, Addressing::ImmUpdate, false);
    }

    pub fn stbx(&mut self, ins: Ins) {
        self.store::<u8>(ins, Addressing::Indexed, false);
    }

    pub fn stbux(&mut self, ins: Ins) {
        self.store::<u8>(ins, Addressing::IndexedUpdate, false);
    }

    pub fn sth(&mut self, ins: Ins) {
        self.store::<u16>(ins, Addressing::Imm, false);
    }

    pub fn sthu(&mut self, ins: Ins) {
        self.store::<u16>(ins, Addressing::ImmUpdate, false);
    }

    pub fn sthx(&mut self, ins: Ins) {
        self.store::<u16>(ins, Addressing::Indexed, false);
    }

    pub fn sthux(&mut self, ins: Ins) {
        self.store::<u16>(ins, Addressing::IndexedUpdate, false);
    }

    pub fn stw(&mut self, ins: Ins) {
        self.store::<u32>(ins, Addressing::Imm, false);
    }

    pub fn stwu(&mut self, ins: Ins) {
        self.store::<u32>(ins, Addressing::ImmUpdate, false);
    }

    pub fn stwx(&mut self, ins: Ins) {
        self.store::<u32>(ins, Addressing::Indexed, false);
    }

    pub fn stwux(&mut self, ins: Ins) {
        self.store::<u32>(ins, Addressing::IndexedUpdate, false);
    }

    pub fn sthbrx(&mut self, ins: Ins) {
        self.store::<u16>(ins, Addressing::Indexed, true);
    }

    pub fn stwbrx(&mut self, ins: Ins) {
        self.store::<u32>(ins, Addressing::Indexed, true);
    }
}

/// Double precision loads and stores
impl BlockBuilder<'_> {
    pub fn lfd(&mut self, ins: Ins) {
        self.load_double(ins, Addressing::Imm);
    }

    pub fn lfdu(&mut self, ins: Ins) {
        self.load_double(ins, Addressing::ImmUpdate);
    }

    pub fn lfdx(&mut self, ins: Ins) {
        self.load_double(ins, Addressing::Indexed);
    }

    pub fn lfdux(&mut self, ins: Ins) {
        self.load_double(ins, Addressing::IndexedUpdate);
    }

    pub fn stfd(&mut self, ins: Ins) {
        self.store_double(ins, Addressing::Imm);
    }

    pub fn stfdu(&mut self, ins: Ins) {
        self.store_double(ins, Addressing::ImmUpdate);
    }

    pub fn stfdx(&mut self, ins: Ins) {
        self.store_double(ins, Addressing::Indexed);
    }

    pub fn stfdux(&mut self, ins: Ins) {
        self.store_double(ins, Addressing::IndexedUpdate);
    }

    pub fn stfiwx(&mut self, ins: Ins) {
        let ea = self.effective_address(ins, Addressing::Indexed);
        let value = self.get(Reg::PS0(ins.fpr_s()));
        let value = self
            .bd
            .ins()
            .bitcast(ir::types::I64, ir::MemFlags::new(), value);
        let value = self.bd.ins().ireduce(ir::types::I32, value);

        self.mem_write::<u32>(ea, value);
    }
}
