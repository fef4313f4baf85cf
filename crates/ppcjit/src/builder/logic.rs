use super::BlockBuilder;
use cranelift::{
    codegen::ir,
    prelude::{InstBuilder, IntCC},
};
use espresso::Ins;

enum Rhs {
    RB,
    Imm,
    ShiftedImm,
}

#[derive(Clone, Copy)]
enum BitOp {
    And,
    AndNot,
    Or,
    OrNot,
    Xor,
    Nand,
    Nor,
    Eqv,
}

/// Bitwise operations
impl BlockBuilder<'_> {
    fn bitwise(&mut self, ins: Ins, op: BitOp, rhs: Rhs, record: bool) {
        let rs = self.get(ins.gpr_s());
        let rhs = match rhs {
            Rhs::RB => self.get(ins.gpr_b()),
            Rhs::Imm => self.ir_value(ins.field_uimm() as u32),
            Rhs::ShiftedImm => self.ir_value((ins.field_uimm() as u32) << 16),
        };

        let value = match op {
            BitOp::And => self.bd.ins().band(rs, rhs),
            BitOp::AndNot => self.bd.ins().band_not(rs, rhs),
            BitOp::Or => self.bd.ins().bor(rs, rhs),
            BitOp::OrNot => self.bd.ins().bor_not(rs, rhs),
            BitOp::Xor => self.bd.ins().bxor(rs, rhs),
            BitOp::Nand => {
                let value = self.bd.ins().band(rs, rhs);
                self.bd.ins().bnot(value)
            }
            BitOp::Nor => {
                let value = self.bd.ins().bor(rs, rhs);
                self.bd.ins().bnot(value)
            }
            BitOp::Eqv => {
                let value = self.bd.ins().bxor(rs, rhs);
                self.bd.ins().bnot(value)
            }
        };

        if record {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_a(), value);
    }

    pub fn and(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::And, Rhs::RB, ins.field_rc());
    }

    pub fn andc(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::AndNot, Rhs::RB, ins.field_rc());
    }

    pub fn andi_record(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::And, Rhs::Imm, true);
    }

    pub fn andis_record(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::And, Rhs::ShiftedImm, true);
    }

    pub fn or(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Or, Rhs::RB, ins.field_rc());
    }

    pub fn orc(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::OrNot, Rhs::RB, ins.field_rc());
    }

    pub fn ori(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Or, Rhs::Imm, false);
    }

    pub fn oris(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Or, Rhs::ShiftedImm, false);
    }

    pub fn xor(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Xor, Rhs::RB, ins.field_rc());
    }

    pub fn xori(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Xor, Rhs::Imm, false);
    }

    pub fn xoris(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Xor, Rhs::ShiftedImm, false);
    }

    pub fn nand(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Nand, Rhs::RB, ins.field_rc());
    }

    pub fn nor(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Nor, Rhs::RB, ins.field_rc());
    }

    pub fn eqv(&mut self, ins: Ins) {
        self.bitwise(ins, BitOp::Eqv, Rhs::RB, ins.field_rc());
    }

    fn unary(&mut self, ins: Ins, op: impl FnOnce(&mut Self, ir::Value) -> ir::Value) {
        let rs = self.get(ins.gpr_s());
        let value = op(self, rs);

        if ins.field_rc() {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_a(), value);
    }

    pub fn extsb(&mut self, ins: Ins) {
        self.unary(ins, |this, rs| {
            let byte = this.bd.ins().ireduce(ir::types::I8, rs);
            this.bd.ins().sextend(ir::types::I32, byte)
        });
    }

    pub fn extsh(&mut self, ins: Ins) {
        self.unary(ins, |this, rs| {
            let half = this.bd.ins().ireduce(ir::types::I16, rs);
            this.bd.ins().sextend(ir::types::I32, half)
        });
    }

    pub fn cntlzw(&mut self, ins: Ins) {
        self.unary(ins, |this, rs| this.bd.ins().clz(rs));
    }
}

/// Rotate operations
impl BlockBuilder<'_> {
    fn rotate(&mut self, ins: Ins, amount: ir::Value, insert: bool) {
        let rs = self.get(ins.gpr_s());
        let rotated = self.bd.ins().rotl(rs, amount);
        let mask = self.ir_value(ins.rotate_mask());

        let value = if insert {
            let ra = self.get(ins.gpr_a());
            self.bd.ins().bitselect(mask, rotated, ra)
        } else {
            self.bd.ins().band(rotated, mask)
        };

        if ins.field_rc() {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_a(), value);
    }

    pub fn rlwimi(&mut self, ins: Ins) {
        let amount = self.ir_value(ins.field_sh() as i32);
        self.rotate(ins, amount, true);
    }

    pub fn rlwinm(&mut self, ins: Ins) {
        let amount = self.ir_value(ins.field_sh() as i32);
        self.rotate(ins, amount, false);
    }

    pub fn rlwnm(&mut self, ins: Ins) {
        let rb = self.get(ins.gpr_b());
        let amount = self.bd.ins().band_imm(rb, 0x1F);
        self.rotate(ins, amount, false);
    }
}

/// Shift operations. Shift amounts are 6 bits wide, so shifts are computed in 64 bits to get
/// the right result for amounts of 32 and above.
impl BlockBuilder<'_> {
    fn shift_amount(&mut self, ins: Ins) -> ir::Value {
        let rb = self.get(ins.gpr_b());
        let amount = self.bd.ins().band_imm(rb, 0x3F);
        self.bd.ins().uextend(ir::types::I64, amount)
    }

    fn finish_shift(&mut self, ins: Ins, value: ir::Value) {
        if ins.field_rc() {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_a(), value);
    }

    pub fn slw(&mut self, ins: Ins) {
        let rs = self.get(ins.gpr_s());
        let amount = self.shift_amount(ins);

        let wide = self.bd.ins().uextend(ir::types::I64, rs);
        let shifted = self.bd.ins().ishl(wide, amount);
        let value = self.bd.ins().ireduce(ir::types::I32, shifted);

        self.finish_shift(ins, value);
    }

    pub fn srw(&mut self, ins: Ins) {
        let rs = self.get(ins.gpr_s());
        let amount = self.shift_amount(ins);

        let wide = self.bd.ins().uextend(ir::types::I64, rs);
        let shifted = self.bd.ins().ushr(wide, amount);
        let value = self.bd.ins().ireduce(ir::types::I32, shifted);

        self.finish_shift(ins, value);
    }

    /// Shared by `sraw` and `srawi`. CA is set if the source is negative and any one bits were
    /// shifted out.
    fn shift_right_algebraic(&mut self, ins: Ins, amount: ir::Value) {
        let rs = self.get(ins.gpr_s());

        let wide = self.bd.ins().sextend(ir::types::I64, rs);
        let shifted = self.bd.ins().sshr(wide, amount);
        let value = self.bd.ins().ireduce(ir::types::I32, shifted);

        let one = self.ir_value(1u64);
        let out_mask = self.bd.ins().ishl(one, amount);
        let out_mask = self.bd.ins().iadd_imm(out_mask, -1);
        let out_bits = self.bd.ins().band(wide, out_mask);

        let lost_ones = self.bd.ins().icmp_imm(IntCC::NotEqual, out_bits, 0);
        let negative = self.bd.ins().icmp_imm(IntCC::SignedLessThan, rs, 0);
        let carry = self.bd.ins().band(lost_ones, negative);

        self.update_xer_ca(carry);
        self.finish_shift(ins, value);
    }

    pub fn sraw(&mut self, ins: Ins) {
        let amount = self.shift_amount(ins);
        self.shift_right_algebraic(ins, amount);
    }

    pub fn srawi(&mut self, ins: Ins) {
        let amount = self.ir_value(ins.field_sh() as u64);
        self.shift_right_algebraic(ins, amount);
    }
}
