use super::BlockBuilder;
use cranelift::{
    codegen::ir,
    prelude::{FunctionBuilder, InstBuilder, IntCC},
};
use espresso::{GPR, Reg, SPR, arch::xer};

/// Trait for transforming values into an IR value in a function.
pub trait IntoIrValue {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value;
}

impl IntoIrValue for ir::Value {
    fn into_value(self, _: &mut FunctionBuilder<'_>) -> ir::Value {
        self
    }
}

impl IntoIrValue for bool {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I8, self as i64)
    }
}

impl IntoIrValue for u8 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I8, self as u64 as i64)
    }
}

impl IntoIrValue for i32 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        // immediates of narrow types must be zero extended
        bd.ins().iconst(ir::types::I32, self as u32 as i64)
    }
}

impl IntoIrValue for u32 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I32, self as u64 as i64)
    }
}

impl IntoIrValue for u64 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I64, self as i64)
    }
}

impl IntoIrValue for f64 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().f64const(self)
    }
}

impl BlockBuilder<'_> {
    /// Creates an IR value from the given `value`.
    pub fn ir_value(&mut self, value: impl IntoIrValue) -> ir::Value {
        value.into_value(&mut self.bd)
    }

    /// Value of rA, or zero if rA is r0.
    pub fn gpr_or_zero(&mut self, gpr: GPR) -> ir::Value {
        if gpr == GPR::R0 {
            self.ir_value(0i32)
        } else {
            self.get(gpr)
        }
    }

    /// Gets bit `index` (counting from the LSB) in the `value` (must be an I32) as an I8.
    pub fn get_bit(&mut self, value: ir::Value, index: u32) -> ir::Value {
        let bit = self.bd.ins().ushr_imm(value, index as i64);
        let bit = self.bd.ins().band_imm(bit, 1);

        self.bd.ins().ireduce(ir::types::I8, bit)
    }

    /// Sets bit `index` (counting from the LSB) to `set` in the `value` (must be an I32).
    pub fn set_bit(&mut self, value: ir::Value, index: u32, set: impl IntoIrValue) -> ir::Value {
        let set = self.ir_value(set);
        let set = self.bd.ins().uextend(ir::types::I32, set);
        let shifted = self.bd.ins().ishl_imm(set, index as i64);

        let cleared = self.bd.ins().band_imm(value, !(1u32 << index) as i64);
        self.bd.ins().bor(cleared, shifted)
    }

    /// XER[CA] as an I32 that is either 0 or 1.
    pub fn xer_ca(&mut self) -> ir::Value {
        let xer = self.get(SPR::XER);
        let ca = self.bd.ins().ushr_imm(xer, xer::CA_BIT as i64);
        self.bd.ins().band_imm(ca, 1)
    }

    /// Updates OV and SO in XER. `overflowed` must be a boolean (I8).
    pub fn update_xer_ov(&mut self, overflowed: impl IntoIrValue) {
        let xer = self.get(SPR::XER);
        let overflowed = self.ir_value(overflowed);
        let overflowed = self.bd.ins().uextend(ir::types::I32, overflowed);

        let ov = self.bd.ins().ishl_imm(overflowed, xer::OV_BIT as i64);
        let so = self.bd.ins().ishl_imm(overflowed, xer::SO_BIT as i64);
        let value = self.bd.ins().bor(ov, so);

        let masked = self.bd.ins().band_imm(xer, !xer::OV as i64);
        let updated = self.bd.ins().bor(masked, value);

        self.set(SPR::XER, updated);
    }

    /// Updates CA in XER. `carry` must be a boolean (I8).
    pub fn update_xer_ca(&mut self, carry: impl IntoIrValue) {
        let xer = self.get(SPR::XER);
        let updated = self.set_bit(xer, xer::CA_BIT, carry);

        self.set(SPR::XER, updated);
    }

    /// Replaces CR field `index` with the low 4 bits of `bits` (an I32).
    pub fn set_cr_field(&mut self, index: u8, bits: ir::Value) {
        let cr = self.get(Reg::CR);

        let base = 4 * (7 - index as i64);
        let bits = self.bd.ins().band_imm(bits, 0b1111);
        let bits = self.bd.ins().ishl_imm(bits, base);

        let mask = self.ir_value(0b1111u32 << base);
        let updated = self.bd.ins().bitselect(mask, bits, cr);

        self.set(Reg::CR, updated);
    }

    /// All IR values must be booleans (i.e. I8).
    pub fn update_cr(
        &mut self,
        index: u8,
        lt: ir::Value,
        gt: ir::Value,
        eq: ir::Value,
        so: ir::Value,
    ) {
        let lt = self.bd.ins().uextend(ir::types::I32, lt);
        let gt = self.bd.ins().uextend(ir::types::I32, gt);
        let eq = self.bd.ins().uextend(ir::types::I32, eq);
        let so = self.bd.ins().uextend(ir::types::I32, so);

        let lt = self.bd.ins().ishl_imm(lt, 3);
        let gt = self.bd.ins().ishl_imm(gt, 2);
        let eq = self.bd.ins().ishl_imm(eq, 1);

        let value = self.bd.ins().bor(lt, gt);
        let value = self.bd.ins().bor(value, eq);
        let value = self.bd.ins().bor(value, so);

        self.set_cr_field(index, value);
    }

    /// Updates CR0 by signed comparison of the given value with 0 and by copying XER[SO]. Value
    /// must be an I32.
    pub fn update_cr0_cmpz(&mut self, value: ir::Value) {
        let lt = self.bd.ins().icmp_imm(IntCC::SignedLessThan, value, 0);
        let gt = self.bd.ins().icmp_imm(IntCC::SignedGreaterThan, value, 0);
        let eq = self.bd.ins().icmp_imm(IntCC::Equal, value, 0);

        let xer = self.get(SPR::XER);
        let so = self.get_bit(xer, xer::SO_BIT);

        self.update_cr(0, lt, gt, eq, so);
    }

    /// Copies FPSCR[FX, FEX, VX, OX] into CR1.
    pub fn update_cr1(&mut self) {
        let fpscr = self.get(Reg::FPSCR);
        let bits = self.bd.ins().ushr_imm(fpscr, 28);
        self.set_cr_field(1, bits);
    }
}
