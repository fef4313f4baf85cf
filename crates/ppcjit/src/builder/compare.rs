use super::BlockBuilder;
use cranelift::{
    codegen::ir,
    prelude::{InstBuilder, IntCC},
};
use espresso::{Ins, Reg, SPR, arch::xer};

/// Integer comparisons
impl BlockBuilder<'_> {
    fn compare(&mut self, ins: Ins, rhs: ir::Value, signed: bool) {
        let ra = self.get(ins.gpr_a());

        let (lt, gt) = if signed {
            (IntCC::SignedLessThan, IntCC::SignedGreaterThan)
        } else {
            (IntCC::UnsignedLessThan, IntCC::UnsignedGreaterThan)
        };

        let lt = self.bd.ins().icmp(lt, ra, rhs);
        let gt = self.bd.ins().icmp(gt, ra, rhs);
        let eq = self.bd.ins().icmp(IntCC::Equal, ra, rhs);

        let xer = self.get(SPR::XER);
        let so = self.get_bit(xer, xer::SO_BIT);

        self.update_cr(ins.field_crfd(), lt, gt, eq, so);
    }

    pub fn cmp(&mut self, ins: Ins) {
        let rb = self.get(ins.gpr_b());
        self.compare(ins, rb, true);
    }

    pub fn cmpi(&mut self, ins: Ins) {
        let imm = self.ir_value(ins.field_simm() as i32);
        self.compare(ins, imm, true);
    }

    pub fn cmpl(&mut self, ins: Ins) {
        let rb = self.get(ins.gpr_b());
        self.compare(ins, rb, false);
    }

    pub fn cmpli(&mut self, ins: Ins) {
        let imm = self.ir_value(ins.field_uimm() as u32);
        self.compare(ins, imm, false);
    }
}

#[derive(Clone, Copy)]
enum CrOp {
    And,
    AndNot,
    Eqv,
    Nand,
    Nor,
    Or,
    OrNot,
    Xor,
}

/// Condition register operations
impl BlockBuilder<'_> {
    fn cr_logical(&mut self, ins: Ins, op: CrOp) {
        let cr = self.get(Reg::CR);
        let a = self.get_bit(cr, 31 - ins.field_crba() as u32);
        let b = self.get_bit(cr, 31 - ins.field_crbb() as u32);

        let value = match op {
            CrOp::And => self.bd.ins().band(a, b),
            CrOp::AndNot => self.bd.ins().band_not(a, b),
            CrOp::Eqv => self.bd.ins().bxor_not(a, b),
            CrOp::Nand => {
                let value = self.bd.ins().band(a, b);
                self.bd.ins().bnot(value)
            }
            CrOp::Nor => {
                let value = self.bd.ins().bor(a, b);
                self.bd.ins().bnot(value)
            }
            CrOp::Or => self.bd.ins().bor(a, b),
            CrOp::OrNot => self.bd.ins().bor_not(a, b),
            CrOp::Xor => self.bd.ins().bxor(a, b),
        };
        let value = self.bd.ins().band_imm(value, 1);

        let updated = self.set_bit(cr, 31 - ins.field_crbd() as u32, value);
        self.set(Reg::CR, updated);
    }

    pub fn crand(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::And);
    }

    pub fn crandc(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::AndNot);
    }

    pub fn creqv(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::Eqv);
    }

    pub fn crnand(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::Nand);
    }

    pub fn crnor(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::Nor);
    }

    pub fn cror(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::Or);
    }

    pub fn crorc(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::OrNot);
    }

    pub fn crxor(&mut self, ins: Ins) {
        self.cr_logical(ins, CrOp::Xor);
    }

    pub fn mcrf(&mut self, ins: Ins) {
        let cr = self.get(Reg::CR);
        let field = self
            .bd
            .ins()
            .ushr_imm(cr, 4 * (7 - ins.field_crfs() as i64));
        self.set_cr_field(ins.field_crfd(), field);
    }

    pub fn mcrxr(&mut self, ins: Ins) {
        let xer = self.get(SPR::XER);
        let field = self.bd.ins().ushr_imm(xer, 28);
        self.set_cr_field(ins.field_crfd(), field);

        let cleared = self.bd.ins().band_imm(xer, 0x0FFF_FFFF);
        self.set(SPR::XER, cleared);
    }
}
