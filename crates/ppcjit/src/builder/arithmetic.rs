use super::BlockBuilder;
use cranelift::{
    codegen::ir,
    prelude::{InstBuilder, IntCC},
};
use espresso::Ins;

enum AddLhs {
    RA,
    ZeroOrRA,
    NotRA,
}

enum AddRhs {
    RB,
    Imm,
    ShiftedImm,
    MinusOne,
    Zero,
}

enum CarryIn {
    Zero,
    One,
    Xer,
}

struct AddOp {
    lhs: AddLhs,
    rhs: AddRhs,
    cin: CarryIn,
    record: bool,
    overflow: bool,
    carry: bool,
}

/// Add operations
impl BlockBuilder<'_> {
    fn addition_get_lhs(&mut self, ins: Ins, lhs: AddLhs) -> ir::Value {
        match lhs {
            AddLhs::RA => self.get(ins.gpr_a()),
            AddLhs::ZeroOrRA => self.gpr_or_zero(ins.gpr_a()),
            AddLhs::NotRA => {
                let ra = self.get(ins.gpr_a());
                self.bd.ins().bnot(ra)
            }
        }
    }

    fn addition_get_rhs(&mut self, ins: Ins, rhs: AddRhs) -> ir::Value {
        match rhs {
            AddRhs::RB => self.get(ins.gpr_b()),
            AddRhs::Imm => self.ir_value(ins.field_simm() as i32),
            AddRhs::ShiftedImm => self.ir_value((ins.field_simm() as i32) << 16),
            AddRhs::MinusOne => self.ir_value(-1i32),
            AddRhs::Zero => self.ir_value(0i32),
        }
    }

    /// Computes `lhs + rhs + cin`, returning the result, the carry out and the signed overflow
    /// flag.
    fn addition_compute(
        &mut self,
        lhs: ir::Value,
        rhs: ir::Value,
        cin: ir::Value,
    ) -> (ir::Value, ir::Value, ir::Value) {
        let (value, cout_a) = self.bd.ins().uadd_overflow(lhs, rhs);
        let (value, cout_b) = self.bd.ins().uadd_overflow(value, cin);
        let cout = self.bd.ins().bor(cout_a, cout_b);

        // overflow iff both operands have the same sign and the result has a different one
        let operands_differ = self.bd.ins().bxor(lhs, rhs);
        let result_differs = self.bd.ins().bxor(lhs, value);
        let operands_same = self.bd.ins().bnot(operands_differ);
        let overflow = self.bd.ins().band(operands_same, result_differs);
        let overflow = self.bd.ins().icmp_imm(IntCC::SignedLessThan, overflow, 0);

        (value, cout, overflow)
    }

    fn addition(&mut self, ins: Ins, op: AddOp) {
        let lhs = self.addition_get_lhs(ins, op.lhs);
        let rhs = self.addition_get_rhs(ins, op.rhs);
        let cin = match op.cin {
            CarryIn::Zero => self.ir_value(0i32),
            CarryIn::One => self.ir_value(1i32),
            CarryIn::Xer => self.xer_ca(),
        };

        let (value, cout, overflowed) = self.addition_compute(lhs, rhs, cin);

        if op.carry {
            self.update_xer_ca(cout);
        }

        if op.overflow {
            self.update_xer_ov(overflowed);
        }

        if op.record {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_d(), value);
    }

    pub fn add(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::RA,
                rhs: AddRhs::RB,
                cin: CarryIn::Zero,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: false,
            },
        );
    }

    pub fn addc(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::RA,
                rhs: AddRhs::RB,
                cin: CarryIn::Zero,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }

    pub fn adde(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::RA,
                rhs: AddRhs::RB,
                cin: CarryIn::Xer,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }

    pub fn addi(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::ZeroOrRA,
                rhs: AddRhs::Imm,
                cin: CarryIn::Zero,
                record: false,
                overflow: false,
                carry: false,
            },
        );
    }

    pub fn addic(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::RA,
                rhs: AddRhs::Imm,
                cin: CarryIn::Zero,
                record: false,
                overflow: false,
                carry: true,
            },
        );
    }

    pub fn addic_record(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::RA,
                rhs: AddRhs::Imm,
                cin: CarryIn::Zero,
                record: true,
                overflow: false,
                carry: true,
            },
        );
    }

    pub fn addis(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::ZeroOrRA,
                rhs: AddRhs::ShiftedImm,
                cin: CarryIn::Zero,
                record: false,
                overflow: false,
                carry: false,
            },
        );
    }

    pub fn addme(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::RA,
                rhs: AddRhs::MinusOne,
                cin: CarryIn::Xer,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }

    pub fn addze(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::RA,
                rhs: AddRhs::Zero,
                cin: CarryIn::Xer,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }
}

/// Subtract operations, computed as `!rA + rhs + cin`.
impl BlockBuilder<'_> {
    pub fn subf(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::NotRA,
                rhs: AddRhs::RB,
                cin: CarryIn::One,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: false,
            },
        );
    }

    pub fn subfc(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::NotRA,
                rhs: AddRhs::RB,
                cin: CarryIn::One,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }

    pub fn subfe(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::NotRA,
                rhs: AddRhs::RB,
                cin: CarryIn::Xer,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }

    pub fn subfic(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::NotRA,
                rhs: AddRhs::Imm,
                cin: CarryIn::One,
                record: false,
                overflow: false,
                carry: true,
            },
        );
    }

    pub fn subfme(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::NotRA,
                rhs: AddRhs::MinusOne,
                cin: CarryIn::Xer,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }

    pub fn subfze(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::NotRA,
                rhs: AddRhs::Zero,
                cin: CarryIn::Xer,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: true,
            },
        );
    }

    pub fn neg(&mut self, ins: Ins) {
        self.addition(
            ins,
            AddOp {
                lhs: AddLhs::NotRA,
                rhs: AddRhs::Zero,
                cin: CarryIn::One,
                record: ins.field_rc(),
                overflow: ins.field_oe(),
                carry: false,
            },
        );
    }
}

/// Multiply operations
impl BlockBuilder<'_> {
    pub fn mulli(&mut self, ins: Ins) {
        let ra = self.get(ins.gpr_a());
        let value = self.bd.ins().imul_imm(ra, ins.field_simm() as i64);
        self.set(ins.gpr_d(), value);
    }

    pub fn mullw(&mut self, ins: Ins) {
        let ra = self.get(ins.gpr_a());
        let rb = self.get(ins.gpr_b());
        let (value, overflowed) = self.bd.ins().smul_overflow(ra, rb);

        if ins.field_oe() {
            self.update_xer_ov(overflowed);
        }

        if ins.field_rc() {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_d(), value);
    }

    pub fn mulhw(&mut self, ins: Ins) {
        let ra = self.get(ins.gpr_a());
        let rb = self.get(ins.gpr_b());
        let value = self.bd.ins().smulhi(ra, rb);

        if ins.field_rc() {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_d(), value);
    }

    pub fn mulhwu(&mut self, ins: Ins) {
        let ra = self.get(ins.gpr_a());
        let rb = self.get(ins.gpr_b());
        let value = self.bd.ins().umulhi(ra, rb);

        if ins.field_rc() {
            self.update_cr0_cmpz(value);
        }

        self.set(ins.gpr_d(), value);
    }
}
