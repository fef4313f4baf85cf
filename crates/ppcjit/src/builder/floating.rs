use super::BlockBuilder;
use cranelift::{
    codegen::ir,
    prelude::{FloatCC, InstBuilder, isa},
};
use espresso::{Ins, Reg, arch::fpscr};

extern "sysv64" fn multiply_single(a: f64, c: f64) -> f64 {
    espresso::float::multiply_single(a, c)
}

#[derive(Clone, Copy)]
enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Helpers
impl BlockBuilder<'_> {
    /// Rounds an F64 to single precision, under the host rounding mode.
    pub fn round_to_single(&mut self, value: ir::Value) -> ir::Value {
        let single = self.bd.ins().fdemote(ir::types::F32, value);
        self.bd.ins().fpromote(ir::types::F64, single)
    }

    /// `a * c` as computed by a single precision multiply, before the product is rounded. The
    /// narrowing of `c` is done by the same routine the interpreter uses.
    pub fn multiply_single(&mut self, a: ir::Value, c: ir::Value) -> ir::Value {
        let sig = match self.consts.multiply_sig {
            Some(sig) => sig,
            None => {
                let sig = self.bd.import_signature(ir::Signature {
                    params: vec![
                        ir::AbiParam::new(ir::types::F64), // a
                        ir::AbiParam::new(ir::types::F64), // c
                    ],
                    returns: vec![ir::AbiParam::new(ir::types::F64)],
                    call_conv: isa::CallConv::SystemV,
                });

                self.consts.multiply_sig = Some(sig);
                sig
            }
        };

        let func = self
            .bd
            .ins()
            .iconst(self.consts.ptr_type, multiply_single as usize as i64);
        let inst = self.bd.ins().call_indirect(sig, func, &[a, c]);
        self.bd.inst_results(inst)[0]
    }

    fn float_finish(&mut self, ins: Ins, value: ir::Value, single: bool) {
        self.set(Reg::PS0(ins.fpr_d()), value);
        if single {
            self.set(Reg::PS1(ins.fpr_d()), value);
        }

        if ins.field_rc() {
            self.update_cr1();
        }
    }

    fn float_arith(&mut self, ins: Ins, op: FloatOp, single: bool) {
        let fra = self.get(Reg::PS0(ins.fpr_a()));
        let value = match op {
            FloatOp::Add => {
                let frb = self.get(Reg::PS0(ins.fpr_b()));
                self.bd.ins().fadd(fra, frb)
            }
            FloatOp::Sub => {
                let frb = self.get(Reg::PS0(ins.fpr_b()));
                self.bd.ins().fsub(fra, frb)
            }
            FloatOp::Mul => {
                let frc = self.get(Reg::PS0(ins.fpr_c()));
                if single {
                    self.multiply_single(fra, frc)
                } else {
                    self.bd.ins().fmul(fra, frc)
                }
            }
            FloatOp::Div => {
                let frb = self.get(Reg::PS0(ins.fpr_b()));
                self.bd.ins().fdiv(fra, frb)
            }
        };

        let value = if single {
            self.round_to_single(value)
        } else {
            value
        };

        self.float_finish(ins, value, single);
    }
}

/// Arithmetic
impl BlockBuilder<'_> {
    pub fn fadd(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Add, false);
    }

    pub fn fadds(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Add, true);
    }

    pub fn fsub(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Sub, false);
    }

    pub fn fsubs(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Sub, true);
    }

    pub fn fmul(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Mul, false);
    }

    pub fn fmuls(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Mul, true);
    }

    pub fn fdiv(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Div, false);
    }

    pub fn fdivs(&mut self, ins: Ins) {
        self.float_arith(ins, FloatOp::Div, true);
    }

    pub fn frsp(&mut self, ins: Ins) {
        let frb = self.get(Reg::PS0(ins.fpr_b()));
        let value = self.round_to_single(frb);
        self.float_finish(ins, value, true);
    }
}

/// Moves. These only touch the sign bit of ps0.
impl BlockBuilder<'_> {
    fn float_move(&mut self, ins: Ins, op: impl FnOnce(&mut Self, ir::Value) -> ir::Value) {
        let frb = self.get(Reg::PS0(ins.fpr_b()));
        let value = op(self, frb);
        self.float_finish(ins, value, false);
    }

    pub fn fmr(&mut self, ins: Ins) {
        self.float_move(ins, |_, frb| frb);
    }

    pub fn fneg(&mut self, ins: Ins) {
        self.float_move(ins, |this, frb| this.bd.ins().fneg(frb));
    }

    pub fn fabs(&mut self, ins: Ins) {
        self.float_move(ins, |this, frb| this.bd.ins().fabs(frb));
    }

    pub fn fnabs(&mut self, ins: Ins) {
        self.float_move(ins, |this, frb| {
            let abs = this.bd.ins().fabs(frb);
            this.bd.ins().fneg(abs)
        });
    }
}

/// Comparisons
impl BlockBuilder<'_> {
    /// Shared by `fcmpu` and `fcmpo`. Invalid operation flags are not tracked, so both behave
    /// the same.
    fn float_compare(&mut self, ins: Ins) {
        let fra = self.get(Reg::PS0(ins.fpr_a()));
        let frb = self.get(Reg::PS0(ins.fpr_b()));

        let lt = self.bd.ins().fcmp(FloatCC::LessThan, fra, frb);
        let gt = self.bd.ins().fcmp(FloatCC::GreaterThan, fra, frb);
        let eq = self.bd.ins().fcmp(FloatCC::Equal, fra, frb);
        let un = self.bd.ins().fcmp(FloatCC::Unordered, fra, frb);

        self.update_cr(ins.field_crfd(), lt, gt, eq, un);

        // mirror the result into FPSCR[FPCC]
        let cr = self.get(Reg::CR);
        let field = self
            .bd
            .ins()
            .ushr_imm(cr, 4 * (7 - ins.field_crfd() as i64));
        let field = self.bd.ins().band_imm(field, 0xF);
        let fpcc = self
            .bd
            .ins()
            .ishl_imm(field, fpscr::FPCC_SHIFT as i64);

        let fpscr = self.get(Reg::FPSCR);
        let cleared = self.bd.ins().band_imm(fpscr, !fpscr::FPCC as i64);
        let updated = self.bd.ins().bor(cleared, fpcc);
        self.set(Reg::FPSCR, updated);
    }

    pub fn fcmpu(&mut self, ins: Ins) {
        self.float_compare(ins);
    }

    pub fn fcmpo(&mut self, ins: Ins) {
        self.float_compare(ins);
    }
}
