use super::{Action, BlockBuilder};
use cranelift::{
    codegen::ir,
    prelude::{InstBuilder, IntCC},
};
use espresso::{Ins, Reg, SPR};

/// The BO field of conditional branches.
#[derive(Debug, Clone, Copy)]
struct BranchOptions(u8);

impl BranchOptions {
    /// Whether the branch should be taken if CTR is zero after decrementing.
    fn ctr_eq_zero(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    fn ignore_ctr(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    fn desired_cr(self) -> bool {
        self.0 & (1 << 3) != 0
    }

    fn ignore_cr(self) -> bool {
        self.0 & (1 << 4) != 0
    }
}

enum Target {
    Relative(i32),
    Absolute(u32),
    Register(ir::Value),
}

impl BlockBuilder<'_> {
    fn branch_target(&mut self, target: Target) -> ir::Value {
        match target {
            Target::Relative(offset) => self.ir_value(self.cia().wrapping_add_signed(offset)),
            Target::Absolute(addr) => self.ir_value(addr),
            Target::Register(value) => self.bd.ins().band_imm(value, !0b11),
        }
    }

    /// Evaluates the branch condition given by BO and BI, decrementing CTR if required. Returns
    /// `None` if the branch is unconditional.
    fn branch_condition(&mut self, ins: Ins, decrement: bool) -> Option<ir::Value> {
        let options = BranchOptions(ins.field_bo());
        let mut condition = None;

        if decrement && !options.ignore_ctr() {
            let ctr = self.get(SPR::CTR);
            let ctr = self.bd.ins().iadd_imm(ctr, -1);
            self.set(SPR::CTR, ctr);

            let cc = if options.ctr_eq_zero() {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };

            condition = Some(self.bd.ins().icmp_imm(cc, ctr, 0));
        }

        if !options.ignore_cr() {
            let cr = self.get(Reg::CR);
            let bit = self.get_bit(cr, 31 - ins.field_bi() as u32);
            let cr_ok = if options.desired_cr() {
                bit
            } else {
                self.bd.ins().bxor_imm(bit, 1)
            };

            condition = Some(match condition {
                Some(ctr_ok) => self.bd.ins().band(ctr_ok, cr_ok),
                None => cr_ok,
            });
        }

        condition
    }

    fn branch(&mut self, ins: Ins, target: Target, condition: Option<ir::Value>) -> Action {
        let target = self.branch_target(target);
        let next = self.ir_value(self.cia().wrapping_add(4));

        if ins.field_lk() {
            self.set(SPR::LR, next);
        }

        let nia = match condition {
            Some(taken) => self.bd.ins().select(taken, target, next),
            None => target,
        };

        self.exit_to(nia);
        Action::Finish
    }

    pub fn b(&mut self, ins: Ins) -> Action {
        let target = if ins.field_aa() {
            Target::Absolute(ins.field_li() as u32)
        } else {
            Target::Relative(ins.field_li())
        };

        self.branch(ins, target, None)
    }

    pub fn bc(&mut self, ins: Ins) -> Action {
        let target = if ins.field_aa() {
            Target::Absolute(ins.field_bd() as u32)
        } else {
            Target::Relative(ins.field_bd())
        };

        let condition = self.branch_condition(ins, true);
        self.branch(ins, target, condition)
    }

    pub fn bclr(&mut self, ins: Ins) -> Action {
        // read LR before the link overwrites it
        let lr = self.get(SPR::LR);
        let condition = self.branch_condition(ins, true);
        self.branch(ins, Target::Register(lr), condition)
    }

    pub fn bcctr(&mut self, ins: Ins) -> Action {
        let ctr = self.get(SPR::CTR);
        let condition = self.branch_condition(ins, false);
        self.branch(ins, Target::Register(ctr), condition)
    }
}
