use super::{Action, BlockBuilder};
use cranelift::prelude::InstBuilder;
use espresso::{Ins, Reg};

/// Returns the CR mask selected by the CRM field of `mtcrf`.
fn generate_mask(crm: u8) -> u32 {
    (0..8)
        .filter(|field| crm & (0x80 >> field) != 0)
        .fold(0, |mask, field| mask | (0xF << (28 - 4 * field)))
}

impl BlockBuilder<'_> {
    /// Storage backed SPRs are moved directly, everything else goes through the interpreter.
    pub fn mfspr(&mut self, ins: Ins) -> Action {
        let Some(spr) = ins.spr().filter(|spr| spr.offset().is_some()) else {
            return self.fallback(ins);
        };

        let value = self.get(spr);
        self.set(ins.gpr_d(), value);
        Action::Continue
    }

    pub fn mtspr(&mut self, ins: Ins) -> Action {
        let Some(spr) = ins.spr().filter(|spr| spr.offset().is_some()) else {
            return self.fallback(ins);
        };

        let value = self.get(ins.gpr_s());
        self.set(spr, value);
        Action::Continue
    }

    pub fn mfcr(&mut self, ins: Ins) {
        let cr = self.get(Reg::CR);
        self.set(ins.gpr_d(), cr);
    }

    pub fn mtcrf(&mut self, ins: Ins) {
        let rs = self.get(ins.gpr_s());
        let cr = self.get(Reg::CR);
        let mask = self.ir_value(generate_mask(ins.field_crm()));

        let updated = self.bd.ins().bitselect(mask, rs, cr);
        self.set(Reg::CR, updated);
    }

    pub fn mfmsr(&mut self, ins: Ins) {
        let msr = self.get(Reg::MSR);
        self.set(ins.gpr_d(), msr);
    }

    /// Ends the block so the new machine state is observed.
    pub fn mtmsr(&mut self, ins: Ins) -> Action {
        let rs = self.get(ins.gpr_s());
        self.set(Reg::MSR, rs);

        let nia = self.ir_value(self.cia().wrapping_add(4));
        self.exit_to(nia);
        Action::Finish
    }

    pub fn isync(&mut self, _: Ins) -> Action {
        let nia = self.ir_value(self.cia().wrapping_add(4));
        self.exit_to(nia);
        Action::Finish
    }

    /// Synchronization, cache hints and TLB management. None of these have an observable effect.
    pub fn nop(&mut self, _: Ins) {}
}
