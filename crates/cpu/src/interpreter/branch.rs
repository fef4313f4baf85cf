//! Branches and condition register logic.
use super::Exec;
use crate::{core::CoreContext, handlers::ExecFn};
use espresso::{Cond, HandlerTable, Ins, InsId, Registers, arch::xer};

/// Evaluates the BO/BI condition of a conditional branch, decrementing CTR if BO asks for it.
#[inline(always)]
fn condition(regs: &mut Registers, ins: Ins, use_ctr: bool) -> bool {
    let bo = ins.field_bo();

    let ctr_ok = if use_ctr && bo & 0b00100 == 0 {
        regs.ctr = regs.ctr.wrapping_sub(1);
        (regs.ctr != 0) ^ (bo & 0b00010 != 0)
    } else {
        true
    };

    let cond_ok = bo & 0b10000 != 0 || regs.cr_bit(ins.field_bi()) == (bo & 0b01000 != 0);
    ctr_ok && cond_ok
}

#[inline(always)]
fn relative(regs: &Registers, ins: Ins, offset: i32) -> u32 {
    if ins.field_aa() {
        offset as u32
    } else {
        regs.cia.wrapping_add_signed(offset)
    }
}

/// Applies a branch to `regs`: links if LK is set and jumps to `target` if `taken`.
#[inline(always)]
fn finish(regs: &mut Registers, ins: Ins, taken: bool, target: u32) {
    if ins.field_lk() {
        regs.lr = regs.cia.wrapping_add(4);
    }

    if taken {
        regs.nia = target;
    }
}

/// Target of `ins` if it is a branch that would be taken with `regs` as they are, without
/// modifying them. CIA is taken from `regs.nia`.
pub fn taken_target(regs: &Registers, ins: Ins) -> Option<u32> {
    let mut regs = regs.clone();
    regs.cia = regs.nia;
    regs.nia = regs.cia.wrapping_add(4);

    let (taken, target) = match ins.id {
        InsId::B => (true, relative(&regs, ins, ins.field_li())),
        InsId::Bc => {
            let taken = condition(&mut regs, ins, true);
            (taken, relative(&regs, ins, ins.field_bd()))
        }
        InsId::Bclr => {
            let target = regs.lr & !3;
            (condition(&mut regs, ins, true), target)
        }
        InsId::Bcctr => (condition(&mut regs, ins, false), regs.ctr & !3),
        _ => return None,
    };

    taken.then_some(target)
}

fn b(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let target = relative(regs, ins, ins.field_li());
    finish(regs, ins, true, target);
    Ok(())
}

fn bc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let taken = condition(regs, ins, true);
    let target = relative(regs, ins, ins.field_bd());
    finish(regs, ins, taken, target);
    Ok(())
}

fn bclr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    // read before LK overwrites it
    let target = regs.lr & !3;
    let taken = condition(regs, ins, true);
    finish(regs, ins, taken, target);
    Ok(())
}

fn bcctr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let target = regs.ctr & !3;
    let taken = condition(regs, ins, false);
    finish(regs, ins, taken, target);
    Ok(())
}

#[inline(always)]
fn cr_logic(ctx: &mut CoreContext<'_>, ins: Ins, op: fn(bool, bool) -> bool) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.cr_bit(ins.field_crba());
    let b = regs.cr_bit(ins.field_crbb());
    regs.set_cr_bit(ins.field_crbd(), op(a, b));
    Ok(())
}

fn crand(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| a & b)
}

fn crandc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| a & !b)
}

fn creqv(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| a == b)
}

fn crnand(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| !(a & b))
}

fn crnor(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| !(a | b))
}

fn cror(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| a | b)
}

fn crorc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| a | !b)
}

fn crxor(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    cr_logic(ctx, ins, |a, b| a ^ b)
}

fn mcrf(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let field = regs.cr_field(ins.field_crfs());
    regs.set_cr_field(ins.field_crfd(), field);
    Ok(())
}

fn mcrxr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    regs.set_cr_field(ins.field_crfd(), Cond::from_bits(regs.xer >> 28));
    regs.xer &= !(xer::SO | xer::OV | xer::CA);
    Ok(())
}

pub(super) fn register(table: &mut HandlerTable<ExecFn>) {
    let handlers: &[(InsId, ExecFn)] = &[
        (InsId::B, b),
        (InsId::Bc, bc),
        (InsId::Bclr, bclr),
        (InsId::Bcctr, bcctr),
        (InsId::Crand, crand),
        (InsId::Crandc, crandc),
        (InsId::Creqv, creqv),
        (InsId::Crnand, crnand),
        (InsId::Crnor, crnor),
        (InsId::Cror, cror),
        (InsId::Crorc, crorc),
        (InsId::Crxor, crxor),
        (InsId::Mcrf, mcrf),
        (InsId::Mcrxr, mcrxr),
    ];

    for &(id, handler) in handlers {
        table.register(id, handler);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn regs_at(nia: u32) -> Registers {
        Registers {
            nia,
            ..Default::default()
        }
    }

    #[test]
    fn unconditional_branches() {
        let regs = regs_at(0x1000);

        // b +0x20
        assert_eq!(taken_target(&regs, Ins::new(0x4800_0020)), Some(0x1020));
        // b -0x10
        assert_eq!(taken_target(&regs, Ins::new(0x4BFF_FFF0)), Some(0x0FF0));
        // ba 0x100
        assert_eq!(taken_target(&regs, Ins::new(0x4800_0102)), Some(0x100));
        // not a branch
        assert_eq!(taken_target(&regs, Ins::new(0x3860_0005)), None);
    }

    #[test]
    fn register_targets_are_aligned() {
        let mut regs = regs_at(0x1000);
        regs.lr = 0x2003;
        regs.ctr = 0x3002;

        // blr
        assert_eq!(taken_target(&regs, Ins::new(0x4E80_0020)), Some(0x2000));
        // bctr
        assert_eq!(taken_target(&regs, Ins::new(0x4E80_0420)), Some(0x3000));
    }

    #[test]
    fn bdnz_decrements_before_testing() {
        // bdnz +0x10
        let ins = Ins::new(0x4200_0010);

        let mut regs = regs_at(0x1000);
        regs.ctr = 2;
        assert_eq!(taken_target(&regs, ins), Some(0x1010));

        regs.ctr = 1;
        assert_eq!(taken_target(&regs, ins), None);

        // the original registers are untouched
        assert_eq!(regs.ctr, 1);
    }

    #[test]
    fn conditional_on_cr_bit() {
        // beq +0x8
        let ins = Ins::new(0x4182_0008);
        let mut regs = regs_at(0x1000);
        assert_eq!(taken_target(&regs, ins), None);

        regs.set_cr_field(0, Cond::new(false, false, true, false));
        assert_eq!(taken_target(&regs, ins), Some(0x1008));
    }
}
