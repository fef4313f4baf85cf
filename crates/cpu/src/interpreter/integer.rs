//! Integer arithmetic, logic, rotate, shift and compare instructions.
use super::Exec;
use crate::{core::CoreContext, handlers::ExecFn};
use espresso::{Cond, HandlerTable, Ins, InsId, Registers};

/// Result of `a + b + carry_in` with the carry out and signed overflow.
#[inline(always)]
fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let (partial, carry_a) = a.overflowing_add(b);
    let (value, carry_b) = partial.overflowing_add(carry_in as u32);
    let overflow = (!(a ^ b) & (a ^ value)) >> 31 != 0;

    (value, carry_a || carry_b, overflow)
}

#[derive(Clone, Copy)]
struct AddFlags {
    /// Whether XER[CA] is written.
    carry: bool,
    /// Whether XER[OV] is written.
    overflow: bool,
    /// Whether CR0 is written.
    record: bool,
}

impl AddFlags {
    /// Flags of XO-form instructions, taken from the OE and Rc bits.
    fn xo(ins: Ins, carry: bool) -> Self {
        Self {
            carry,
            overflow: ins.field_oe(),
            record: ins.field_rc(),
        }
    }

    const NONE: Self = Self {
        carry: false,
        overflow: false,
        record: false,
    };
}

#[inline(always)]
fn add_generic(regs: &mut Registers, ins: Ins, a: u32, b: u32, carry_in: bool, flags: AddFlags) {
    let (value, carry, overflow) = add_with_carry(a, b, carry_in);
    regs.gpr[ins.field_rd() as usize] = value;

    if flags.carry {
        regs.set_xer_ca(carry);
    }

    if flags.overflow {
        regs.set_xer_ov(overflow);
    }

    if flags.record {
        regs.update_cr0(value);
    }
}

fn add(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let (a, b) = (regs.gpr[ins.field_ra() as usize], regs.gpr[ins.field_rb() as usize]);
    add_generic(regs, ins, a, b, false, AddFlags::xo(ins, false));
    Ok(())
}

fn addc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let (a, b) = (regs.gpr[ins.field_ra() as usize], regs.gpr[ins.field_rb() as usize]);
    add_generic(regs, ins, a, b, false, AddFlags::xo(ins, true));
    Ok(())
}

fn adde(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let (a, b) = (regs.gpr[ins.field_ra() as usize], regs.gpr[ins.field_rb() as usize]);
    let ca = regs.xer_ca();
    add_generic(regs, ins, a, b, ca, AddFlags::xo(ins, true));
    Ok(())
}

fn addme(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let ca = regs.xer_ca();
    add_generic(regs, ins, a, u32::MAX, ca, AddFlags::xo(ins, true));
    Ok(())
}

fn addze(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let ca = regs.xer_ca();
    add_generic(regs, ins, a, 0, ca, AddFlags::xo(ins, true));
    Ok(())
}

fn addi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr_or_zero(ins.gpr_a());
    add_generic(regs, ins, a, ins.field_simm() as i32 as u32, false, AddFlags::NONE);
    Ok(())
}

fn addis(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr_or_zero(ins.gpr_a());
    let b = (ins.field_simm() as i32 as u32) << 16;
    add_generic(regs, ins, a, b, false, AddFlags::NONE);
    Ok(())
}

fn addic_generic(ctx: &mut CoreContext<'_>, ins: Ins, record: bool) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let flags = AddFlags {
        carry: true,
        overflow: false,
        record,
    };

    add_generic(regs, ins, a, ins.field_simm() as i32 as u32, false, flags);
    Ok(())
}

fn addic(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    addic_generic(ctx, ins, false)
}

fn addic_record(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    addic_generic(ctx, ins, true)
}

// subtraction is computed as !a + b + carry_in

fn subf(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let (a, b) = (regs.gpr[ins.field_ra() as usize], regs.gpr[ins.field_rb() as usize]);
    add_generic(regs, ins, !a, b, true, AddFlags::xo(ins, false));
    Ok(())
}

fn subfc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let (a, b) = (regs.gpr[ins.field_ra() as usize], regs.gpr[ins.field_rb() as usize]);
    add_generic(regs, ins, !a, b, true, AddFlags::xo(ins, true));
    Ok(())
}

fn subfe(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let (a, b) = (regs.gpr[ins.field_ra() as usize], regs.gpr[ins.field_rb() as usize]);
    let ca = regs.xer_ca();
    add_generic(regs, ins, !a, b, ca, AddFlags::xo(ins, true));
    Ok(())
}

fn subfme(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let ca = regs.xer_ca();
    add_generic(regs, ins, !a, u32::MAX, ca, AddFlags::xo(ins, true));
    Ok(())
}

fn subfze(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let ca = regs.xer_ca();
    add_generic(regs, ins, !a, 0, ca, AddFlags::xo(ins, true));
    Ok(())
}

fn subfic(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let flags = AddFlags {
        carry: true,
        ..AddFlags::NONE
    };

    add_generic(regs, ins, !a, ins.field_simm() as i32 as u32, true, flags);
    Ok(())
}

fn neg(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    add_generic(regs, ins, !a, 0, true, AddFlags::xo(ins, false));
    Ok(())
}

/// Writes rD and the OE/Rc side effects shared by multiplications and divisions.
#[inline(always)]
fn finish_xo(regs: &mut Registers, ins: Ins, value: u32, overflow: bool) {
    regs.gpr[ins.field_rd() as usize] = value;

    if ins.field_oe() {
        regs.set_xer_ov(overflow);
    }

    if ins.field_rc() {
        regs.update_cr0(value);
    }
}

fn mulli(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize] as i32;
    regs.gpr[ins.field_rd() as usize] = a.wrapping_mul(ins.field_simm() as i32) as u32;
    Ok(())
}

fn mullw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize] as i32 as i64;
    let b = regs.gpr[ins.field_rb() as usize] as i32 as i64;
    let product = a * b;

    let overflow = product != product as i32 as i64;
    finish_xo(regs, ins, product as u32, overflow);
    Ok(())
}

fn mulhw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize] as i32 as i64;
    let b = regs.gpr[ins.field_rb() as usize] as i32 as i64;

    finish_xo(regs, ins, ((a * b) >> 32) as u32, false);
    Ok(())
}

fn mulhwu(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize] as u64;
    let b = regs.gpr[ins.field_rb() as usize] as u64;

    finish_xo(regs, ins, ((a * b) >> 32) as u32, false);
    Ok(())
}

fn divw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize] as i32;
    let b = regs.gpr[ins.field_rb() as usize] as i32;

    let (value, overflow) = match a.checked_div(b) {
        Some(quotient) => (quotient as u32, false),
        None if a < 0 => (u32::MAX, true),
        None => (0, true),
    };

    finish_xo(regs, ins, value, overflow);
    Ok(())
}

fn divwu(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let b = regs.gpr[ins.field_rb() as usize];

    let (value, overflow) = match a.checked_div(b) {
        Some(quotient) => (quotient, false),
        None => (0, true),
    };

    finish_xo(regs, ins, value, overflow);
    Ok(())
}

// logic

#[inline(always)]
fn bitwise(ctx: &mut CoreContext<'_>, ins: Ins, op: impl FnOnce(u32, u32) -> u32) -> Exec {
    let regs = ctx.regs_mut();
    let s = regs.gpr[ins.field_rs() as usize];
    let b = regs.gpr[ins.field_rb() as usize];

    let value = op(s, b);
    regs.gpr[ins.field_ra() as usize] = value;

    if ins.field_rc() {
        regs.update_cr0(value);
    }

    Ok(())
}

/// Logic with an immediate. Only the `andi.`/`andis.` forms record.
#[inline(always)]
fn bitwise_imm(ctx: &mut CoreContext<'_>, ins: Ins, imm: u32, record: bool, op: fn(u32, u32) -> u32) -> Exec {
    let regs = ctx.regs_mut();
    let value = op(regs.gpr[ins.field_rs() as usize], imm);
    regs.gpr[ins.field_ra() as usize] = value;

    if record {
        regs.update_cr0(value);
    }

    Ok(())
}

fn and(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| s & b)
}

fn andc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| s & !b)
}

fn or(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| s | b)
}

fn orc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| s | !b)
}

fn xor(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| s ^ b)
}

fn nand(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| !(s & b))
}

fn nor(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| !(s | b))
}

fn eqv(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| !(s ^ b))
}

fn extsb(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, _| s as i8 as i32 as u32)
}

fn extsh(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, _| s as i16 as i32 as u32)
}

fn cntlzw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, _| s.leading_zeros())
}

fn andi_record(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise_imm(ctx, ins, ins.field_uimm() as u32, true, |s, imm| s & imm)
}

fn andis_record(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise_imm(ctx, ins, (ins.field_uimm() as u32) << 16, true, |s, imm| s & imm)
}

fn ori(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise_imm(ctx, ins, ins.field_uimm() as u32, false, |s, imm| s | imm)
}

fn oris(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise_imm(ctx, ins, (ins.field_uimm() as u32) << 16, false, |s, imm| s | imm)
}

fn xori(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise_imm(ctx, ins, ins.field_uimm() as u32, false, |s, imm| s ^ imm)
}

fn xoris(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise_imm(ctx, ins, (ins.field_uimm() as u32) << 16, false, |s, imm| s ^ imm)
}

// rotate and shift

fn rlwinm(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, _| s.rotate_left(ins.field_sh() as u32) & ins.rotate_mask())
}

fn rlwnm(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| s.rotate_left(b & 0x1F) & ins.rotate_mask())
}

fn rlwimi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let a = ctx.regs().gpr[ins.field_ra() as usize];
    bitwise(ctx, ins, |s, _| {
        let mask = ins.rotate_mask();
        (s.rotate_left(ins.field_sh() as u32) & mask) | (a & !mask)
    })
}

fn slw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| ((s as u64) << (b & 0x3F)) as u32)
}

fn srw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    bitwise(ctx, ins, |s, b| ((s as u64) >> (b & 0x3F)) as u32)
}

/// Arithmetic right shift by `amount` (up to 63), also returning the carry: set if the value is
/// negative and any 1 bits were shifted out.
#[inline(always)]
fn shift_right_algebraic(value: u32, amount: u32) -> (u32, bool) {
    let extended = value as i32 as i64;
    let result = (extended >> amount.min(63)) as u32;
    let lost = if amount >= 32 {
        value != 0
    } else {
        value & ((1u32 << amount) - 1) != 0
    };

    (result, extended < 0 && lost)
}

fn sraw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let s = regs.gpr[ins.field_rs() as usize];
    let b = regs.gpr[ins.field_rb() as usize];

    let (value, carry) = shift_right_algebraic(s, b & 0x3F);
    regs.gpr[ins.field_ra() as usize] = value;
    regs.set_xer_ca(carry);

    if ins.field_rc() {
        regs.update_cr0(value);
    }

    Ok(())
}

fn srawi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let s = regs.gpr[ins.field_rs() as usize];

    let (value, carry) = shift_right_algebraic(s, ins.field_sh() as u32);
    regs.gpr[ins.field_ra() as usize] = value;
    regs.set_xer_ca(carry);

    if ins.field_rc() {
        regs.update_cr0(value);
    }

    Ok(())
}

// compare

#[inline(always)]
fn compare<T: PartialOrd>(regs: &mut Registers, ins: Ins, a: T, b: T) {
    let cond = Cond::new(a < b, a > b, a == b, regs.xer_so());
    regs.set_cr_field(ins.field_crfd(), cond);
}

fn cmp(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize] as i32;
    let b = regs.gpr[ins.field_rb() as usize] as i32;
    compare(regs, ins, a, b);
    Ok(())
}

fn cmpi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize] as i32;
    compare(regs, ins, a, ins.field_simm() as i32);
    Ok(())
}

fn cmpl(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    let b = regs.gpr[ins.field_rb() as usize];
    compare(regs, ins, a, b);
    Ok(())
}

fn cmpli(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = regs.gpr[ins.field_ra() as usize];
    compare(regs, ins, a, ins.field_uimm() as u32);
    Ok(())
}

pub(super) fn register(table: &mut HandlerTable<ExecFn>) {
    let handlers: &[(InsId, ExecFn)] = &[
        (InsId::Add, add),
        (InsId::Addc, addc),
        (InsId::Adde, adde),
        (InsId::Addi, addi),
        (InsId::Addic, addic),
        (InsId::AddicRc, addic_record),
        (InsId::Addis, addis),
        (InsId::Addme, addme),
        (InsId::Addze, addze),
        (InsId::Divw, divw),
        (InsId::Divwu, divwu),
        (InsId::Mulhw, mulhw),
        (InsId::Mulhwu, mulhwu),
        (InsId::Mulli, mulli),
        (InsId::Mullw, mullw),
        (InsId::Neg, neg),
        (InsId::Subf, subf),
        (InsId::Subfc, subfc),
        (InsId::Subfe, subfe),
        (InsId::Subfic, subfic),
        (InsId::Subfme, subfme),
        (InsId::Subfze, subfze),
        (InsId::Cmp, cmp),
        (InsId::Cmpi, cmpi),
        (InsId::Cmpl, cmpl),
        (InsId::Cmpli, cmpli),
        (InsId::And, and),
        (InsId::Andc, andc),
        (InsId::AndiRc, andi_record),
        (InsId::AndisRc, andis_record),
        (InsId::Cntlzw, cntlzw),
        (InsId::Eqv, eqv),
        (InsId::Extsb, extsb),
        (InsId::Extsh, extsh),
        (InsId::Nand, nand),
        (InsId::Nor, nor),
        (InsId::Or, or),
        (InsId::Orc, orc),
        (InsId::Ori, ori),
        (InsId::Oris, oris),
        (InsId::Xor, xor),
        (InsId::Xori, xori),
        (InsId::Xoris, xoris),
        (InsId::Rlwimi, rlwimi),
        (InsId::Rlwinm, rlwinm),
        (InsId::Rlwnm, rlwnm),
        (InsId::Slw, slw),
        (InsId::Sraw, sraw),
        (InsId::Srawi, srawi),
        (InsId::Srw, srw),
    ];

    for &(id, handler) in handlers {
        table.register(id, handler);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use espresso::arch::xer;

    #[test]
    fn add_carry_and_overflow() {
        assert_eq!(add_with_carry(0x7FFF_FFFF, 1, false), (0x8000_0000, false, true));
        assert_eq!(add_with_carry(u32::MAX, 1, false), (0, true, false));
        assert_eq!(add_with_carry(0x8000_0000, 0x8000_0000, false), (0, true, true));
        assert_eq!(add_with_carry(u32::MAX, 0, true), (0, true, false));
    }

    #[test]
    fn subtract_matches_wrapping_sub() {
        use nanorand::{Rng, WyRand};

        let mut rng = WyRand::new_seed(0x5EED);
        for _ in 0..10_000 {
            let a = rng.generate::<u32>();
            let b = rng.generate::<u32>();

            let (value, carry, _) = add_with_carry(!a, b, true);
            assert_eq!(value, b.wrapping_sub(a));
            assert_eq!(carry, b >= a);
        }

        // subf(0, 0) borrows nothing
        assert_eq!(add_with_carry(!0, 0, true), (0, true, false));
    }

    #[test]
    fn algebraic_shift_carry() {
        assert_eq!(shift_right_algebraic(0xFFFF_FFF1, 4), (0xFFFF_FFFF, true));
        assert_eq!(shift_right_algebraic(0xFFFF_FFF0, 4), (0xFFFF_FFFF, false));
        assert_eq!(shift_right_algebraic(0x7000_0001, 4), (0x0700_0000, false));
        assert_eq!(shift_right_algebraic(0x8000_0000, 40), (0xFFFF_FFFF, true));
        assert_eq!(shift_right_algebraic(0x1234_5678, 32), (0, false));
        assert_eq!(shift_right_algebraic(5, 0), (5, false));
    }

    #[test]
    fn overflow_sets_summary() {
        let mut regs = Registers::default();
        // addo r3, r4, r5
        let ins = Ins::new(0x7C64_2E14);
        add_generic(&mut regs, ins, 0x7FFF_FFFF, 1, false, AddFlags::xo(ins, false));

        assert_eq!(regs.gpr[3], 0x8000_0000);
        assert_eq!(regs.xer & (xer::OV | xer::SO), xer::OV | xer::SO);
        assert!(!regs.xer_ca());
        assert_eq!(regs.cr, 0);
    }
}
