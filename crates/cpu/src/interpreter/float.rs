//! Floating point arithmetic, conversion and FPSCR instructions.
use super::Exec;
use crate::{core::CoreContext, handlers::ExecFn};
use espresso::{
    Cond, HandlerTable, Ins, InsId, Registers, RoundingMode,
    arch::fpscr,
    float::{
        estimate_reciprocal, estimate_reciprocal_root, extend_single, make_quiet, multiply_single,
        round_for_multiply, round_to_single,
    },
};

/// FX and every individual exception bit, i.e. the bits cleared by `mcrfs`.
const EXCEPTIONS: u32 = 0x9FF8_0700;
/// The invalid operation exception bits summarized by VX.
const INVALID_OPERATIONS: u32 = 0x01F8_0700;
const FX: u32 = 1 << 31;
const VX: u32 = 1 << 29;
const FEX: u32 = 1 << 30;

/// Sets the rounding mode of the host FPU, used by single precision rounding.
#[cfg(target_arch = "x86_64")]
pub(crate) fn apply_rounding_mode(mode: RoundingMode) {
    let rc: u32 = match mode {
        RoundingMode::Nearest => 0b00,
        RoundingMode::Negative => 0b01,
        RoundingMode::Positive => 0b10,
        RoundingMode::Zero => 0b11,
    };

    let mut mxcsr: u32 = 0;
    // SAFETY: stmxcsr/ldmxcsr only touch the MXCSR and the pointed to local
    unsafe {
        std::arch::asm!("stmxcsr [{}]", in(reg) &raw mut mxcsr, options(nostack));
        mxcsr = (mxcsr & !(0b11 << 13)) | (rc << 13);
        std::arch::asm!("ldmxcsr [{}]", in(reg) &raw const mxcsr, options(nostack, readonly));
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn apply_rounding_mode(_: RoundingMode) {}

/// Recomputes the VX and FEX summary bits.
fn update_summary(fpscr: u32) -> u32 {
    let fpscr = if fpscr & INVALID_OPERATIONS != 0 {
        fpscr | VX
    } else {
        fpscr & !VX
    };

    // VX OX UX ZX XX line up with VE OE UE ZE XE
    let enabled = (fpscr >> 25) & (fpscr >> 3) & 0x1F;
    if enabled != 0 {
        fpscr | FEX
    } else {
        fpscr & !FEX
    }
}

/// Writes FPSCR, keeping the summary bits and the host rounding mode in sync.
fn set_fpscr(regs: &mut Registers, value: u32) {
    regs.fpscr = update_summary(value);
    apply_rounding_mode(regs.rounding_mode());
}

#[inline(always)]
fn ps0(regs: &Registers, index: u8) -> f64 {
    regs.fpr[index as usize][0]
}

#[inline(always)]
fn finish(regs: &mut Registers, ins: Ins, value: f64, single: bool) {
    let frd = &mut regs.fpr[ins.field_frd() as usize];
    frd[0] = value;
    if single {
        frd[1] = value;
    }

    if ins.field_rc() {
        regs.update_cr1();
    }
}

#[inline(always)]
fn arith(ctx: &mut CoreContext<'_>, ins: Ins, single: bool, op: fn(f64, f64, f64) -> f64) -> Exec {
    let regs = ctx.regs_mut();
    let a = ps0(regs, ins.field_fra());
    let b = ps0(regs, ins.field_frb());
    let c = ps0(regs, ins.field_frc());

    let value = op(a, b, c);
    let value = if single { round_to_single(value) } else { value };

    finish(regs, ins, value, single);
    Ok(())
}

fn fadd(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, false, |a, b, _| a + b)
}

fn fadds(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, true, |a, b, _| a + b)
}

fn fsub(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, false, |a, b, _| a - b)
}

fn fsubs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, true, |a, b, _| a - b)
}

fn fmul(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, false, |a, _, c| a * c)
}

fn fmuls(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, true, |a, _, c| multiply_single(a, c))
}

fn fdiv(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, false, |a, b, _| a / b)
}

fn fdivs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, true, |a, b, _| a / b)
}

fn frsp(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, true, |_, b, _| b)
}

#[derive(Clone, Copy)]
struct Fused {
    subtract: bool,
    negate: bool,
    single: bool,
}

/// `±(a * c ± b)` with a single rounding. NaN operands are propagated quieted, in a, b, c order,
/// and are never negated.
fn fused_multiply_add(a: f64, b: f64, c: f64, fused: Fused) -> f64 {
    let value = if a.is_nan() {
        make_quiet(a)
    } else if b.is_nan() {
        make_quiet(b)
    } else if c.is_nan() {
        make_quiet(c)
    } else {
        let (a, c) = if fused.single {
            round_for_multiply(a, c)
        } else {
            (a, c)
        };
        let addend = if fused.subtract { -b } else { b };
        let value = a.mul_add(c, addend);

        if fused.negate { -value } else { value }
    };

    if fused.single {
        round_to_single(value)
    } else {
        value
    }
}

#[inline(always)]
fn fused(ctx: &mut CoreContext<'_>, ins: Ins, fused: Fused) -> Exec {
    let regs = ctx.regs_mut();
    let a = ps0(regs, ins.field_fra());
    let b = ps0(regs, ins.field_frb());
    let c = ps0(regs, ins.field_frc());

    let value = fused_multiply_add(a, b, c, fused);
    finish(regs, ins, value, fused.single);
    Ok(())
}

macro_rules! fused_ops {
    ($($name:ident => $subtract:literal, $negate:literal, $single:literal;)*) => {
        $(
            fn $name(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
                fused(ctx, ins, Fused { subtract: $subtract, negate: $negate, single: $single })
            }
        )*
    };
}

fused_ops! {
    fmadd => false, false, false;
    fmadds => false, false, true;
    fmsub => true, false, false;
    fmsubs => true, false, true;
    fnmadd => false, true, false;
    fnmadds => false, true, true;
    fnmsub => true, true, false;
    fnmsubs => true, true, true;
}

fn fres(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let b = ps0(regs, ins.field_frb());
    let value = extend_single(estimate_reciprocal(b as f32));

    finish(regs, ins, value, true);
    Ok(())
}

fn frsqrte(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let b = ps0(regs, ins.field_frb());

    finish(regs, ins, estimate_reciprocal_root(b), false);
    Ok(())
}

fn fsel(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = ps0(regs, ins.field_fra());
    let value = if a >= 0.0 {
        ps0(regs, ins.field_frc())
    } else {
        ps0(regs, ins.field_frb())
    };

    finish(regs, ins, value, false);
    Ok(())
}

#[inline(always)]
fn float_move(ctx: &mut CoreContext<'_>, ins: Ins, op: fn(f64) -> f64) -> Exec {
    let regs = ctx.regs_mut();
    let b = ps0(regs, ins.field_frb());
    finish(regs, ins, op(b), false);
    Ok(())
}

fn fmr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    float_move(ctx, ins, |b| b)
}

fn fneg(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    float_move(ctx, ins, |b| -b)
}

fn fabs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    float_move(ctx, ins, f64::abs)
}

fn fnabs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    float_move(ctx, ins, |b| -b.abs())
}

/// Converts `value` to a signed word, saturating. NaN converts to the most negative value.
fn convert_to_word(value: f64, mode: RoundingMode) -> i32 {
    if value.is_nan() || value < i32::MIN as f64 {
        i32::MIN
    } else if value > i32::MAX as f64 {
        i32::MAX
    } else {
        mode.round(value) as i32
    }
}

#[inline(always)]
fn convert(ctx: &mut CoreContext<'_>, ins: Ins, mode: RoundingMode) -> Exec {
    let regs = ctx.regs_mut();
    let b = ps0(regs, ins.field_frb());
    let word = convert_to_word(b, mode);

    let negative_zero = (word == 0 && b.is_sign_negative()) as u64;
    let bits = ((0xFFF8_0000 | negative_zero) << 32) | word as u32 as u64;

    finish(regs, ins, f64::from_bits(bits), false);
    Ok(())
}

fn fctiw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let mode = ctx.regs().rounding_mode();
    convert(ctx, ins, mode)
}

fn fctiwz(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    convert(ctx, ins, RoundingMode::Zero)
}

/// Compares `a` and `b` into CR field `crfd`, mirroring the result into FPSCR[FPCC].
pub(super) fn compare(regs: &mut Registers, crfd: u8, a: f64, b: f64) {
    let cond = if a.is_nan() || b.is_nan() {
        Cond::new(false, false, false, true)
    } else {
        Cond::new(a < b, a > b, a == b, false)
    };

    regs.set_cr_field(crfd, cond);
    regs.fpscr = (regs.fpscr & !fpscr::FPCC) | (cond.to_bits() << fpscr::FPCC_SHIFT);
}

fn fcmp(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = ps0(regs, ins.field_fra());
    let b = ps0(regs, ins.field_frb());
    compare(regs, ins.field_crfd(), a, b);
    Ok(())
}

// FPSCR

/// Expands a field mask, where bit 7 selects field 0, into a mask of the bits of those fields.
pub(super) fn field_mask(fields: u8) -> u32 {
    (0..8)
        .filter(|i| fields & (0x80 >> i) != 0)
        .fold(0, |mask, i| mask | (0xF << (4 * (7 - i))))
}

fn mffs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let high = ps0(regs, ins.field_frd()).to_bits() & 0xFFFF_FFFF_0000_0000;
    let value = f64::from_bits(high | regs.fpscr as u64);
    finish(regs, ins, value, false);
    Ok(())
}

fn mtfsf(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let mask = field_mask(ins.field_fm());
    let value = ps0(regs, ins.field_frb()).to_bits() as u32;

    set_fpscr(regs, (regs.fpscr & !mask) | (value & mask));
    if ins.field_rc() {
        regs.update_cr1();
    }

    Ok(())
}

fn mtfsfi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let shift = 4 * (7 - ins.field_crfd() as u32);
    let value = (ins.field_imm() as u32) << shift;

    set_fpscr(regs, (regs.fpscr & !(0xF << shift)) | value);
    if ins.field_rc() {
        regs.update_cr1();
    }

    Ok(())
}

#[inline(always)]
fn set_fpscr_bit(ctx: &mut CoreContext<'_>, ins: Ins, value: bool) -> Exec {
    let regs = ctx.regs_mut();
    let bit = 1 << (31 - ins.field_crbd() as u32);
    let fpscr = if value {
        // newly raised exceptions also raise FX
        let raised = bit & EXCEPTIONS & !regs.fpscr;
        if raised != 0 {
            regs.fpscr | bit | FX
        } else {
            regs.fpscr | bit
        }
    } else {
        regs.fpscr & !bit
    };

    set_fpscr(regs, fpscr);
    if ins.field_rc() {
        regs.update_cr1();
    }

    Ok(())
}

fn mtfsb0(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    set_fpscr_bit(ctx, ins, false)
}

fn mtfsb1(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    set_fpscr_bit(ctx, ins, true)
}

fn mcrfs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let shift = 4 * (7 - ins.field_crfs() as u32);
    let field = Cond::from_bits(regs.fpscr >> shift);

    regs.set_cr_field(ins.field_crfd(), field);
    set_fpscr(regs, regs.fpscr & !(EXCEPTIONS & (0xF << shift)));
    Ok(())
}

pub(super) fn register(table: &mut HandlerTable<ExecFn>) {
    let handlers: &[(InsId, ExecFn)] = &[
        (InsId::Fadd, fadd),
        (InsId::Fadds, fadds),
        (InsId::Fsub, fsub),
        (InsId::Fsubs, fsubs),
        (InsId::Fmul, fmul),
        (InsId::Fmuls, fmuls),
        (InsId::Fdiv, fdiv),
        (InsId::Fdivs, fdivs),
        (InsId::Frsp, frsp),
        (InsId::Fmadd, fmadd),
        (InsId::Fmadds, fmadds),
        (InsId::Fmsub, fmsub),
        (InsId::Fmsubs, fmsubs),
        (InsId::Fnmadd, fnmadd),
        (InsId::Fnmadds, fnmadds),
        (InsId::Fnmsub, fnmsub),
        (InsId::Fnmsubs, fnmsubs),
        (InsId::Fres, fres),
        (InsId::Frsqrte, frsqrte),
        (InsId::Fsel, fsel),
        (InsId::Fmr, fmr),
        (InsId::Fneg, fneg),
        (InsId::Fabs, fabs),
        (InsId::Fnabs, fnabs),
        (InsId::Fctiw, fctiw),
        (InsId::Fctiwz, fctiwz),
        (InsId::Fcmpo, fcmp),
        (InsId::Fcmpu, fcmp),
        (InsId::Mffs, mffs),
        (InsId::Mtfsf, mtfsf),
        (InsId::Mtfsfi, mtfsfi),
        (InsId::Mtfsb0, mtfsb0),
        (InsId::Mtfsb1, mtfsb1),
        (InsId::Mcrfs, mcrfs),
    ];

    for &(id, handler) in handlers {
        table.register(id, handler);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FMADD: Fused = Fused {
        subtract: false,
        negate: false,
        single: false,
    };

    #[test]
    fn word_conversion_saturates() {
        assert_eq!(convert_to_word(f64::NAN, RoundingMode::Nearest), i32::MIN);
        assert_eq!(convert_to_word(3e10, RoundingMode::Nearest), i32::MAX);
        assert_eq!(convert_to_word(-3e10, RoundingMode::Zero), i32::MIN);
        assert_eq!(convert_to_word(2.5, RoundingMode::Nearest), 2);
        assert_eq!(convert_to_word(3.5, RoundingMode::Nearest), 4);
        assert_eq!(convert_to_word(-2.7, RoundingMode::Zero), -2);
        assert_eq!(convert_to_word(-2.2, RoundingMode::Negative), -3);
        assert_eq!(convert_to_word(2.2, RoundingMode::Positive), 3);
    }

    #[test]
    fn fused_nan_priority() {
        let a = f64::from_bits(0x7FF0_0000_0000_0001);
        let b = f64::from_bits(0x7FF0_0000_0000_0002);

        let value = fused_multiply_add(a, b, 1.0, FMADD);
        assert_eq!(value.to_bits(), 0x7FF8_0000_0000_0001);

        let value = fused_multiply_add(1.0, b, 1.0, Fused { negate: true, ..FMADD });
        assert_eq!(value.to_bits(), 0x7FF8_0000_0000_0002);
    }

    #[test]
    fn fused_rounds_once() {
        // (1 + e)(1 - e) - 1 is lost entirely when the product is rounded first
        let a = 1.0 + f64::EPSILON;
        let c = 1.0 - f64::EPSILON;
        let value = fused_multiply_add(a, -1.0, c, FMADD);
        assert_eq!(value, -(f64::EPSILON * f64::EPSILON));

        let fnmsub = Fused {
            subtract: true,
            negate: true,
            single: false,
        };
        assert_eq!(fused_multiply_add(2.0, 1.0, 3.0, fnmsub), -5.0);
    }

    #[test]
    fn compare_sets_fpcc() {
        let mut regs = Registers::default();
        compare(&mut regs, 1, 1.0, 2.0);
        assert_eq!(regs.cr_field(1), Cond::new(true, false, false, false));
        assert_eq!((regs.fpscr & fpscr::FPCC) >> fpscr::FPCC_SHIFT, 0b1000);

        compare(&mut regs, 1, f64::NAN, 2.0);
        assert_eq!(regs.cr_field(1), Cond::new(false, false, false, true));
        assert_eq!((regs.fpscr & fpscr::FPCC) >> fpscr::FPCC_SHIFT, 0b0001);
    }

    #[test]
    fn field_masks() {
        assert_eq!(field_mask(0xFF), u32::MAX);
        assert_eq!(field_mask(0x80), 0xF000_0000);
        assert_eq!(field_mask(0x01), 0x0000_000F);
        assert_eq!(field_mask(0x41), 0x0F00_000F);
    }

    #[test]
    fn summary_bits() {
        // VXSNAN with VE enabled
        let fpscr = update_summary(fpscr::VXSNAN | (1 << 7));
        assert_eq!(fpscr & (VX | FEX), VX | FEX);

        // ZX without ZE
        let fpscr = update_summary(1 << 26);
        assert_eq!(fpscr & (VX | FEX), 0);

        // stale summaries are cleared
        assert_eq!(update_summary(VX | FEX), 0);
    }
}
