//! Paired single arithmetic and the quantized loads and stores.
//!
//! Paired singles live in the two slots of an FPR as doubles that hold single precision values.
//! Results are computed in double precision and narrowed per slot, with NaN operands narrowed by
//! truncation so their payloads survive.
use super::{Exec, float::compare, loadstore::single_bits};
use crate::{
    core::{CoreContext, Fault},
    handlers::ExecFn,
};
use espresso::{
    HandlerTable, Ins, InsId, QuantizedType, Registers,
    float::{
        estimate_reciprocal, estimate_reciprocal_root, extend_single, is_signalling_nan,
        multiply_single, round_for_multiply, truncate_double,
    },
};

const F32_QUIET_BIT: u32 = 1 << 22;
const F64_EXPONENT: u64 = 0x7FF0_0000_0000_0000;
const F64_MANTISSA: u64 = 0x000F_FFFF_FFFF_FFFF;

/// 2 to the power of `exponent`, for exponents in normal range.
const fn pow2(exponent: i32) -> f64 {
    f64::from_bits(((1023 + exponent) as u64) << 52)
}

/// Builds a table indexed by the 6-bit scale field of a GQR, holding `2^(sign * scale)`.
const fn scale_table(sign: i32) -> [f64; 64] {
    let mut table = [0.0; 64];
    let mut i = 0;
    while i < 64 {
        let scale = ((i as i32) << 26) >> 26;
        table[i] = pow2(sign * scale);
        i += 1;
    }

    table
}

/// Factor applied to values before storing them.
static QUANTIZE: [f64; 64] = scale_table(1);
/// Factor applied to values after loading them.
static DEQUANTIZE: [f64; 64] = scale_table(-1);

#[inline(always)]
fn quiet(value: f32) -> f32 {
    f32::from_bits(value.to_bits() | F32_QUIET_BIT)
}

/// Narrows a double to a single the way moves and merges do: rounded, unless it is a signalling
/// NaN, which is truncated to keep it signalling.
#[inline(always)]
fn narrow(value: f64) -> f32 {
    if is_signalling_nan(value) {
        truncate_double(value)
    } else {
        value as f32
    }
}

#[inline(always)]
fn slots(regs: &Registers, index: u8) -> [f64; 2] {
    regs.fpr[index as usize]
}

#[inline(always)]
fn finish(regs: &mut Registers, ins: Ins, value: [f32; 2]) {
    regs.fpr[ins.field_frd() as usize] = value.map(extend_single);
    if ins.field_rc() {
        regs.update_cr1();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

/// Computes one slot of a paired operation. `narrow_multiplier` narrows a multiplier taken from
/// slot 0 of frC the way single precision multiplies do.
fn slot_arith(op: Op, a: f64, b: f64, narrow_multiplier: bool) -> f32 {
    if a.is_nan() {
        return quiet(truncate_double(a));
    }

    if b.is_nan() {
        return quiet(truncate_double(b));
    }

    let value = match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul if narrow_multiplier => multiply_single(a, b),
        Op::Mul => a * b,
        Op::Div => a / b,
    };

    value as f32
}

/// Paired arithmetic. For multiplications, `c_slots` selects which slot of frC each slot is
/// multiplied by.
#[inline(always)]
fn arith(ctx: &mut CoreContext<'_>, ins: Ins, op: Op, c_slots: [usize; 2]) -> Exec {
    let regs = ctx.regs_mut();
    let a = slots(regs, ins.field_fra());
    let b = if op == Op::Mul {
        let c = slots(regs, ins.field_frc());
        [c[c_slots[0]], c[c_slots[1]]]
    } else {
        slots(regs, ins.field_frb())
    };

    let value = [
        slot_arith(op, a[0], b[0], c_slots[0] == 0),
        slot_arith(op, a[1], b[1], c_slots[1] == 0),
    ];

    finish(regs, ins, value);
    Ok(())
}

fn ps_add(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, Op::Add, [0, 1])
}

fn ps_sub(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, Op::Sub, [0, 1])
}

fn ps_mul(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, Op::Mul, [0, 1])
}

fn ps_muls0(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, Op::Mul, [0, 0])
}

fn ps_muls1(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, Op::Mul, [1, 1])
}

fn ps_div(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    arith(ctx, ins, Op::Div, [0, 1])
}

#[derive(Debug, Clone, Copy)]
struct Fused {
    subtract: bool,
    negate: bool,
}

/// One slot of a paired fused multiply-add.
fn slot_fused(a: f64, b: f64, c: f64, narrow_multiplier: bool, fused: Fused) -> f32 {
    for operand in [a, b, c] {
        if operand.is_nan() {
            return quiet(truncate_double(operand));
        }
    }

    let (a, c) = if narrow_multiplier {
        round_for_multiply(a, c)
    } else {
        (a, c)
    };

    let addend = if fused.subtract { -b } else { b };
    let value = a.mul_add(c, addend) as f32;

    if fused.negate { -value } else { value }
}

#[inline(always)]
fn fused(ctx: &mut CoreContext<'_>, ins: Ins, fused: Fused, c_slots: [usize; 2]) -> Exec {
    let regs = ctx.regs_mut();
    let a = slots(regs, ins.field_fra());
    let b = slots(regs, ins.field_frb());
    let c = slots(regs, ins.field_frc());

    let value = [0, 1].map(|slot| {
        let c_slot = c_slots[slot];
        slot_fused(a[slot], b[slot], c[c_slot], c_slot == 0, fused)
    });

    finish(regs, ins, value);
    Ok(())
}

const MADD: Fused = Fused {
    subtract: false,
    negate: false,
};

fn ps_madd(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    fused(ctx, ins, MADD, [0, 1])
}

fn ps_madds0(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    fused(ctx, ins, MADD, [0, 0])
}

fn ps_madds1(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    fused(ctx, ins, MADD, [1, 1])
}

fn ps_msub(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let msub = Fused {
        subtract: true,
        ..MADD
    };

    fused(ctx, ins, msub, [0, 1])
}

fn ps_nmadd(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let nmadd = Fused {
        negate: true,
        ..MADD
    };

    fused(ctx, ins, nmadd, [0, 1])
}

fn ps_nmsub(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let nmsub = Fused {
        subtract: true,
        negate: true,
    };

    fused(ctx, ins, nmsub, [0, 1])
}

fn ps_sum0(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = slots(regs, ins.field_fra());
    let b = slots(regs, ins.field_frb());
    let c = slots(regs, ins.field_frc());

    let sum = slot_arith(Op::Add, a[0], b[1], false);
    regs.fpr[ins.field_frd() as usize] = [extend_single(sum), c[1]];

    if ins.field_rc() {
        regs.update_cr1();
    }

    Ok(())
}

fn ps_sum1(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = slots(regs, ins.field_fra());
    let b = slots(regs, ins.field_frb());
    let c = slots(regs, ins.field_frc());

    let sum = slot_arith(Op::Add, a[0], b[1], false);
    let high = if c[0].is_nan() {
        truncate_double(c[0])
    } else {
        c[0] as f32
    };

    finish(regs, ins, [high, sum]);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Move {
    Direct,
    Negate,
    Absolute,
    NegativeAbsolute,
}

fn move_generic(ctx: &mut CoreContext<'_>, ins: Ins, mode: Move) -> Exec {
    let regs = ctx.regs_mut();
    let b = slots(regs, ins.field_frb());

    // ps1 is always truncated
    let value = [narrow(b[0]), truncate_double(b[1])].map(|slot| {
        let bits = slot.to_bits();
        f32::from_bits(match mode {
            Move::Direct => bits,
            Move::Negate => bits ^ 0x8000_0000,
            Move::Absolute => bits & !0x8000_0000,
            Move::NegativeAbsolute => bits | 0x8000_0000,
        })
    });

    finish(regs, ins, value);
    Ok(())
}

fn ps_mr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    move_generic(ctx, ins, Move::Direct)
}

fn ps_neg(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    move_generic(ctx, ins, Move::Negate)
}

fn ps_abs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    move_generic(ctx, ins, Move::Absolute)
}

fn ps_nabs(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    move_generic(ctx, ins, Move::NegativeAbsolute)
}

/// `ps_mergeXY`: slot X of frA and slot Y of frB. A double inserted into slot 1 is truncated, and
/// replaced by the largest positive single if its magnitude is out of range.
fn merge(ctx: &mut CoreContext<'_>, ins: Ins, high: usize, low: usize) -> Exec {
    let regs = ctx.regs_mut();
    let a = slots(regs, ins.field_fra())[high];
    let b = slots(regs, ins.field_frb())[low];

    let exponent = (b.to_bits() & F64_EXPONENT) >> 52;
    let low = if (1151..2047).contains(&exponent) {
        f32::MAX
    } else {
        truncate_double(b)
    };

    finish(regs, ins, [narrow(a), low]);
    Ok(())
}

fn ps_merge00(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    merge(ctx, ins, 0, 0)
}

fn ps_merge01(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    merge(ctx, ins, 0, 1)
}

fn ps_merge10(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    merge(ctx, ins, 1, 0)
}

fn ps_merge11(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    merge(ctx, ins, 1, 1)
}

fn ps_res(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let b = slots(regs, ins.field_frb());
    finish(regs, ins, b.map(|slot| estimate_reciprocal(truncate_double(slot))));
    Ok(())
}

/// Drops the low mantissa bits of a reciprocal square root estimate.
const RSQRTE_MANTISSA: u64 = 0x000F_FFFF_E000_0000;

/// Mangles the exponent of the ps1 estimate the way the hardware does when it is out of single
/// range.
fn rsqrte_high_exponent(bits: u64) -> u64 {
    let exponent = ((bits & F64_EXPONENT) >> 52) as i32;
    let exponent = match exponent {
        0 => 0,
        1..1151 => 1023 + ((exponent - 1023) & 0xFF) as u8 as i8 as i32,
        1151..2047 => 1022,
        _ => exponent,
    };

    (bits & !F64_EXPONENT) | ((exponent as u64) << 52)
}

fn ps_rsqrte(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let b = slots(regs, ins.field_frb());

    let estimate = b.map(|slot| estimate_reciprocal_root(slot).to_bits());
    let low = estimate[0] & !(F64_MANTISSA & !RSQRTE_MANTISSA);
    let high = rsqrte_high_exponent(estimate[1]) & !(F64_MANTISSA & !RSQRTE_MANTISSA);

    regs.fpr[ins.field_frd() as usize] = [f64::from_bits(low), f64::from_bits(high)];
    if ins.field_rc() {
        regs.update_cr1();
    }

    Ok(())
}

fn ps_sel(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let a = slots(regs, ins.field_fra());
    let b = slots(regs, ins.field_frb());
    let c = slots(regs, ins.field_frc());

    regs.fpr[ins.field_frd() as usize] =
        [0, 1].map(|slot| if a[slot] >= 0.0 { c[slot] } else { b[slot] });

    if ins.field_rc() {
        regs.update_cr1();
    }

    Ok(())
}

fn ps_cmp(ctx: &mut CoreContext<'_>, ins: Ins, slot: usize) -> Exec {
    let regs = ctx.regs_mut();
    let a = slots(regs, ins.field_fra())[slot];
    let b = slots(regs, ins.field_frb())[slot];
    compare(regs, ins.field_crfd(), a, b);
    Ok(())
}

fn ps_cmp0(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    ps_cmp(ctx, ins, 0)
}

fn ps_cmp1(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    ps_cmp(ctx, ins, 1)
}

// quantized loads and stores

#[derive(Debug, Clone, Copy)]
struct Quantized {
    indexed: bool,
    update: bool,
}

impl Quantized {
    /// Effective address, whether only ps0 is transferred and the GQR used.
    fn decode(self, regs: &Registers, ins: Ins) -> (u32, bool, u8) {
        let base = if self.update {
            regs.gpr[ins.field_ra() as usize]
        } else {
            regs.gpr_or_zero(ins.gpr_a())
        };

        if self.indexed {
            let ea = base.wrapping_add(regs.gpr[ins.field_rb() as usize]);
            (ea, ins.field_ps_wx(), ins.field_ps_ix())
        } else {
            let ea = base.wrapping_add_signed(ins.field_ps_d() as i32);
            (ea, ins.field_ps_w(), ins.field_ps_i())
        }
    }
}

fn dequantize(ctx: &CoreContext<'_>, ea: u32, ty: QuantizedType, scale: i32) -> Result<f64, Fault> {
    let factor = DEQUANTIZE[(scale & 0x3F) as usize];
    Ok(match ty {
        QuantizedType::Float => extend_single(f32::from_bits(ctx.read::<u32>(ea)?)),
        QuantizedType::U8 => ctx.read::<u8>(ea)? as f64 * factor,
        QuantizedType::U16 => ctx.read::<u16>(ea)? as f64 * factor,
        QuantizedType::I8 => ctx.read::<i8>(ea)? as f64 * factor,
        QuantizedType::I16 => ctx.read::<i16>(ea)? as f64 * factor,
    })
}

/// Scales and clamps `value` into `min..=max`. NaN saturates towards its sign.
#[inline(always)]
fn saturate(value: f64, scale: i32, min: f64, max: f64) -> i64 {
    if value.is_nan() {
        let bound = if value.is_sign_negative() { min } else { max };
        return bound as i64;
    }

    (value * QUANTIZE[(scale & 0x3F) as usize]).clamp(min, max) as i64
}

fn quantize(ctx: &CoreContext<'_>, ea: u32, value: f64, ty: QuantizedType, scale: i32) -> Exec {
    match ty {
        QuantizedType::Float => {
            let exponent = (value.to_bits() & F64_EXPONENT) >> 52;
            let bits = if exponent <= 896 {
                (value.is_sign_negative() as u32) << 31
            } else {
                single_bits(value)
            };

            ctx.write(ea, bits)
        }
        QuantizedType::U8 => ctx.write(ea, saturate(value, scale, 0.0, 255.0) as u8),
        QuantizedType::U16 => ctx.write(ea, saturate(value, scale, 0.0, 65535.0) as u16),
        QuantizedType::I8 => ctx.write(ea, saturate(value, scale, -128.0, 127.0) as i8),
        QuantizedType::I16 => ctx.write(ea, saturate(value, scale, -32768.0, 32767.0) as i16),
    }
}

fn psq_load(ctx: &mut CoreContext<'_>, ins: Ins, mode: Quantized) -> Exec {
    let (ea, single, gqr) = mode.decode(ctx.regs(), ins);
    let gqr = ctx.regs().gqr(gqr);
    let (ty, scale) = (gqr.load_type(), gqr.load_scale());

    let ps0 = dequantize(ctx, ea, ty, scale)?;
    let ps1 = if single {
        1.0
    } else {
        dequantize(ctx, ea.wrapping_add(ty.size()), ty, scale)?
    };

    let regs = ctx.regs_mut();
    regs.fpr[ins.field_frd() as usize] = [ps0, ps1];
    if mode.update {
        regs.gpr[ins.field_ra() as usize] = ea;
    }

    Ok(())
}

fn psq_store(ctx: &mut CoreContext<'_>, ins: Ins, mode: Quantized) -> Exec {
    let (ea, single, gqr) = mode.decode(ctx.regs(), ins);
    let gqr = ctx.regs().gqr(gqr);
    let (ty, scale) = (gqr.store_type(), gqr.store_scale());
    let value = slots(ctx.regs(), ins.field_frs());

    quantize(ctx, ea, value[0], ty, scale)?;
    if !single {
        quantize(ctx, ea.wrapping_add(ty.size()), value[1], ty, scale)?;
    }

    if mode.update {
        ctx.regs_mut().gpr[ins.field_ra() as usize] = ea;
    }

    Ok(())
}

macro_rules! quantized {
    ($($name:ident => $op:ident, $indexed:literal, $update:literal;)*) => {
        $(
            fn $name(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
                $op(ctx, ins, Quantized { indexed: $indexed, update: $update })
            }
        )*
    };
}

quantized! {
    psq_l => psq_load, false, false;
    psq_lu => psq_load, false, true;
    psq_lx => psq_load, true, false;
    psq_lux => psq_load, true, true;
    psq_st => psq_store, false, false;
    psq_stu => psq_store, false, true;
    psq_stx => psq_store, true, false;
    psq_stux => psq_store, true, true;
}

pub(super) fn register(table: &mut HandlerTable<ExecFn>) {
    let handlers: &[(InsId, ExecFn)] = &[
        (InsId::PsAdd, ps_add),
        (InsId::PsSub, ps_sub),
        (InsId::PsMul, ps_mul),
        (InsId::PsDiv, ps_div),
        (InsId::PsMuls0, ps_muls0),
        (InsId::PsMuls1, ps_muls1),
        (InsId::PsMadd, ps_madd),
        (InsId::PsMadds0, ps_madds0),
        (InsId::PsMadds1, ps_madds1),
        (InsId::PsMsub, ps_msub),
        (InsId::PsNmadd, ps_nmadd),
        (InsId::PsNmsub, ps_nmsub),
        (InsId::PsSum0, ps_sum0),
        (InsId::PsSum1, ps_sum1),
        (InsId::PsMr, ps_mr),
        (InsId::PsNeg, ps_neg),
        (InsId::PsAbs, ps_abs),
        (InsId::PsNabs, ps_nabs),
        (InsId::PsMerge00, ps_merge00),
        (InsId::PsMerge01, ps_merge01),
        (InsId::PsMerge10, ps_merge10),
        (InsId::PsMerge11, ps_merge11),
        (InsId::PsRes, ps_res),
        (InsId::PsRsqrte, ps_rsqrte),
        (InsId::PsSel, ps_sel),
        (InsId::PsCmpo0, ps_cmp0),
        (InsId::PsCmpu0, ps_cmp0),
        (InsId::PsCmpo1, ps_cmp1),
        (InsId::PsCmpu1, ps_cmp1),
        (InsId::PsqL, psq_l),
        (InsId::PsqLu, psq_lu),
        (InsId::PsqLx, psq_lx),
        (InsId::PsqLux, psq_lux),
        (InsId::PsqSt, psq_st),
        (InsId::PsqStu, psq_stu),
        (InsId::PsqStx, psq_stx),
        (InsId::PsqStux, psq_stux),
    ];

    for &(id, handler) in handlers {
        table.register(id, handler);
    }
}
