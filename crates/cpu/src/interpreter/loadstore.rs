//! Integer and floating point loads and stores, including the string, multiple and reservation
//! instructions.
use super::Exec;
use crate::{
    core::{CoreContext, Fault, Reservation},
    handlers::ExecFn,
    memory::Primitive,
};
use espresso::{Cond, HandlerTable, Ins, InsId, Registers, float::extend_single};

/// How the effective address of a load or store is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addressing {
    /// `(rA|0) + d`
    Immediate,
    /// `rA + d`, written back to rA.
    ImmediateUpdate,
    /// `(rA|0) + rB`
    Indexed,
    /// `rA + rB`, written back to rA.
    IndexedUpdate,
}

impl Addressing {
    #[inline(always)]
    fn effective_address(self, regs: &Registers, ins: Ins) -> u32 {
        let base = match self {
            Self::Immediate | Self::Indexed => regs.gpr_or_zero(ins.gpr_a()),
            Self::ImmediateUpdate | Self::IndexedUpdate => regs.gpr[ins.field_ra() as usize],
        };

        match self {
            Self::Immediate | Self::ImmediateUpdate => {
                base.wrapping_add_signed(ins.field_d() as i32)
            }
            Self::Indexed | Self::IndexedUpdate => {
                base.wrapping_add(regs.gpr[ins.field_rb() as usize])
            }
        }
    }

    #[inline(always)]
    fn commit(self, regs: &mut Registers, ins: Ins, ea: u32) {
        if matches!(self, Self::ImmediateUpdate | Self::IndexedUpdate) {
            regs.gpr[ins.field_ra() as usize] = ea;
        }
    }
}

#[inline(always)]
fn load<P: Primitive>(
    ctx: &mut CoreContext<'_>,
    ins: Ins,
    mode: Addressing,
    extend: fn(P) -> u32,
) -> Exec {
    let ea = mode.effective_address(ctx.regs(), ins);
    let value = ctx.read::<P>(ea)?;

    let regs = ctx.regs_mut();
    mode.commit(regs, ins, ea);
    regs.gpr[ins.field_rd() as usize] = extend(value);

    Ok(())
}

#[inline(always)]
fn store<P: Primitive>(
    ctx: &mut CoreContext<'_>,
    ins: Ins,
    mode: Addressing,
    narrow: fn(u32) -> P,
) -> Exec {
    let ea = mode.effective_address(ctx.regs(), ins);
    let value = narrow(ctx.regs().gpr[ins.field_rs() as usize]);
    ctx.write(ea, value)?;

    mode.commit(ctx.regs_mut(), ins, ea);
    Ok(())
}

macro_rules! loads {
    ($($name:ident, $ty:ty, $mode:ident, $extend:expr;)*) => {
        $(
            fn $name(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
                load::<$ty>(ctx, ins, Addressing::$mode, $extend)
            }
        )*
    };
}

macro_rules! stores {
    ($($name:ident, $ty:ty, $mode:ident, $narrow:expr;)*) => {
        $(
            fn $name(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
                store::<$ty>(ctx, ins, Addressing::$mode, $narrow)
            }
        )*
    };
}

loads! {
    lbz, u8, Immediate, |v| v as u32;
    lbzu, u8, ImmediateUpdate, |v| v as u32;
    lbzx, u8, Indexed, |v| v as u32;
    lbzux, u8, IndexedUpdate, |v| v as u32;
    lhz, u16, Immediate, |v| v as u32;
    lhzu, u16, ImmediateUpdate, |v| v as u32;
    lhzx, u16, Indexed, |v| v as u32;
    lhzux, u16, IndexedUpdate, |v| v as u32;
    lha, i16, Immediate, |v| v as i32 as u32;
    lhau, i16, ImmediateUpdate, |v| v as i32 as u32;
    lhax, i16, Indexed, |v| v as i32 as u32;
    lhaux, i16, IndexedUpdate, |v| v as i32 as u32;
    lwz, u32, Immediate, |v| v;
    lwzu, u32, ImmediateUpdate, |v| v;
    lwzx, u32, Indexed, |v| v;
    lwzux, u32, IndexedUpdate, |v| v;
    lhbrx, u16, Indexed, |v| v.swap_bytes() as u32;
    lwbrx, u32, Indexed, |v| v.swap_bytes();
}

stores! {
    stb, u8, Immediate, |v| v as u8;
    stbu, u8, ImmediateUpdate, |v| v as u8;
    stbx, u8, Indexed, |v| v as u8;
    stbux, u8, IndexedUpdate, |v| v as u8;
    sth, u16, Immediate, |v| v as u16;
    sthu, u16, ImmediateUpdate, |v| v as u16;
    sthx, u16, Indexed, |v| v as u16;
    sthux, u16, IndexedUpdate, |v| v as u16;
    stw, u32, Immediate, |v| v;
    stwu, u32, ImmediateUpdate, |v| v;
    stwx, u32, Indexed, |v| v;
    stwux, u32, IndexedUpdate, |v| v;
    sthbrx, u16, Indexed, |v| (v as u16).swap_bytes();
    stwbrx, u32, Indexed, |v| v.swap_bytes();
}

fn lmw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Immediate.effective_address(ctx.regs(), ins);
    let first = ins.field_rd() as usize;

    let mut values = [0; 32];
    for (i, value) in values[first..].iter_mut().enumerate() {
        *value = ctx.read::<u32>(ea.wrapping_add(4 * i as u32))?;
    }

    let regs = ctx.regs_mut();
    regs.gpr[first..].copy_from_slice(&values[first..]);
    Ok(())
}

fn stmw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Immediate.effective_address(ctx.regs(), ins);
    let first = ins.field_rs() as usize;

    for (i, reg) in (first..32).enumerate() {
        let value = ctx.regs().gpr[reg];
        ctx.write(ea.wrapping_add(4 * i as u32), value)?;
    }

    Ok(())
}

/// Loads `count` bytes starting at `ea` into consecutive registers starting at rD, wrapping from
/// r31 to r0. Bytes fill each register from the most significant end and any remaining bytes of
/// the last register are zeroed.
fn load_string(ctx: &mut CoreContext<'_>, ins: Ins, ea: u32, count: u32) -> Exec {
    let mut gpr = ctx.regs().gpr;
    let mut reg = ins.field_rd() as usize;

    for i in 0..count {
        let shift = 24 - 8 * (i % 4);
        if i > 0 && shift == 24 {
            reg = (reg + 1) % 32;
        }

        if shift == 24 {
            gpr[reg] = 0;
        }

        let byte = ctx.read::<u8>(ea.wrapping_add(i))?;
        gpr[reg] |= (byte as u32) << shift;
    }

    ctx.regs_mut().gpr = gpr;
    Ok(())
}

/// Stores `count` bytes from consecutive registers starting at rS, wrapping from r31 to r0.
fn store_string(ctx: &mut CoreContext<'_>, ins: Ins, ea: u32, count: u32) -> Exec {
    let mut reg = ins.field_rs() as usize;

    for i in 0..count {
        let shift = 24 - 8 * (i % 4);
        if i > 0 && shift == 24 {
            reg = (reg + 1) % 32;
        }

        let byte = (ctx.regs().gpr[reg] >> shift) as u8;
        ctx.write(ea.wrapping_add(i), byte)?;
    }

    Ok(())
}

/// Byte count of the immediate string instructions, where 0 means 32.
#[inline(always)]
fn immediate_count(ins: Ins) -> u32 {
    match ins.field_nb() {
        0 => 32,
        n => n as u32,
    }
}

fn lswi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = ctx.regs().gpr_or_zero(ins.gpr_a());
    load_string(ctx, ins, ea, immediate_count(ins))
}

fn lswx(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Indexed.effective_address(ctx.regs(), ins);
    let count = ctx.regs().xer_byte_count();
    load_string(ctx, ins, ea, count)
}

fn stswi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = ctx.regs().gpr_or_zero(ins.gpr_a());
    store_string(ctx, ins, ea, immediate_count(ins))
}

fn stswx(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Indexed.effective_address(ctx.regs(), ins);
    let count = ctx.regs().xer_byte_count();
    store_string(ctx, ins, ea, count)
}

fn lwarx(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Indexed.effective_address(ctx.regs(), ins);
    let value = ctx.read::<u32>(ea)?;

    ctx.core.reservation = Some(Reservation { addr: ea, value });
    ctx.regs_mut().gpr[ins.field_rd() as usize] = value;
    Ok(())
}

/// Conditionally stores rS if the reservation of this core is still intact: it must be for the
/// same address, and memory must still hold the value that was loaded. CR0[EQ] tells whether the
/// store happened. The reservation is always lost.
fn stwcx(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Indexed.effective_address(ctx.regs(), ins);
    let value = ctx.regs().gpr[ins.field_rs() as usize];

    let stored = match ctx.core.reservation.take() {
        Some(reservation) if reservation.addr == ea => ctx
            .memory()
            .compare_exchange(ea, reservation.value, value)
            .ok_or(Fault::AccessViolation(ea))?,
        _ => false,
    };

    let regs = ctx.regs_mut();
    let cond = Cond::new(false, false, stored, regs.xer_so());
    regs.set_cr_field(0, cond);

    Ok(())
}

/// Zeroes the 32 byte cache line containing the effective address.
fn dcbz(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Indexed.effective_address(ctx.regs(), ins) & !31;
    if ctx.memory().zero(ea, 32) {
        Ok(())
    } else {
        Err(Fault::AccessViolation(ea))
    }
}

// floating point

/// Converts a double to the bits of a single the way `stfs` does: values in single range are
/// chopped, smaller ones are denormalized.
pub(super) fn single_bits(value: f64) -> u32 {
    let bits = value.to_bits();
    let exponent = ((bits >> 52) & 0x7FF) as u32;

    if exponent > 896 || bits << 1 == 0 {
        (((bits >> 32) & 0xC000_0000) | ((bits >> 29) & 0x3FFF_FFFF)) as u32
    } else {
        let sign = ((bits >> 32) & 0x8000_0000) as u32;
        let mantissa = (1 << 23) | ((bits & 0x000F_FFFF_FFFF_FFFF) >> 29);
        let denormal = mantissa.checked_shr(897 - exponent).unwrap_or(0);

        sign | denormal as u32
    }
}

#[inline(always)]
fn load_single(ctx: &mut CoreContext<'_>, ins: Ins, mode: Addressing) -> Exec {
    let ea = mode.effective_address(ctx.regs(), ins);
    let value = extend_single(f32::from_bits(ctx.read::<u32>(ea)?));

    let regs = ctx.regs_mut();
    mode.commit(regs, ins, ea);
    regs.fpr[ins.field_frd() as usize] = [value; 2];

    Ok(())
}

#[inline(always)]
fn load_double(ctx: &mut CoreContext<'_>, ins: Ins, mode: Addressing) -> Exec {
    let ea = mode.effective_address(ctx.regs(), ins);
    let value = f64::from_bits(ctx.read::<u64>(ea)?);

    let regs = ctx.regs_mut();
    mode.commit(regs, ins, ea);
    regs.fpr[ins.field_frd() as usize][0] = value;

    Ok(())
}

#[inline(always)]
fn store_single(ctx: &mut CoreContext<'_>, ins: Ins, mode: Addressing) -> Exec {
    let ea = mode.effective_address(ctx.regs(), ins);
    let value = single_bits(ctx.regs().fpr[ins.field_frs() as usize][0]);
    ctx.write(ea, value)?;

    mode.commit(ctx.regs_mut(), ins, ea);
    Ok(())
}

#[inline(always)]
fn store_double(ctx: &mut CoreContext<'_>, ins: Ins, mode: Addressing) -> Exec {
    let ea = mode.effective_address(ctx.regs(), ins);
    let value = ctx.regs().fpr[ins.field_frs() as usize][0].to_bits();
    ctx.write(ea, value)?;

    mode.commit(ctx.regs_mut(), ins, ea);
    Ok(())
}

macro_rules! float_accesses {
    ($($name:ident => $op:ident, $mode:ident;)*) => {
        $(
            fn $name(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
                $op(ctx, ins, Addressing::$mode)
            }
        )*
    };
}

float_accesses! {
    lfs => load_single, Immediate;
    lfsu => load_single, ImmediateUpdate;
    lfsx => load_single, Indexed;
    lfsux => load_single, IndexedUpdate;
    lfd => load_double, Immediate;
    lfdu => load_double, ImmediateUpdate;
    lfdx => load_double, Indexed;
    lfdux => load_double, IndexedUpdate;
    stfs => store_single, Immediate;
    stfsu => store_single, ImmediateUpdate;
    stfsx => store_single, Indexed;
    stfsux => store_single, IndexedUpdate;
    stfd => store_double, Immediate;
    stfdu => store_double, ImmediateUpdate;
    stfdx => store_double, Indexed;
    stfdux => store_double, IndexedUpdate;
}

fn stfiwx(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let ea = Addressing::Indexed.effective_address(ctx.regs(), ins);
    let value = ctx.regs().fpr[ins.field_frs() as usize][0].to_bits() as u32;
    ctx.write(ea, value)
}

pub(super) fn register(table: &mut HandlerTable<ExecFn>) {
    let handlers: &[(InsId, ExecFn)] = &[
        (InsId::Lbz, lbz),
        (InsId::Lbzu, lbzu),
        (InsId::Lbzx, lbzx),
        (InsId::Lbzux, lbzux),
        (InsId::Lhz, lhz),
        (InsId::Lhzu, lhzu),
        (InsId::Lhzx, lhzx),
        (InsId::Lhzux, lhzux),
        (InsId::Lha, lha),
        (InsId::Lhau, lhau),
        (InsId::Lhax, lhax),
        (InsId::Lhaux, lhaux),
        (InsId::Lwz, lwz),
        (InsId::Lwzu, lwzu),
        (InsId::Lwzx, lwzx),
        (InsId::Lwzux, lwzux),
        (InsId::Lhbrx, lhbrx),
        (InsId::Lwbrx, lwbrx),
        (InsId::Stb, stb),
        (InsId::Stbu, stbu),
        (InsId::Stbx, stbx),
        (InsId::Stbux, stbux),
        (InsId::Sth, sth),
        (InsId::Sthu, sthu),
        (InsId::Sthx, sthx),
        (InsId::Sthux, sthux),
        (InsId::Stw, stw),
        (InsId::Stwu, stwu),
        (InsId::Stwx, stwx),
        (InsId::Stwux, stwux),
        (InsId::Sthbrx, sthbrx),
        (InsId::Stwbrx, stwbrx),
        (InsId::Lmw, lmw),
        (InsId::Stmw, stmw),
        (InsId::Lswi, lswi),
        (InsId::Lswx, lswx),
        (InsId::Stswi, stswi),
        (InsId::Stswx, stswx),
        (InsId::Lwarx, lwarx),
        (InsId::Stwcx, stwcx),
        (InsId::Dcbz, dcbz),
        (InsId::DcbzL, dcbz),
        (InsId::Lfs, lfs),
        (InsId::Lfsu, lfsu),
        (InsId::Lfsx, lfsx),
        (InsId::Lfsux, lfsux),
        (InsId::Lfd, lfd),
        (InsId::Lfdu, lfdu),
        (InsId::Lfdx, lfdx),
        (InsId::Lfdux, lfdux),
        (InsId::Stfs, stfs),
        (InsId::Stfsu, stfsu),
        (InsId::Stfsx, stfsx),
        (InsId::Stfsux, stfsux),
        (InsId::Stfd, stfd),
        (InsId::Stfdu, stfdu),
        (InsId::Stfdx, stfdx),
        (InsId::Stfdux, stfdux),
        (InsId::Stfiwx, stfiwx),
    ];

    for &(id, handler) in handlers {
        table.register(id, handler);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_bits_in_range_are_chopped() {
        assert_eq!(single_bits(1.0), 1.0f32.to_bits());
        assert_eq!(single_bits(-2.5), (-2.5f32).to_bits());
        assert_eq!(single_bits(0.0), 0);
        assert_eq!(single_bits(-0.0), 0x8000_0000);
        assert_eq!(single_bits(f64::INFINITY), 0x7F80_0000);

        // chopped, not rounded
        let above_one = f64::from_bits(1.0f64.to_bits() | 0x1FFF_FFFF);
        assert_eq!(single_bits(above_one), 1.0f32.to_bits());
    }

    #[test]
    fn single_bits_denormalizes() {
        // 2^-127 is half of the smallest normal single
        let value = f64::from_bits((896u64) << 52);
        assert_eq!(single_bits(value), 0x0040_0000);

        let negative = -f64::from_bits((895u64) << 52);
        assert_eq!(single_bits(negative), 0x8020_0000);

        // far below single range
        assert_eq!(single_bits(f64::from_bits(1u64 << 52)), 0);
    }

    #[test]
    fn addressing_modes() {
        let mut regs = Registers::default();
        regs.gpr[3] = 0x1000;
        regs.gpr[4] = 0x20;

        // lwz r5, -4(r3)
        let ins = Ins::new(0x80A3_FFFC);
        assert_eq!(Addressing::Immediate.effective_address(&regs, ins), 0x0FFC);

        // lwz r5, 8(r0) ignores r0
        regs.gpr[0] = 0x5000;
        let ins = Ins::new(0x80A0_0008);
        assert_eq!(Addressing::Immediate.effective_address(&regs, ins), 8);

        // lwzx r5, r3, r4
        let ins = Ins::new(0x7CA3_202E);
        assert_eq!(Addressing::Indexed.effective_address(&regs, ins), 0x1020);

        Addressing::IndexedUpdate.commit(&mut regs, ins, 0x1020);
        assert_eq!(regs.gpr[3], 0x1020);

        Addressing::Indexed.commit(&mut regs, ins, 0x2000);
        assert_eq!(regs.gpr[3], 0x1020);
    }
}
