//! System register moves, traps, synchronization, cache management and kernel calls.
use super::{Exec, apply_rounding_mode, float::field_mask};
use crate::{
    core::{CoreContext, Fault},
    handlers::ExecFn,
};
use espresso::{HandlerTable, Ins, InsId, SPR};
use std::sync::atomic::{Ordering, fence};

/// Processor version of the Espresso.
const PVR: u32 = 0x7001_0201;

fn mfspr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let value = match ins.spr() {
        Some(SPR::XER) => ctx.regs().xer,
        Some(SPR::LR) => ctx.regs().lr,
        Some(SPR::CTR) => ctx.regs().ctr,
        Some(SPR::SRR0) => ctx.regs().srr0,
        Some(SPR::SRR1) => ctx.regs().srr1,
        Some(SPR::TBL) => ctx.sys().time_base() as u32,
        Some(SPR::TBU) => (ctx.sys().time_base() >> 32) as u32,
        Some(SPR::PVR) => PVR,
        Some(SPR::UPIR) => ctx.id().index() as u32,
        // only GQRs remain
        Some(spr) => spr.gqr_index().map_or(0, |gqr| ctx.regs().gqr[gqr]),
        None => {
            tracing::warn!(
                core = %ctx.id(),
                cia = format_args!("{:08X}", ctx.regs().cia),
                "read from unknown spr {}",
                ins.field_spr()
            );
            0
        }
    };

    ctx.regs_mut().gpr[ins.field_rd() as usize] = value;
    Ok(())
}

fn mtspr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let (id, cia) = (ctx.id(), ctx.regs().cia);
    let value = ctx.regs().gpr[ins.field_rs() as usize];
    let regs = ctx.regs_mut();

    match ins.spr() {
        Some(SPR::XER) => regs.xer = value,
        Some(SPR::LR) => regs.lr = value,
        Some(SPR::CTR) => regs.ctr = value,
        Some(SPR::SRR0) => regs.srr0 = value,
        Some(SPR::SRR1) => regs.srr1 = value,
        Some(spr) => match spr.gqr_index() {
            Some(gqr) => regs.gqr[gqr] = value,
            None => tracing::warn!(
                core = %id,
                "ignoring write of 0x{value:08X} to read-only {spr:?}"
            ),
        },
        None => tracing::warn!(
            core = %id,
            cia = format_args!("{cia:08X}"),
            "ignoring write of 0x{value:08X} to unknown spr {}",
            ins.field_spr()
        ),
    }

    Ok(())
}

fn mftb(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let time_base = ctx.sys().time_base();
    let value = match ins.field_tbr() {
        269 => (time_base >> 32) as u32,
        _ => time_base as u32,
    };

    ctx.regs_mut().gpr[ins.field_rd() as usize] = value;
    Ok(())
}

fn mfmsr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    regs.gpr[ins.field_rd() as usize] = regs.msr;
    Ok(())
}

fn mtmsr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    regs.msr = regs.gpr[ins.field_rs() as usize];
    Ok(())
}

fn mfcr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    regs.gpr[ins.field_rd() as usize] = regs.cr;
    Ok(())
}

fn mtcrf(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let mask = field_mask(ins.field_crm());
    let value = regs.gpr[ins.field_rs() as usize];

    regs.cr = (regs.cr & !mask) | (value & mask);
    Ok(())
}

fn mfsr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    regs.gpr[ins.field_rd() as usize] = regs.sr[ins.field_sr() as usize];
    Ok(())
}

fn mfsrin(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let sr = regs.gpr[ins.field_rb() as usize] >> 28;
    regs.gpr[ins.field_rd() as usize] = regs.sr[sr as usize];
    Ok(())
}

fn mtsr(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    regs.sr[ins.field_sr() as usize] = regs.gpr[ins.field_rs() as usize];
    Ok(())
}

fn mtsrin(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs_mut();
    let sr = regs.gpr[ins.field_rb() as usize] >> 28;
    regs.sr[sr as usize] = regs.gpr[ins.field_rs() as usize];
    Ok(())
}

fn rfi(ctx: &mut CoreContext<'_>, _: Ins) -> Exec {
    let regs = ctx.regs_mut();
    regs.msr = regs.srr1;
    regs.nia = regs.srr0 & !3;
    Ok(())
}

/// Whether a trap with condition `to` is taken for `a` and `b`.
fn trap_taken(to: u8, a: u32, b: u32) -> bool {
    let (sa, sb) = (a as i32, b as i32);

    (to & 0b10000 != 0 && sa < sb)
        || (to & 0b01000 != 0 && sa > sb)
        || (to & 0b00100 != 0 && a == b)
        || (to & 0b00010 != 0 && a < b)
        || (to & 0b00001 != 0 && a > b)
}

fn tw(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let regs = ctx.regs();
    let a = regs.gpr[ins.field_ra() as usize];
    let b = regs.gpr[ins.field_rb() as usize];

    if trap_taken(ins.field_to(), a, b) {
        Err(Fault::IllegalInstruction(ins))
    } else {
        Ok(())
    }
}

fn twi(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let a = ctx.regs().gpr[ins.field_ra() as usize];
    let b = ins.field_simm() as i32 as u32;

    if trap_taken(ins.field_to(), a, b) {
        Err(Fault::IllegalInstruction(ins))
    } else {
        Ok(())
    }
}

fn kc(ctx: &mut CoreContext<'_>, ins: Ins) -> Exec {
    let Some(handler) = ctx.handlers.kernel_call.clone() else {
        return Err(Fault::IllegalInstruction(ins));
    };

    handler(ctx, ins.field_kcn());

    // host code might have changed the FPU state
    apply_rounding_mode(ctx.regs().rounding_mode());
    Ok(())
}

fn sync(_: &mut CoreContext<'_>, _: Ins) -> Exec {
    fence(Ordering::SeqCst);
    Ok(())
}

fn icbi(ctx: &mut CoreContext<'_>, _: Ins) -> Exec {
    ctx.sys().clear_instruction_cache();
    Ok(())
}

fn nop(_: &mut CoreContext<'_>, _: Ins) -> Exec {
    Ok(())
}

fn illegal(_: &mut CoreContext<'_>, ins: Ins) -> Exec {
    Err(Fault::IllegalInstruction(ins))
}

pub(super) fn register(table: &mut HandlerTable<ExecFn>) {
    let handlers: &[(InsId, ExecFn)] = &[
        (InsId::Mfspr, mfspr),
        (InsId::Mtspr, mtspr),
        (InsId::Mftb, mftb),
        (InsId::Mfmsr, mfmsr),
        (InsId::Mtmsr, mtmsr),
        (InsId::Mfcr, mfcr),
        (InsId::Mtcrf, mtcrf),
        (InsId::Mfsr, mfsr),
        (InsId::Mfsrin, mfsrin),
        (InsId::Mtsr, mtsr),
        (InsId::Mtsrin, mtsrin),
        (InsId::Rfi, rfi),
        (InsId::Tw, tw),
        (InsId::Twi, twi),
        (InsId::Kc, kc),
        (InsId::Sync, sync),
        (InsId::Eieio, sync),
        (InsId::Isync, nop),
        (InsId::Icbi, icbi),
        (InsId::Dcbf, nop),
        (InsId::Dcbi, nop),
        (InsId::Dcbst, nop),
        (InsId::Dcbt, nop),
        (InsId::Dcbtst, nop),
        (InsId::Tlbie, nop),
        (InsId::Tlbsync, nop),
        // no system calls or external control in user code
        (InsId::Invalid, illegal),
        (InsId::Sc, illegal),
        (InsId::Eciwx, illegal),
        (InsId::Ecowx, illegal),
    ];

    for &(id, handler) in handlers {
        table.register(id, handler);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, CoreId, CpuSubsystem, Memory};
    use espresso::{RoundingMode, float::round_to_single};
    use std::sync::Arc;

    #[test]
    fn trap_conditions() {
        // tw 31 traps unconditionally
        assert!(trap_taken(0b11111, 1, 2));
        assert!(trap_taken(0b11111, 2, 2));

        // signed vs unsigned less than
        assert!(trap_taken(0b10000, u32::MAX, 0));
        assert!(!trap_taken(0b00010, u32::MAX, 0));
        assert!(trap_taken(0b00001, u32::MAX, 0));

        assert!(trap_taken(0b00100, 7, 7));
        assert!(!trap_taken(0b00100, 7, 8));
        assert!(!trap_taken(0, 1, 2));
    }

    #[test]
    fn kernel_calls_restore_the_rounding_mode() {
        let sys = CpuSubsystem::initialise(Config::default(), Arc::new(Memory::new(0, 0x10)));
        sys.set_kernel_call_handler(Arc::new(|_, _| apply_rounding_mode(RoundingMode::Zero)));

        sys.with_context(CoreId::ALL[0], |ctx| {
            assert_eq!(ctx.regs().rounding_mode(), RoundingMode::Nearest);

            // kc 1
            ctx.dispatch(Ins::new(0x4400_0000 | (1 << 6) | 1)).unwrap();
        });

        // rounds up to nearest, down toward zero
        let value = std::hint::black_box(1.0 + 3.0 * 2f64.powi(-25));
        assert_eq!(round_to_single(value), 1.0 + 2f64.powi(-23));
    }
}
