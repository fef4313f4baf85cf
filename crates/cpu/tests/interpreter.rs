mod common;

use common::{ENTRY, config, system};
use cpu::{CoreId, Fault, InsId, JitMode, Registers};
use nanorand::{Rng, WyRand};
use std::sync::{Arc, Mutex};

/// Interprets `code` one instruction at a time on core 0, after `setup` prepared the registers.
/// Stops at the first fault.
fn run(code: &[u32], setup: impl FnOnce(&mut Registers)) -> (Registers, Result<(), Fault>) {
    let sys = system(code, config(JitMode::Disabled));
    sys.with_context(CoreId::ALL[0], |ctx| {
        setup(ctx.regs_mut());
        ctx.regs_mut().nia = ENTRY;

        let result = (0..code.len()).try_for_each(|_| ctx.execute_one().map(|_| ()));
        (ctx.regs().clone(), result)
    })
}

#[test]
fn add_overflow() {
    // addo. r5, r3, r4
    let (regs, result) = run(&[0x7CA3_2615], |regs| {
        regs.gpr[3] = 0x7FFF_FFFF;
        regs.gpr[4] = 1;
    });

    assert_eq!(result, Ok(()));
    assert_eq!(regs.gpr[5], 0x8000_0000);
    // SO and OV set, CA untouched
    assert_eq!(regs.xer, 0xC000_0000);
    // LT and SO in CR0
    assert_eq!(regs.cr, 0x9000_0000);
}

#[test]
fn subtract_from_carry() {
    // subfc r5, r3, r4
    let (regs, _) = run(&[0x7CA3_2010], |_| ());
    assert_eq!(regs.gpr[5], 0);
    assert_eq!(regs.xer, 0x2000_0000);

    let (regs, _) = run(&[0x7CA3_2010], |regs| {
        regs.gpr[3] = 7;
        regs.gpr[4] = 5;
    });
    assert_eq!(regs.gpr[5], (-2i32) as u32);
    assert_eq!(regs.xer, 0);
}

#[test]
fn record_changes_one_field() {
    let mut rng = WyRand::new_seed(0xC0FF_EE);
    for _ in 0..256 {
        let value = if rng.generate_range(0..4u32) == 0 {
            0
        } else {
            rng.generate::<u32>()
        };
        let cr = rng.generate::<u32>();
        let so = rng.generate::<bool>();

        // or. r3, r4, r4
        let (regs, _) = run(&[0x7C83_2379], |regs| {
            regs.gpr[4] = value;
            regs.cr = cr;
            regs.xer = if so { 0x8000_0000 } else { 0 };
        });

        let expected = match (value as i32).signum() {
            -1 => 0x8,
            1 => 0x4,
            _ => 0x2,
        } | so as u32;

        assert_eq!(regs.gpr[3], value);
        assert_eq!(regs.cr >> 28, expected, "or. with 0x{value:08X}");
        assert_eq!(regs.cr & 0x0FFF_FFFF, cr & 0x0FFF_FFFF);
    }
}

#[test]
fn register_branch_targets_are_aligned() {
    // blr
    let (regs, _) = run(&[0x4E80_0020], |regs| regs.lr = 0x0200_2003);
    assert_eq!(regs.nia, 0x0200_2000);

    // bctrl
    let (regs, _) = run(&[0x4E80_0421], |regs| regs.ctr = 0x0200_3007);
    assert_eq!(regs.nia, 0x0200_3004);
    assert_eq!(regs.lr, ENTRY + 4);
}

#[test]
fn fetch_out_of_range() {
    let sys = system(&[], config(JitMode::Disabled));
    let result = sys.with_context(CoreId::ALL[1], |ctx| {
        ctx.regs_mut().nia = 0x1000;
        ctx.execute_one()
    });

    assert_eq!(result, Err(Fault::AccessViolation(0x1000)));
}

#[test]
fn faulting_load_keeps_registers() {
    // lwz r3, 0x10(r4)
    let (regs, result) = run(&[0x8064_0010], |regs| {
        regs.gpr[3] = 0xDEAD;
        regs.gpr[4] = 0x8000_0000;
    });

    assert_eq!(result, Err(Fault::AccessViolation(0x8000_0010)));
    assert_eq!(regs.gpr[3], 0xDEAD);
}

#[test]
fn loads_and_stores() {
    let code = [
        0x9064_0000u32, // stw r3, 0(r4)
        0xA0A4_0002,    // lhz r5, 2(r4)
        0xA8C4_0000,    // lha r6, 0(r4)
        0x7CE0_242C,    // lwbrx r7, 0, r4
        0x9464_0008,    // stwu r3, 8(r4)
    ];

    let (regs, result) = run(&code, |regs| {
        regs.gpr[3] = 0x8123_4567;
        regs.gpr[4] = ENTRY + 0x100;
    });

    assert_eq!(result, Ok(()));
    assert_eq!(regs.gpr[5], 0x4567);
    assert_eq!(regs.gpr[6], 0xFFFF_8123);
    assert_eq!(regs.gpr[7], 0x6745_2381);
    assert_eq!(regs.gpr[4], ENTRY + 0x108);
}

#[test]
fn illegal_instruction() {
    let (_, result) = run(&[0x0000_0000], |_| ());
    assert!(matches!(result, Err(Fault::IllegalInstruction(ins)) if ins.id == InsId::Invalid));

    // tw 4, r3, r3 traps on equality
    let (regs, result) = run(&[0x7C83_1808], |_| ());
    assert!(matches!(result, Err(Fault::IllegalInstruction(ins)) if ins.id == InsId::Tw));
    assert_eq!(regs.nia, ENTRY + 4);
}

#[test]
fn kernel_calls_reach_the_handler() {
    // kc 0x123
    let sys = system(&[0x4400_0000 | (0x123 << 6) | 1], config(JitMode::Disabled));

    let calls = Arc::new(Mutex::new(Vec::new()));
    sys.set_kernel_call_handler(Arc::new({
        let calls = calls.clone();
        move |ctx, id| calls.lock().unwrap().push((ctx.id(), id, ctx.regs().cia))
    }));

    sys.with_context(CoreId::ALL[2], |ctx| {
        ctx.regs_mut().nia = ENTRY;
        ctx.execute_one().unwrap();
    });

    assert_eq!(*calls.lock().unwrap(), vec![(CoreId::ALL[2], 0x123, ENTRY)]);
}

#[test]
fn paired_singles_load_quantized() {
    let code = [
        0x3C60_0104u32, // lis r3, 0x0104 (load u8, scale 1)
        0x7C70_E3A6,    // mtspr GQR0, r3
        0x3CA0_8010,    // lis r5, 0x8010
        0x90A4_0000,    // stw r5, 0(r4)
        0xE024_0000,    // psq_l f1, 0(r4), 0, 0
        0xE044_8000,    // psq_l f2, 0(r4), 1, 0
    ];

    let (regs, result) = run(&code, |regs| regs.gpr[4] = ENTRY + 0x100);

    assert_eq!(result, Ok(()));
    assert_eq!(regs.gqr[0], 0x0104_0000);
    assert_eq!(regs.fpr[1], [64.0, 8.0]);
    assert_eq!(regs.fpr[2], [64.0, 1.0]);
}
