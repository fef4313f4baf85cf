mod common;

use common::{ENTRY, call_entry, config, system};
use cpu::{CoreId, Exit, JitMode, Registers};
use nanorand::{Rng, WyRand};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
};

const ADD_PROGRAM: [u32; 5] = [
    0x3860_0005, // addi r3, r0, 5
    0x3880_0007, // addi r4, r0, 7
    0x7CA3_2214, // add r5, r3, r4
    0x4400_0001, // kc 0
    0x4E80_0020, // blr
];

/// Starts every core on `code`, returning the registers seen by each kernel call and how each
/// core left `resume`.
fn run_threads(code: &[u32], mode: JitMode) -> (Vec<(CoreId, Registers)>, Vec<(CoreId, Exit)>) {
    let sys = system(code, config(mode));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let exits = Arc::new(Mutex::new(Vec::new()));

    sys.set_kernel_call_handler(Arc::new({
        let calls = calls.clone();
        move |ctx, _| calls.lock().unwrap().push((ctx.id(), ctx.regs().clone()))
    }));

    sys.set_core_entrypoint_handler(Arc::new({
        let exits = exits.clone();
        move |ctx| {
            call_entry(ctx);
            let exit = ctx.resume();
            exits.lock().unwrap().push((ctx.id(), exit));
        }
    }));

    sys.start().unwrap();
    sys.join();

    let calls = std::mem::take(&mut *calls.lock().unwrap());
    let exits = std::mem::take(&mut *exits.lock().unwrap());
    (calls, exits)
}

#[test]
fn add_program_on_every_core() {
    for mode in [JitMode::Disabled, JitMode::Enabled] {
        let (mut calls, mut exits) = run_threads(&ADD_PROGRAM, mode);
        calls.sort_by_key(|(id, _)| *id);
        exits.sort_by_key(|(id, _)| *id);

        assert_eq!(
            exits,
            CoreId::ALL.map(|id| (id, Exit::Callback)).to_vec(),
            "{mode:?}"
        );

        assert_eq!(calls.len(), 3, "{mode:?}");
        for (id, regs) in calls {
            assert_eq!(regs.gpr[5], 12, "{id} {mode:?}");
            assert_eq!(regs.cia, ENTRY + 12, "{id} {mode:?}");
            assert_eq!(regs.cr, 0);
            assert_eq!(regs.xer, 0);
        }
    }
}

#[test]
fn start_twice() {
    let sys = system(&ADD_PROGRAM, config(JitMode::Disabled));
    sys.set_core_entrypoint_handler(Arc::new(|_| ()));

    sys.start().unwrap();
    assert!(matches!(sys.start(), Err(cpu::StartError::AlreadyStarted)));
    sys.join();
}

/// Runs `code` through `resume` on core 0 with the given mode, starting from `regs`.
fn resume_with(code: &[u32], mode: JitMode, inputs: &[Registers]) -> Vec<Registers> {
    let sys = system(code, config(mode));
    let outputs = inputs
        .iter()
        .map(|regs| {
            sys.with_context(CoreId::ALL[0], |ctx| {
                *ctx.regs_mut() = regs.clone();
                call_entry(ctx);
                assert_eq!(ctx.resume(), Exit::Callback);
                ctx.regs().clone()
            })
        })
        .collect();

    if mode == JitMode::Enabled {
        // one block, compiled once
        assert_eq!(sys.cached_blocks(), 1);
        assert_eq!(sys.compiled_blocks(), 1);
    }

    outputs
}

#[test]
fn jit_matches_interpreter() {
    let code = [
        0x7CA3_2215, // add. r5, r3, r4
        0x7CC3_2010, // subfc r6, r3, r4
        0x7CE5_3114, // adde r7, r5, r6
        0x7D03_21D6, // mullw r8, r3, r4
        0x7D23_2396, // divwu r9, r3, r4
        0x546A_2037, // rlwinm. r10, r3, 4, 0, 27
        0x7C6B_1E70, // srawi r11, r3, 3
        0x7C85_3000, // cmpw cr1, r5, r6
        0xFC22_182A, // fadd f1, f2, f3
        0xEC82_00F2, // fmuls f4, f2, f3
        0xFCA2_1828, // fsub f5, f2, f3
        0xFCC2_08FA, // fmadd f6, f2, f3, f1
        0x4E80_0020, // blr
    ];

    let mut rng = WyRand::new_seed(0x0E5_9E55);
    let mut inputs: Vec<_> = (0..64)
        .map(|_| {
            let mut regs = Registers::default();
            regs.gpr[3] = rng.generate();
            regs.gpr[4] = rng.generate::<u32>() | 1;
            regs.xer = rng.generate::<u32>() & 0xE000_0000;

            let float = |rng: &mut WyRand| (rng.generate::<u32>() as i32) as f64 / 3.0;
            regs.fpr[2][0] = float(&mut rng);
            regs.fpr[3][0] = float(&mut rng);

            regs
        })
        .collect();

    // multipliers that need normalizing or carry into infinity when narrowed to 24 bits
    let edges = [
        (2f64.powi(1000), f64::from_bits(1)),
        (-2f64.powi(900), f64::from_bits(0x000F_FFFF_FFFF_FFFF)),
        (2f64.powi(-1000), f64::MAX),
        (f64::from_bits(3), -f64::MAX),
    ];
    inputs.extend(edges.map(|(a, c)| {
        let mut regs = Registers::default();
        regs.gpr[3] = 3;
        regs.gpr[4] = 1;
        regs.fpr[2][0] = a;
        regs.fpr[3][0] = c;
        regs
    }));

    let interpreted = resume_with(&code, JitMode::Disabled, &inputs);
    let compiled = resume_with(&code, JitMode::Enabled, &inputs);

    // fmuls f4 of 2^-1000 by f64::MAX
    assert_eq!(interpreted[66].fpr[4][0], 2f64.powi(24) as f32 as f64);

    for (interpreted, compiled) in interpreted.iter().zip(&compiled) {
        assert_eq!(interpreted.gpr, compiled.gpr);
        assert_eq!(interpreted.cr, compiled.cr);
        assert_eq!(interpreted.xer, compiled.xer);
        assert_eq!(interpreted.fpscr, compiled.fpscr);

        for (a, b) in interpreted.fpr.iter().zip(&compiled.fpr) {
            assert_eq!(a.map(f64::to_bits), b.map(f64::to_bits));
        }
    }
}

#[test]
fn segfault_handler_receives_the_address() {
    let code = [
        0x8064_0000, // lwz r3, 0(r4)
        0x4E80_0020, // blr
    ];

    for mode in [JitMode::Disabled, JitMode::Enabled] {
        let sys = system(&code, config(mode));
        let faults = Arc::new(Mutex::new(Vec::new()));

        sys.set_segfault_handler(Arc::new({
            let faults = faults.clone();
            move |ctx, addr| {
                faults.lock().unwrap().push((addr, ctx.regs().cia));
                panic!("segfault");
            }
        }));

        let result = catch_unwind(AssertUnwindSafe(|| {
            sys.with_context(CoreId::ALL[0], |ctx| {
                ctx.regs_mut().gpr[4] = 0x10;
                call_entry(ctx);
                ctx.resume()
            })
        }));

        assert!(result.is_err(), "{mode:?}");
        assert_eq!(*faults.lock().unwrap(), vec![(0x10, ENTRY)], "{mode:?}");
    }
}

#[test]
fn illegal_instructions_are_skipped() {
    let code = [
        0x3860_0001, // addi r3, r0, 1
        0x0000_0000, // invalid
        0x3860_0002, // addi r3, r0, 2
        0x4E80_0020, // blr
    ];

    for mode in [JitMode::Disabled, JitMode::Enabled] {
        let sys = system(&code, config(mode));
        let illegal = Arc::new(Mutex::new(Vec::new()));

        sys.set_illegal_instruction_handler(Arc::new({
            let illegal = illegal.clone();
            move |ctx, ins| illegal.lock().unwrap().push((ctx.regs().cia, ins.raw))
        }));

        let r3 = sys.with_context(CoreId::ALL[0], |ctx| {
            call_entry(ctx);
            assert_eq!(ctx.resume(), Exit::Callback);
            ctx.regs().gpr[3]
        });

        assert_eq!(r3, 2, "{mode:?}");
        assert_eq!(*illegal.lock().unwrap(), vec![(ENTRY + 4, 0)], "{mode:?}");
    }
}

#[test]
fn clearing_the_cache_recompiles() {
    let sys = system(&ADD_PROGRAM[..3], config(JitMode::Enabled));
    assert!(sys.memory().load_words(ENTRY + 12, &[0x4E80_0020]));

    let run = || {
        sys.with_context(CoreId::ALL[0], |ctx| {
            call_entry(ctx);
            ctx.resume();
            ctx.regs().gpr[5]
        })
    };

    assert_eq!(run(), 12);

    // addi r4, r0, 8
    assert!(sys.memory().write(ENTRY + 4, 0x3880_0008u32));
    assert_eq!(run(), 12);

    sys.clear_instruction_cache();
    assert_eq!(sys.cached_blocks(), 0);
    assert_eq!(run(), 13);
    assert_eq!(sys.compiled_blocks(), 2);
}
