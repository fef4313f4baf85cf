mod common;

use common::{ENTRY, system, wait_until};
use cpu::{BreakpointMode, Config, CoreId, CpuSubsystem, Exit, JitMode, interrupts::DBG_BREAK};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

const LOOP: [u32; 2] = [
    0x3863_0001, // addi r3, r3, 1
    0x4BFF_FFFC, // b -4
];

/// Starts every core spinning in [`LOOP`] until halted. Returns how each core left `resume`.
fn spinning(mode: JitMode) -> (Arc<CpuSubsystem>, Arc<Mutex<Vec<(CoreId, Exit)>>>) {
    let sys = system(
        &LOOP,
        Config {
            jit_mode: mode,
            ..Default::default()
        },
    );

    let exits = Arc::new(Mutex::new(Vec::new()));
    sys.set_core_entrypoint_handler(Arc::new({
        let exits = exits.clone();
        move |ctx| {
            ctx.regs_mut().nia = ENTRY;
            let exit = ctx.resume();
            exits.lock().unwrap().push((ctx.id(), exit));
        }
    }));

    sys.start().unwrap();
    (sys, exits)
}

/// Starts core 0 spinning in [`LOOP`] while the other cores wait for interrupts. The interrupt
/// handler checks for interrupts again after every pause.
fn spinning_alone() -> (Arc<CpuSubsystem>, Arc<Mutex<Vec<(CoreId, Exit)>>>) {
    let sys = system(&LOOP, Config::default());

    sys.set_interrupt_handler(Arc::new(|ctx, flags| {
        if flags & DBG_BREAK != 0 {
            ctx.check_interrupts();
        }
    }));

    let exits = Arc::new(Mutex::new(Vec::new()));
    sys.set_core_entrypoint_handler(Arc::new({
        let exits = exits.clone();
        move |ctx| {
            let exit = if ctx.id() == CoreId::ALL[0] {
                ctx.regs_mut().nia = ENTRY;
                ctx.resume()
            } else {
                while !ctx.is_reset() {
                    ctx.wait_for_interrupt();
                }

                Exit::Reset
            };

            exits.lock().unwrap().push((ctx.id(), exit));
        }
    }));

    sys.start().unwrap();
    (sys, exits)
}

fn shutdown(sys: &CpuSubsystem, exits: &Mutex<Vec<(CoreId, Exit)>>) {
    sys.halt();
    sys.join();

    let mut exits = exits.lock().unwrap().clone();
    exits.sort_by_key(|(id, _)| *id);
    assert_eq!(exits, CoreId::ALL.map(|id| (id, Exit::Reset)).to_vec());
}

/// Whether any core paused right before executing `addr`.
fn paused_at(sys: &CpuSubsystem, addr: u32) -> bool {
    CoreId::ALL
        .into_iter()
        .filter_map(|id| sys.paused_context(id))
        .any(|regs| regs.nia == addr)
}

fn in_loop(nia: u32) -> bool {
    nia == ENTRY || nia == ENTRY + 4
}

#[test]
fn pause_stops_every_core() {
    for mode in [JitMode::Disabled, JitMode::Enabled] {
        let (sys, exits) = spinning(mode);

        for _ in 0..3 {
            assert!(!sys.is_paused());
            assert_eq!(sys.paused_context(CoreId::ALL[0]), None);

            sys.pause();
            wait_until("every core is paused", || sys.is_paused());

            assert!(sys.pause_initiator().is_some());
            for id in CoreId::ALL {
                let regs = sys.paused_context(id).unwrap();
                assert!(in_loop(regs.nia), "{id} paused at 0x{:08X}", regs.nia);
            }

            // counters do not move while paused
            let before = CoreId::ALL.map(|id| sys.paused_context(id).unwrap().gpr[3]);
            std::thread::sleep(std::time::Duration::from_millis(5));
            let after = CoreId::ALL.map(|id| sys.paused_context(id).unwrap().gpr[3]);
            assert_eq!(before, after);

            assert!(sys.resume());
            assert!(!sys.resume());
        }

        shutdown(&sys, &exits);
    }
}

#[test]
fn breakpoint_pauses_every_core() {
    let (sys, exits) = spinning(JitMode::Enabled);

    sys.add_breakpoint(ENTRY + 4, BreakpointMode::SingleFire);
    wait_until("a core hits the breakpoint", || sys.is_paused());

    // consumed by the core that hit it
    assert!(!sys.has_breakpoints());

    assert!(sys.pause_initiator().is_some());
    assert!(paused_at(&sys, ENTRY + 4));

    assert!(sys.resume());
    shutdown(&sys, &exits);
}

#[test]
fn stepping() {
    let (sys, exits) = spinning(JitMode::Disabled);

    sys.pause();
    wait_until("every core is paused", || sys.is_paused());

    let core = CoreId::ALL[1];
    let nia = sys.paused_context(core).unwrap().nia;
    let expected = if nia == ENTRY { ENTRY + 4 } else { ENTRY };

    assert!(sys.step_into(core));
    wait_until("the step completes", || sys.is_paused());

    // some core stopped at the step target, not necessarily the one that stepped
    assert!(paused_at(&sys, expected));
    assert!(!sys.has_breakpoints());

    // the loop branch has no link, so stepping over it follows it
    let nia = sys.paused_context(core).unwrap().nia;
    let expected = if nia == ENTRY { ENTRY + 4 } else { ENTRY };
    assert!(sys.step_over(core));
    wait_until("the step completes", || sys.is_paused());

    assert!(paused_at(&sys, expected));

    assert!(sys.resume());
    assert!(!sys.step_into(core));
    shutdown(&sys, &exits);
}

#[test]
fn multi_fire_breakpoint_stops_once_per_visit() {
    let (sys, exits) = spinning_alone();
    let core = CoreId::ALL[0];

    sys.add_breakpoint(ENTRY + 4, BreakpointMode::MultiFire);
    for counter in 1..=5 {
        wait_until("core 0 hits the breakpoint", || sys.is_paused());

        let regs = sys.paused_context(core).unwrap();
        assert_eq!(regs.nia, ENTRY + 4);
        assert_eq!(regs.gpr[3], counter);
        assert_eq!(sys.pause_initiator(), Some(core));
        assert!(sys.has_breakpoint(ENTRY + 4));

        assert!(sys.resume());
    }

    // stepping off the breakpoint follows the branch
    wait_until("core 0 hits the breakpoint", || sys.is_paused());
    assert!(sys.step_into(core));
    wait_until("the step completes", || sys.is_paused());

    let regs = sys.paused_context(core).unwrap();
    assert_eq!(regs.nia, ENTRY);
    assert_eq!(regs.gpr[3], 6);

    assert!(sys.resume());
    wait_until("core 0 hits the breakpoint", || sys.is_paused());

    let regs = sys.paused_context(core).unwrap();
    assert_eq!(regs.nia, ENTRY + 4);
    assert_eq!(regs.gpr[3], 7);

    sys.remove_breakpoint(ENTRY + 4);
    assert!(sys.resume());
    shutdown(&sys, &exits);
}

#[test]
fn pauses_are_all_or_nothing() {
    let (sys, exits) = spinning(JitMode::Enabled);

    for _ in 0..20 {
        std::thread::scope(|s| {
            let observer = s.spawn(|| {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !sys.is_paused() {
                    assert!(Instant::now() < deadline, "timed out waiting for the pause");
                    std::hint::spin_loop();
                }

                assert!(sys.pause_initiator().is_some());
                for id in CoreId::ALL {
                    assert!(sys.paused_context(id).is_some(), "{id} has no context");
                }
            });

            sys.pause();
            observer.join().unwrap();
        });

        assert!(sys.resume());
    }

    shutdown(&sys, &exits);
}
