mod common;

use common::{ENTRY, config, system, wait_until};
use cpu::{
    BreakpointMode, CoreId, JitMode,
    interrupts::{ALARM, DBG_BREAK, GENERIC, IPC, SRESET},
};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

#[test]
fn alarms_reach_their_cores() {
    let sys = system(&[], config(JitMode::Disabled));
    let serviced = Arc::new(Mutex::new(Vec::new()));

    sys.set_interrupt_handler(Arc::new({
        let serviced = serviced.clone();
        move |ctx, flags| serviced.lock().unwrap().push((ctx.id(), flags, Instant::now()))
    }));

    sys.set_core_entrypoint_handler(Arc::new(|ctx| {
        while !ctx.is_reset() {
            ctx.wait_for_interrupt();
        }
    }));

    sys.start().unwrap();

    let start = Instant::now();
    sys.set_next_alarm(CoreId::ALL[0], Some(start + Duration::from_millis(10)));
    sys.set_next_alarm(CoreId::ALL[1], Some(start + Duration::from_millis(5)));

    let alarms = || {
        serviced
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, flags, _)| flags & ALARM != 0)
            .map(|&(id, _, at)| (id, at))
            .collect::<Vec<_>>()
    };

    wait_until("both alarms fire", || alarms().len() == 2);

    let alarms = alarms();
    let at = |core| {
        alarms
            .iter()
            .find(|&&(id, _)| id == core)
            .map(|&(_, at)| at - start)
    };

    assert!(at(CoreId::ALL[1]).unwrap() >= Duration::from_millis(5));
    assert!(at(CoreId::ALL[0]).unwrap() >= Duration::from_millis(10));
    assert_eq!(at(CoreId::ALL[2]), None);

    assert_eq!(sys.next_alarm(CoreId::ALL[0]), None);
    assert_eq!(sys.next_alarm(CoreId::ALL[1]), None);

    sys.halt();
    sys.join();

    // every core saw the reset
    let serviced = serviced.lock().unwrap();
    for id in CoreId::ALL {
        assert!(
            serviced
                .iter()
                .any(|&(core, flags, _)| core == id && flags & SRESET != 0)
        );
    }
}

#[test]
fn masked_interrupts_stay_pending() {
    let sys = system(&[], config(JitMode::Disabled));
    let serviced = Arc::new(Mutex::new(Vec::new()));

    sys.set_interrupt_handler(Arc::new({
        let serviced = serviced.clone();
        move |_, flags| serviced.lock().unwrap().push(flags)
    }));

    let core = CoreId::ALL[0];
    sys.with_context(core, |ctx| {
        let previous = ctx.set_interrupt_mask(GENERIC);
        assert_eq!(previous, cpu::interrupts::ALL);

        ctx.sys().interrupt(ctx.id(), IPC);
        ctx.check_interrupts();
        assert!(serviced.lock().unwrap().is_empty());

        ctx.sys().interrupt(ctx.id(), GENERIC);
        ctx.check_interrupts();
        assert_eq!(*serviced.lock().unwrap(), vec![GENERIC]);

        ctx.set_interrupt_mask(GENERIC | IPC);
        ctx.check_interrupts();
        assert_eq!(*serviced.lock().unwrap(), vec![GENERIC, IPC]);
    });
}

#[test]
fn breakpoints_raise_dbg_break_everywhere() {
    let sys = system(&[0x6000_0000], config(JitMode::Disabled));
    let serviced = Arc::new(Mutex::new(Vec::new()));

    sys.set_interrupt_handler(Arc::new({
        let serviced = serviced.clone();
        move |ctx, flags| serviced.lock().unwrap().push((ctx.id(), flags))
    }));

    sys.add_breakpoint(ENTRY, BreakpointMode::MultiFire);
    for _ in 0..2 {
        sys.with_context(CoreId::ALL[0], |ctx| {
            ctx.regs_mut().nia = ENTRY;
            ctx.check_interrupts();
        });
    }

    assert!(sys.has_breakpoint(ENTRY));

    // the other cores have it pending
    for id in CoreId::ALL[1..].iter().copied() {
        sys.with_context(id, |ctx| ctx.check_interrupts());
    }

    let serviced = serviced.lock().unwrap();
    assert_eq!(
        serviced
            .iter()
            .filter(|&&(id, flags)| id == CoreId::ALL[0] && flags == DBG_BREAK)
            .count(),
        2
    );
    assert!(serviced.contains(&(CoreId::ALL[1], DBG_BREAK)));
    assert!(serviced.contains(&(CoreId::ALL[2], DBG_BREAK)));
}

#[test]
#[should_panic(expected = "every interrupt disabled")]
fn waiting_with_everything_masked() {
    let sys = system(&[], config(JitMode::Disabled));
    sys.with_context(CoreId::ALL[2], |ctx| {
        ctx.set_interrupt_mask(0);
        ctx.wait_for_interrupt();
    });
}
