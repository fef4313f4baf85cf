//! Debugger pause barrier: every core stops together and resumes together.
//!
//! Pausing has two phases. Cores arriving with DBG_BREAK publish a snapshot of their registers and
//! mark themselves in the pausing mask; the first one to arrive is the pause initiator and
//! forwards DBG_BREAK to the other two before marking itself, the last one completes the pause. Once resumed, every
//! core marks itself in the resuming mask and waits at a rendezvous so that none of them runs
//! guest code before all three have left the barrier.
use crate::{
    core::{CORE_COUNT, CoreContext, CoreId},
    interpreter,
    interrupts::DBG_BREAK,
    memory::Memory,
};
use espresso::{Ins, Registers};
use std::sync::{
    Barrier, Condvar, Mutex,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Mask with the bit of every core set.
const ALL_CORES: u32 = (1 << CORE_COUNT) - 1;

#[derive(Default)]
struct Paused {
    initiator: Option<CoreId>,
    snapshots: [Option<Registers>; CORE_COUNT],
}

/// State of the pause barrier.
pub(crate) struct DebugState {
    paused: AtomicBool,
    pausing: AtomicU32,
    resuming: AtomicU32,
    state: Mutex<Paused>,
    /// Incremented on every resume.
    generation: Mutex<u64>,
    resumed: Condvar,
    rendezvous: Barrier,
}

impl Default for DebugState {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(false),
            pausing: AtomicU32::new(0),
            resuming: AtomicU32::new(0),
            state: Mutex::new(Paused::default()),
            generation: Mutex::new(0),
            resumed: Condvar::new(),
            rendezvous: Barrier::new(CORE_COUNT),
        }
    }
}

impl DebugState {
    fn state(&self) -> std::sync::MutexGuard<'_, Paused> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enters the barrier with the core of `ctx`, returning once the debugger has resumed execution
    /// and every core has left.
    pub fn enter(&self, ctx: &mut CoreContext<'_>) {
        let id = ctx.id();
        debug_assert_eq!(
            ctx.sys().live_cores(),
            CORE_COUNT,
            "{id} entered the debug barrier without every core running"
        );

        let generation = self.generation();

        // the snapshot must be visible before this core counts as paused
        let initiating = {
            let mut state = self.state();
            state.snapshots[id.index()] = Some(ctx.regs().clone());
            *state.initiator.get_or_insert(id) == id
        };

        if initiating {
            tracing::debug!(core = %id, "initiating pause");
            for other in id.others() {
                ctx.sys().interrupt(other, DBG_BREAK);
            }
        }

        // the initiator marks itself after forwarding, so a complete pause has no forward in flight
        let previous = self.pausing.fetch_or(id.bit(), Ordering::AcqRel);
        if previous | id.bit() == ALL_CORES {
            self.pausing.store(0, Ordering::Release);
            self.resuming.store(0, Ordering::Release);
            self.paused.store(true, Ordering::Release);
            tracing::info!(core = %id, "every core paused");
        }

        let mut current = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        while *current == generation {
            current = self
                .resumed
                .wait(current)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(current);

        // DBG_BREAK may have been forwarded to this core after it arrived
        ctx.sys().signals(id).clear(DBG_BREAK);

        self.resuming.fetch_or(id.bit(), Ordering::AcqRel);
        if self.rendezvous.wait().is_leader() {
            tracing::debug!(
                resuming = format_args!("{:#b}", self.resuming.load(Ordering::Acquire)),
                "every core resumed"
            );
        }
    }

    /// Releases the paused cores. Returns whether they were paused.
    pub fn resume(&self) -> bool {
        if !self.paused.swap(false, Ordering::AcqRel) {
            return false;
        }

        *self.state() = Paused::default();

        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        self.resumed.notify_all();

        tracing::info!("resuming every core");
        true
    }

    #[inline(always)]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn initiator(&self) -> Option<CoreId> {
        if !self.is_paused() {
            return None;
        }

        self.state().initiator
    }

    pub fn snapshot(&self, core: CoreId) -> Option<Registers> {
        if !self.is_paused() {
            return None;
        }

        self.state().snapshots[core.index()].clone()
    }
}

/// Where a single step from `regs` should stop.
///
/// Branches stop at their target if taken under `regs`. With `over`, calls (branches with LK set)
/// stop at the instruction after them instead.
pub(crate) fn step_target(memory: &Memory, regs: &Registers, over: bool) -> u32 {
    let next = regs.nia.wrapping_add(4);
    match memory.read::<u32>(regs.nia).map(Ins::new) {
        Some(ins) if over && ins.id.is_branch() && ins.field_lk() => next,
        Some(ins) => interpreter::taken_target(regs, ins).unwrap_or(next),
        None => next,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, CpuSubsystem};
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    fn regs_at(nia: u32) -> Registers {
        Registers {
            nia,
            ..Default::default()
        }
    }

    #[test]
    fn step_targets() {
        let memory = Memory::new(0x1000, 0x100);
        assert!(memory.load_words(
            0x1000,
            &[
                0x3860_0005, // addi r3, r0, 5
                0x4800_0011, // bl +0x10
                0x4182_0008, // beq +8
                0x4E80_0020, // blr
            ],
        ));

        assert_eq!(step_target(&memory, &regs_at(0x1000), false), 0x1004);

        // calls are followed by step into and skipped by step over
        assert_eq!(step_target(&memory, &regs_at(0x1004), false), 0x1014);
        assert_eq!(step_target(&memory, &regs_at(0x1004), true), 0x1008);

        // not taken without EQ
        assert_eq!(step_target(&memory, &regs_at(0x1008), false), 0x100C);
        let mut regs = regs_at(0x1008);
        regs.cr = 0x2000_0000;
        assert_eq!(step_target(&memory, &regs, false), 0x1010);

        let mut regs = regs_at(0x100C);
        regs.lr = 0x2003;
        assert_eq!(step_target(&memory, &regs, true), 0x2000);

        // unreadable instruction
        assert_eq!(step_target(&memory, &regs_at(0x4000), false), 0x4004);
    }

    #[test]
    fn resume_when_running_is_a_noop() {
        let debug = DebugState::default();
        assert!(!debug.is_paused());
        assert!(!debug.resume());
        assert_eq!(debug.initiator(), None);
        assert_eq!(debug.snapshot(CoreId::ALL[0]), None);
    }

    #[test]
    fn cores_leave_the_barrier_together() {
        let sys = CpuSubsystem::initialise(Config::default(), Arc::new(Memory::new(0, 0x10)));
        sys.live.store(CORE_COUNT, Ordering::Release);

        let leaving = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for id in CoreId::ALL {
                let (sys, leaving) = (&sys, &leaving);
                s.spawn(move || {
                    sys.with_context(id, |ctx| sys.debug().enter(ctx));

                    // what this core saw right after the rendezvous
                    let resuming = sys.debug().resuming.load(Ordering::Acquire);
                    leaving.lock().unwrap().push((id, resuming));
                });
            }

            let start = Instant::now();
            while !sys.is_paused() {
                assert!(start.elapsed() < Duration::from_secs(10), "cores never paused");
                std::thread::yield_now();
            }

            assert!(sys.pause_initiator().is_some());
            assert!(CoreId::ALL.iter().all(|&id| sys.paused_context(id).is_some()));
            assert!(sys.resume());
        });

        let leaving = leaving.into_inner().unwrap();
        assert_eq!(leaving.len(), CORE_COUNT);
        for (id, resuming) in leaving {
            assert_eq!(resuming, ALL_CORES, "{id} left before every core resumed");
        }

        // forwarded breaks do not outlive the pause
        for id in CoreId::ALL {
            assert_eq!(sys.signals(id).pending() & DBG_BREAK, 0, "{id}");
        }
        assert!(!sys.is_paused());
    }
}
