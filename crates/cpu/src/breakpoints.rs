//! Process wide instruction breakpoints.
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

/// How long a breakpoint stays armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointMode {
    /// Removed the first time it is hit.
    SingleFire,
    /// Stays until explicitly removed.
    MultiFire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: u32,
    pub mode: BreakpointMode,
    /// The instruction at the address when the breakpoint was added, if it was readable.
    pub original: Option<u32>,
}

/// A set of breakpoints, at most one per address.
#[derive(Default)]
pub struct Breakpoints {
    entries: Mutex<FxHashMap<u32, Breakpoint>>,
    any: AtomicBool,
}

impl Breakpoints {
    fn with<R>(&self, f: impl FnOnce(&mut FxHashMap<u32, Breakpoint>) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut entries);
        self.any.store(!entries.is_empty(), Ordering::Release);

        result
    }

    /// Adds a breakpoint, replacing any existing one at the same address.
    pub fn add(&self, addr: u32, mode: BreakpointMode, original: Option<u32>) {
        self.with(|entries| {
            entries.insert(
                addr,
                Breakpoint {
                    addr,
                    mode,
                    original,
                },
            )
        });
    }

    /// Removes the breakpoint at `addr`, if any.
    pub fn remove(&self, addr: u32) -> Option<Breakpoint> {
        self.with(|entries| entries.remove(&addr))
    }

    pub fn has(&self, addr: u32) -> bool {
        self.any() && self.with(|entries| entries.contains_key(&addr))
    }

    /// Whether any breakpoint is armed. Does not lock.
    #[inline(always)]
    pub fn any(&self) -> bool {
        self.any.load(Ordering::Acquire)
    }

    /// Returns whether there is a breakpoint at `addr`, removing it if it is single fire.
    pub fn pop(&self, addr: u32) -> bool {
        if !self.any() {
            return false;
        }

        self.with(|entries| match entries.get(&addr) {
            Some(bp) if bp.mode == BreakpointMode::SingleFire => {
                entries.remove(&addr);
                true
            }
            Some(_) => true,
            None => false,
        })
    }

    /// All breakpoints, ordered by address.
    pub fn list(&self) -> Vec<Breakpoint> {
        let mut list = self.with(|entries| entries.values().copied().collect::<Vec<_>>());
        list.sort_by_key(|bp| bp.addr);
        list
    }

    pub fn clear(&self) {
        self.with(|entries| entries.clear());
    }
}
