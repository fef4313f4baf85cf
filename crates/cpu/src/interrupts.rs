//! Interrupt flags and per-core signalling.
use std::sync::{
    Condvar, Mutex,
    atomic::{AtomicU32, Ordering},
};

/// Stops the core: the current `resume` returns and the core thread exits.
pub const SRESET: u32 = 1 << 0;
pub const GENERIC: u32 = 1 << 1;
/// The alarm programmed with `set_next_alarm` has elapsed.
pub const ALARM: u32 = 1 << 2;
/// Enters the debugger pause barrier.
pub const DBG_BREAK: u32 = 1 << 3;
pub const GPU7_RETIRE: u32 = 1 << 4;
pub const GPU7_FLIP: u32 = 1 << 5;
pub const IPC: u32 = 1 << 6;

/// Interrupts that are delivered regardless of the mask.
pub const NONMASKABLE: u32 = SRESET | DBG_BREAK;
/// Every interrupt a core can receive.
pub const ALL: u32 = SRESET | GENERIC | ALARM | DBG_BREAK | GPU7_RETIRE | GPU7_FLIP | IPC;

/// Interrupt state of a single core.
///
/// Pending flags may be raised from any thread, but only the owning core takes them.
pub(crate) struct Signals {
    pending: AtomicU32,
    mask: AtomicU32,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            pending: AtomicU32::new(0),
            mask: AtomicU32::new(ALL),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }
}

impl Signals {
    /// Raises `flags` and wakes the core if it is waiting for an interrupt.
    pub fn raise(&self, flags: u32) {
        self.pending.fetch_or(flags, Ordering::AcqRel);

        // taking the lock orders this notification after the waiter's check
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wake.notify_all();
    }

    #[inline(always)]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn mask(&self) -> u32 {
        self.mask.load(Ordering::Acquire)
    }

    /// The mask, with nonmaskable interrupts always included.
    #[inline(always)]
    pub fn effective_mask(&self) -> u32 {
        self.mask.load(Ordering::Acquire) | NONMASKABLE
    }

    /// Sets the mask, returning the previous one.
    pub fn set_mask(&self, mask: u32) -> u32 {
        self.mask.swap(mask, Ordering::AcqRel)
    }

    /// Clears and returns the pending flags in `mask`.
    #[inline(always)]
    pub fn take(&self, mask: u32) -> u32 {
        self.pending.fetch_and(!mask, Ordering::AcqRel) & mask
    }

    /// Clears `flags` without returning them.
    pub fn clear(&self, flags: u32) {
        self.pending.fetch_and(!flags, Ordering::AcqRel);
    }

    /// Blocks until a flag in `mask` is pending.
    pub fn wait(&self, mask: u32) {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.pending() & mask == 0 {
            guard = self.wake.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}
