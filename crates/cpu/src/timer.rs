//! The alarm timer thread.
use crate::core::{CORE_COUNT, CoreId};
use std::{
    sync::{Condvar, Mutex},
    time::Instant,
};

#[derive(Default)]
struct State {
    deadlines: [Option<Instant>; CORE_COUNT],
    running: bool,
}

/// Per-core alarm deadlines, served by a single thread.
#[derive(Default)]
pub(crate) struct Timer {
    state: Mutex<State>,
    changed: Condvar,
}

impl Timer {
    /// Sets the alarm of `core` and wakes the timer thread so it picks up the new deadline.
    pub fn set_deadline(&self, core: CoreId, deadline: Option<Instant>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.deadlines[core.index()] = deadline;
        self.changed.notify_all();
    }

    pub fn deadline(&self, core: CoreId) -> Option<Instant> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.deadlines[core.index()]
    }

    /// Marks the timer as running. Must be called before the thread executing [`Timer::run`] is
    /// spawned.
    pub fn arm(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).running = true;
    }

    /// Makes [`Timer::run`] return.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.running = false;
        self.changed.notify_all();
    }

    /// Timer thread body. Calls `fire` for every core whose deadline has passed, resetting the
    /// deadline, until [`Timer::stop`] is called.
    pub fn run(&self, mut fire: impl FnMut(CoreId)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.running {
            let now = Instant::now();
            let mut next: Option<Instant> = None;

            for core in CoreId::ALL {
                match state.deadlines[core.index()] {
                    Some(deadline) if deadline <= now => {
                        state.deadlines[core.index()] = None;
                        tracing::trace!(%core, "alarm elapsed");
                        fire(core);
                    }
                    Some(deadline) => next = Some(next.map_or(deadline, |n| n.min(deadline))),
                    None => (),
                }
            }

            state = match next {
                Some(next) => {
                    let timeout = next.saturating_duration_since(Instant::now());
                    self.changed
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self.changed.wait(state).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        sync::{Arc, mpsc},
        thread,
        time::Duration,
    };

    #[test]
    fn fires_in_deadline_order() {
        let timer = Arc::new(Timer::default());
        timer.arm();

        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn({
            let timer = timer.clone();
            move || timer.run(|core| tx.send(core).unwrap())
        });

        let now = Instant::now();
        timer.set_deadline(CoreId::ALL[0], Some(now + Duration::from_millis(10)));
        timer.set_deadline(CoreId::ALL[1], Some(now + Duration::from_millis(5)));

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, CoreId::ALL[1]);
        assert_eq!(second, CoreId::ALL[0]);
        assert!(now.elapsed() >= Duration::from_millis(10));

        for core in CoreId::ALL {
            assert_eq!(timer.deadline(core), None);
        }

        timer.stop();
        thread.join().unwrap();
    }

    #[test]
    fn stop_wakes_idle_thread() {
        let timer = Arc::new(Timer::default());
        timer.arm();

        let thread = thread::spawn({
            let timer = timer.clone();
            move || timer.run(|_| unreachable!())
        });

        thread::sleep(Duration::from_millis(5));
        timer.stop();
        thread.join().unwrap();
    }
}
