//! One-shot and periodic callback timers, the cooperative-scheduling primitive CAN-TP's state
//! machines are built on (`N_As`/`N_Ar`/`N_Bs`/`N_Cr`, and the inter-CF `STmin` pacing).

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    /// Bumped on every `start`/`stop`; a running worker compares its captured generation against
    /// the current one before invoking the callback or rescheduling, so a stale worker from a
    /// previous `start` can never fire after the timer has moved on.
    generation: u64,
    running: bool,
}

/// A cancelable, restartable callback timer.
///
/// `start` spawns a dedicated worker thread that sleeps for `duration`, fires the callback, and
/// (if `periodic`) repeats. `stop` is idempotent and may be called while a callback is in flight;
/// it guarantees no *further* callback fires, not that an in-flight one is interrupted.
pub struct Timer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// A new timer, not yet running.
    pub fn new() -> Self {
        Timer {
            shared: Arc::new(Shared {
                state: Mutex::new(State { generation: 0, running: false }),
                cv: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Schedule `callback` to run after `duration`, repeating every `duration` if `periodic`.
    /// Replaces any previously scheduled firing (as if `stop` had been called first).
    pub fn start<F>(&self, duration: Duration, periodic: bool, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        self.stop();

        let my_generation = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.running = true;
            state.generation
        };

        let shared = self.shared.clone();
        let join = thread::spawn(move || loop {
            let mut state = shared.state.lock();
            if state.generation != my_generation {
                return;
            }
            let result = shared.cv.wait_for(&mut state, duration);
            if state.generation != my_generation || !state.running {
                return;
            }
            let timed_out = result.timed_out();
            drop(state);

            if !timed_out {
                // Woken by `stop` re-checking generation above; nothing to fire this round.
                continue;
            }

            callback();

            if !periodic {
                let mut state = shared.state.lock();
                if state.generation == my_generation {
                    state.running = false;
                }
                return;
            }
        });

        *self.handle.lock() = Some(join);
    }

    /// Stop any scheduled firing. Idempotent; safe to call whether or not the timer is running,
    /// and safe to call from within the timer's own callback.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.running = false;
        }
        self.shared.cv.notify_all();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Whether a firing is currently scheduled.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    #[test]
    fn one_shot_fires_once() {
        let timer = Timer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        timer.start(Duration::from_millis(10), false, move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[test]
    fn periodic_fires_repeatedly_until_stopped() {
        let timer = Timer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        timer.start(Duration::from_millis(10), true, move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(55));
        timer.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several firings, got {fired}");
        sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), fired, "no firing after stop");
    }

    #[test]
    fn stop_before_first_firing_prevents_it() {
        let timer = Timer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        timer.start(Duration::from_millis(50), false, move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();
        sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restarting_replaces_the_previous_schedule() {
        let timer = Timer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        timer.start(Duration::from_millis(200), false, {
            let counted = counted.clone();
            move || {
                counted.fetch_add(100, Ordering::SeqCst);
            }
        });
        timer.start(Duration::from_millis(10), false, move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(260));
        assert_eq!(count.load(Ordering::SeqCst), 1, "stale schedule must not also fire");
    }
}
