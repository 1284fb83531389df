//! A binary latch usable across threads, the suspension point application-facing blocking
//! operations are built on.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of [`Event::wait_for`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The event was set before the deadline.
    NoTimeout,
    /// The deadline elapsed first.
    Timeout,
}

/// A set/reset binary latch. `set()` releases every thread currently or subsequently blocked in
/// `wait`/`wait_for`, until the next `reset()`.
///
/// Guarantees no spurious wake-ups: a waiter only returns once `set()` has actually been observed
/// (or its deadline elapsed), never early.
pub struct Event {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    /// A new event, initially reset.
    pub fn new() -> Self {
        Event { state: Mutex::new(false), cv: Condvar::new() }
    }

    /// Latch the event, waking every current and future waiter until the next `reset`.
    pub fn set(&self) {
        let mut state = self.state.lock();
        if !*state {
            *state = true;
            self.cv.notify_all();
        }
    }

    /// Clear the latch; subsequent waiters block again.
    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    /// Whether the latch is currently set, without blocking.
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Block until the latch is set.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cv.wait(&mut state);
        }
    }

    /// Block until the latch is set or `timeout` elapses, whichever comes first.
    pub fn wait_for(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !*state {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitResult::Timeout;
            }
            let timed_out = self.cv.wait_for(&mut state, remaining).timed_out();
            if timed_out && !*state {
                return WaitResult::Timeout;
            }
        }
        WaitResult::NoTimeout
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_immediately_if_already_set() {
        let event = Event::new();
        event.set();
        event.wait();
    }

    #[test]
    fn wait_for_times_out_when_never_set() {
        let event = Event::new();
        assert_eq!(event.wait_for(Duration::from_millis(20)), WaitResult::Timeout);
    }

    #[test]
    fn wait_for_observes_a_set_from_another_thread() {
        let event = Arc::new(Event::new());
        let setter = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        assert_eq!(event.wait_for(Duration::from_secs(5)), WaitResult::NoTimeout);
        handle.join().unwrap();
    }

    #[test]
    fn reset_makes_a_set_event_block_again() {
        let event = Event::new();
        event.set();
        event.reset();
        assert_eq!(event.wait_for(Duration::from_millis(20)), WaitResult::Timeout);
    }
}
