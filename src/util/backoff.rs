//! Idle backoff for workers polling an empty queue.

use std::thread;
use std::time::Duration;

/// Yield-then-nap backoff.
///
/// The first `yield_limit` steps hand the processor back to the OS; after
/// that each step sleeps for a short nap so an idle pool does not pin a core.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    yield_limit: u32,
}

impl Backoff {
    const NAP: Duration = Duration::from_micros(200);

    pub fn new(yield_limit: u32) -> Self {
        Self {
            step: 0,
            yield_limit,
        }
    }

    /// Reset the backoff to its initial state
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Perform one step of backoff
    pub fn snooze(&mut self) {
        if self.step < self.yield_limit {
            self.step += 1;
            thread::yield_now();
        } else {
            thread::sleep(Self::NAP);
        }
    }

    /// Check if we've reached the nap phase
    pub fn is_napping(&self) -> bool {
        self.step >= self.yield_limit
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(16)
    }
}
