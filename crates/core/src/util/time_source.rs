use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Where timers in the overlay read the current time from.
pub trait TimeSource {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Clone, Copy, Default, Debug)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock. Clones share the same current instant, so a test can
/// hand one clone to the code under test and advance the other.
#[derive(Clone, Debug)]
pub struct MockTimeSource {
    current_instant: Arc<Mutex<Instant>>,
}

impl MockTimeSource {
    pub fn new(start_instant: Instant) -> Self {
        MockTimeSource {
            current_instant: Arc::new(Mutex::new(start_instant)),
        }
    }

    pub fn advance_time(&self, duration: Duration) {
        *self.current_instant.lock() += duration;
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Instant {
        *self.current_instant.lock()
    }
}
