use std::io;
use std::time::Instant;

/// Source of monotonic timestamps for timed tasks.
///
/// Deadlines passed to `schedule_task_future` are interpreted against
/// the clock the loop was built with. A failed read is not fatal: the
/// loop skips timed tasks for that iteration and waits with its default
/// timeout instead.
pub trait Clock: Send + Sync {
    /// Returns the current time in nanoseconds.
    fn now_ns(&self) -> io::Result<u64>;
}

/// Default [`Clock`] backed by [`Instant`], measuring from the moment
/// the clock was created.
#[derive(Debug, Copy, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose zero point is "now".
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> io::Result<u64> {
        Ok(self.origin.elapsed().as_nanos() as u64)
    }
}
