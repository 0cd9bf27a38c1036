//! How much wall-clock time the race may still use.

use core::fmt::Debug;
use std::time::{Duration, Instant};

/// Reports the time left for the surrounding test.
///
/// [`RacePair`](crate::RacePair) records the remaining time on every reset
/// and compares later readings against it to decide when to stop sampling
/// and when to stop racing altogether.
pub trait TimeBudget: Debug + Send + Sync {
    fn remaining(&self) -> Duration;
}

/// A fixed amount of time, counted from construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    runtime: Duration,
}

impl Deadline {
    #[must_use]
    pub fn after(runtime: Duration) -> Self {
        Self {
            start: Instant::now(),
            runtime,
        }
    }
}

impl TimeBudget for Deadline {
    fn remaining(&self) -> Duration {
        self.runtime.saturating_sub(self.start.elapsed())
    }
}
