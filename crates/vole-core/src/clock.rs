// Clock — timing source for autotuning
//
// Autotuning compares candidates by elapsed time. Reading time through a
// trait lets tests script the measurements and check that candidate
// selection is a deterministic function of them.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall-clock time from `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that advances by a scripted step on every read.
///
/// Reads cycle through `steps`; each read returns the running total after
/// adding the next step. Handy for forcing a known timing per candidate.
#[derive(Debug)]
pub struct ScriptedClock {
    steps: Vec<Duration>,
    state: Mutex<(usize, Duration)>,
}

impl ScriptedClock {
    pub fn new(steps: Vec<Duration>) -> Self {
        ScriptedClock {
            steps,
            state: Mutex::new((0, Duration::ZERO)),
        }
    }

    /// Number of reads so far.
    pub fn reads(&self) -> usize {
        self.state.lock().map(|s| s.0).unwrap_or(0)
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> Duration {
        let Ok(mut state) = self.state.lock() else {
            return Duration::ZERO;
        };
        let step = if self.steps.is_empty() {
            Duration::ZERO
        } else {
            self.steps[state.0 % self.steps.len()]
        };
        state.0 += 1;
        state.1 += step;
        state.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_clock_cycles() {
        let c = ScriptedClock::new(vec![Duration::from_millis(1), Duration::from_millis(4)]);
        assert_eq!(c.now(), Duration::from_millis(1));
        assert_eq!(c.now(), Duration::from_millis(5));
        assert_eq!(c.now(), Duration::from_millis(6));
        assert_eq!(c.reads(), 3);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let c = MonotonicClock::new();
        let a = c.now();
        let b = c.now();
        assert!(b >= a);
    }
}
