use chrono::Utc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time source for everything that measures or compares time.
///
/// The breaker, watchdog, idle sweep and lifecycle classifier all take a
/// clock so tests can drive a [ManualClock] instead of sleeping.
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch
    fn now_unix(&self) -> i64;

    /// Monotonic reading since clock construction
    fn monotonic(&self) -> Duration;
}

/// Wall clock backed by [Utc] / [Instant]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Manually driven clock for deterministic timing tests
pub struct ManualClock {
    state: Mutex<(i64, Duration)>,
}

impl ManualClock {
    pub fn new(start_unix: i64) -> Self {
        Self {
            state: Mutex::new((start_unix, Duration::ZERO)),
        }
    }

    /// Move both the wall and monotonic reading forward
    pub fn advance(&self, d: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 += d.as_secs() as i64;
        state.1 += d;
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.state.lock().unwrap().0
    }

    fn monotonic(&self) -> Duration {
        self.state.lock().unwrap().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_unix(), 1_000);
        assert_eq!(clock.monotonic(), Duration::ZERO);

        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now_unix(), 1_030);
        assert_eq!(clock.monotonic(), Duration::from_secs(30));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
        assert!(clock.now_unix() > 1_500_000_000);
    }
}
