//! Clock seam so cache recency and retention throttling are testable.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic time since an arbitrary fixed origin. Never goes backwards.
    fn monotonic(&self) -> Duration;
}

/// Process clock backed by `chrono::Utc` and `std::time::Instant`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

static MONOTONIC_ORIGIN: OnceLock<Instant> = OnceLock::new();

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        MONOTONIC_ORIGIN.get_or_init(Instant::now).elapsed()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Manually advanced clock for tests.
    pub struct ManualClock {
        state: Mutex<(DateTime<Utc>, Duration)>,
    }

    impl ManualClock {
        pub fn at(now: DateTime<Utc>) -> Self {
            Self {
                state: Mutex::new((now, Duration::ZERO)),
            }
        }

        pub fn advance(&self, by: Duration) {
            let mut state = self.state.lock().unwrap();
            state.0 += chrono::Duration::from_std(by).unwrap();
            state.1 += by;
        }
    }

    impl Clock for ManualClock {
        fn now_utc(&self) -> DateTime<Utc> {
            self.state.lock().unwrap().0
        }

        fn monotonic(&self) -> Duration {
            self.state.lock().unwrap().1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_monotonic_is_nondecreasing() {
        let clock = SystemClock;
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_both_faces() {
        let clock = testing::ManualClock::at(Utc::now());
        let wall = clock.now_utc();
        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now_utc() - wall).num_seconds(), 90);
        assert_eq!(clock.monotonic(), Duration::from_secs(90));
    }
}
