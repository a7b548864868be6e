use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of "now" for every due-date and lock-expiration comparison.
///
/// Executability is always recomputed against the current clock, so tests can
/// move time forward and backward without real sleeps.
pub trait EngineClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl EngineClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic scheduling tests.
#[derive(Debug)]
pub struct TestClock {
    current: Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock().expect("clock poisoned") = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().expect("clock poisoned");
        *current = *current + by;
    }
}

impl EngineClock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("clock poisoned")
    }
}
