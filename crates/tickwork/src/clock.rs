//! Injectable time source
//!
//! Every component that needs wall-clock time takes an `Arc<dyn Clock>` so
//! tests can drive schedules and lock expiry deterministically.

use chrono::{DateTime, Utc};

/// A source of "now".
///
/// Stored timestamps are always UTC; time-zone conversion happens only at
/// cron evaluation.
pub trait Clock: Send + Sync + 'static {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually-advanced clock for tests.
///
/// Starts at the given instant and only moves when `set` or `advance` is
/// called, which keeps due-scans and lock TTLs deterministic.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::RwLock::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write() = instant;
    }

    /// Move forward by `delta`.
    pub fn advance(&self, delta: std::time::Duration) {
        let mut now = self.now.write();
        *now = *now + crate::util::to_chrono(delta);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
