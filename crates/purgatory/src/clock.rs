//! Injectable time source
//!
//! Breakers compare `opened_at` against the clock lazily, at evaluation time.
//! Tests drive TTL expiry with [`ManualClock`] instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

/// Clock abstraction for injectable time source.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation (production use).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
///
/// Cloning shares the underlying time, so a test can keep one handle and
/// hand another to a registry.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `time`
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(time)),
        }
    }

    /// Create a clock at a fixed test time (2026-01-15 12:00:00 UTC)
    pub fn fixed() -> Self {
        let time = Utc
            .with_ymd_and_hms(2026, 1, 15, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(time)
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let Ok(delta) = chrono::Duration::from_std(duration) else {
            return;
        };
        let mut current = self.current.write();
        if let Some(advanced) = current.checked_add_signed(delta) {
            *current = advanced;
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.write() = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::fixed()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_shared_time() {
        let clock = ManualClock::fixed();
        let handle = clock.clone();
        let start = clock.now();

        handle.advance(Duration::from_secs(61));

        assert_eq!(clock.now() - start, chrono::Duration::seconds(61));
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
