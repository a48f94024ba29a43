//! Persisted breaker state

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BreakerConfig, CircuitState};

/// Durable state of one breaker, as held by a backend
///
/// Callers only ever see copies. Every mutation goes through the backend
/// verbs (`register`, `update_state`, `compare_and_set_state`,
/// `inc_failures`, `reset_failures`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRecord {
    pub name: String,
    pub threshold: u32,
    pub ttl: Duration,
    pub state: CircuitState,
    /// Set when the breaker opens, kept through HalfOpen, cleared on Closed
    pub opened_at: Option<DateTime<Utc>>,
    /// Consecutive failures while Closed
    pub failure_count: u32,
}

impl BreakerRecord {
    /// Fresh Closed record for a newly registered breaker
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            name: config.name.clone(),
            threshold: config.threshold,
            ttl: config.ttl,
            state: CircuitState::Closed,
            opened_at: None,
            failure_count: 0,
        }
    }

    /// Whether an Open breaker has cooled down long enough for a trial call
    pub fn ttl_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.open_for(now).is_some_and(|elapsed| elapsed >= self.ttl)
    }

    /// Whether a HalfOpen breaker's trial call should be written off
    ///
    /// The trial was admitted once `ttl` had elapsed since `opened_at`. If
    /// another `ttl` passes without an outcome, the process holding it died
    /// or could not record it.
    pub fn trial_expired(&self, now: DateTime<Utc>) -> bool {
        self.open_for(now)
            .is_some_and(|elapsed| elapsed >= self.ttl.saturating_mul(2))
    }

    fn open_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let opened_at = self.opened_at?;
        Some(
            now.signed_duration_since(opened_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Consecutive failures that count towards the threshold
    ///
    /// Only meaningful while Closed. A failure recorded concurrently with a
    /// trip can land after the trip reset the counter; it is not reported.
    pub fn effective_failure_count(&self) -> u32 {
        match self.state {
            CircuitState::Closed => self.failure_count,
            CircuitState::Open | CircuitState::HalfOpen => 0,
        }
    }

    /// Settings the record was registered with
    pub fn config(&self) -> BreakerConfig {
        BreakerConfig::new(self.name.clone())
            .with_threshold(self.threshold)
            .with_ttl(self.ttl)
    }

    /// Read-only view for health checks
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            name: self.name.clone(),
            state: self.state,
            failure_count: self.effective_failure_count(),
            opened_at: self.opened_at,
        }
    }
}

/// Introspection view returned by `BreakerRegistry::get_state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_record_is_closed() {
        let record = BreakerRecord::new(&BreakerConfig::new("svc").with_threshold(3));
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.threshold, 3);
        assert!(record.opened_at.is_none());
    }

    #[test]
    fn test_ttl_elapsed() {
        let opened_at = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let mut record =
            BreakerRecord::new(&BreakerConfig::new("svc").with_ttl(Duration::from_secs(60)));
        assert!(!record.ttl_elapsed(opened_at));

        record.state = CircuitState::Open;
        record.opened_at = Some(opened_at);

        assert!(!record.ttl_elapsed(opened_at + chrono::Duration::seconds(10)));
        assert!(record.ttl_elapsed(opened_at + chrono::Duration::seconds(60)));
        assert!(record.ttl_elapsed(opened_at + chrono::Duration::seconds(61)));
        // clock skew between processes must not count as elapsed
        assert!(!record.ttl_elapsed(opened_at - chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_trial_expired() {
        let opened_at = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let mut record =
            BreakerRecord::new(&BreakerConfig::new("svc").with_ttl(Duration::from_secs(60)));
        record.state = CircuitState::HalfOpen;
        record.opened_at = Some(opened_at);

        assert!(!record.trial_expired(opened_at + chrono::Duration::seconds(60)));
        assert!(!record.trial_expired(opened_at + chrono::Duration::seconds(119)));
        assert!(record.trial_expired(opened_at + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_snapshot_hides_stray_count_outside_closed() {
        let mut record = BreakerRecord::new(&BreakerConfig::new("svc").with_threshold(3));
        record.failure_count = 2;
        assert_eq!(record.snapshot().failure_count, 2);

        record.state = CircuitState::Open;
        record.opened_at = Some(Utc::now());
        assert_eq!(record.effective_failure_count(), 0);
        assert_eq!(record.snapshot().failure_count, 0);
    }

    #[test]
    fn test_config_round_trips_settings() {
        let config = BreakerConfig::new("svc")
            .with_threshold(4)
            .with_ttl(Duration::from_secs(9));
        assert_eq!(BreakerRecord::new(&config).config(), config);
    }
}
