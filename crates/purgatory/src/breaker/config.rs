//! Breaker configuration and states

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BreakerError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed, failures counted
    Closed,

    /// Failure threshold reached - all calls rejected until the TTL elapses
    Open,

    /// TTL elapsed - a single trial call is in flight, everything else is rejected
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration of one named breaker
///
/// Supplied at registration and never changed afterwards. Registering the same
/// name again keeps whatever the backend already holds.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  threshold failures  ┌─────────┐   ttl elapsed   ┌──────────┐
/// │ Closed  │ ───────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                      └─────────┘                 └──────────┘
///      ▲                                ▲        trial fails        │
///      │                                └───────────────────────────┤
///      │                 trial succeeds                             │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use purgatory::BreakerConfig;
/// use std::time::Duration;
///
/// let config = BreakerConfig::new("payments")
///     .with_threshold(3)
///     .with_ttl(Duration::from_secs(60));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Unique breaker name
    pub name: String,

    /// Consecutive failures that trip the breaker
    pub threshold: u32,

    /// How long the breaker stays open before a trial call is allowed
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
}

impl BreakerConfig {
    /// Default consecutive-failure threshold
    pub const DEFAULT_THRESHOLD: u32 = 5;

    /// Default open-state cool-down
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    /// Create a configuration with default threshold and TTL
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threshold: Self::DEFAULT_THRESHOLD,
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Set the consecutive-failure threshold
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the open-state TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Reject empty names, a zero threshold and a zero TTL
    pub fn validate(&self) -> Result<(), BreakerError> {
        if self.name.trim().is_empty() {
            return Err(BreakerError::Configuration(
                "breaker name must not be empty".to_string(),
            ));
        }
        if self.threshold == 0 {
            return Err(BreakerError::Configuration(format!(
                "breaker {}: threshold must be positive",
                self.name
            )));
        }
        if self.ttl.is_zero() {
            return Err(BreakerError::Configuration(format!(
                "breaker {}: ttl must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BreakerConfig::new("svc");
        assert_eq!(config.threshold, 5);
        assert_eq!(config.ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = BreakerConfig::new("svc")
            .with_threshold(10)
            .with_ttl(Duration::from_secs(60));

        assert_eq!(config.name, "svc");
        assert_eq!(config.threshold, 10);
        assert_eq!(config.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_non_positive_values() {
        let zero_threshold = BreakerConfig::new("svc").with_threshold(0);
        assert!(matches!(
            zero_threshold.validate(),
            Err(BreakerError::Configuration(_))
        ));

        let zero_ttl = BreakerConfig::new("svc").with_ttl(Duration::ZERO);
        assert!(matches!(
            zero_ttl.validate(),
            Err(BreakerError::Configuration(_))
        ));

        let empty_name = BreakerConfig::new("  ");
        assert!(matches!(
            empty_name.validate(),
            Err(BreakerError::Configuration(_))
        ));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_serialization() {
        let config = BreakerConfig::new("svc").with_ttl(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["ttl"], 1500);
        let parsed: BreakerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }
}
