//! Registry configuration
//!
//! Configuration is usually built in code:
//!
//! ```
//! use std::time::Duration;
//! use purgatory::{BackendErrorPolicy, RegistryConfig};
//!
//! let config = RegistryConfig::default()
//!     .with_default_threshold(3)
//!     .with_default_ttl(Duration::from_secs(60))
//!     .with_on_backend_error(BackendErrorPolicy::FailOpen);
//! assert_eq!(config.default_threshold, 3);
//! ```
//!
//! or read from `PURGATORY_*` environment variables with
//! [`RegistryConfig::from_env`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::breaker::{duration_millis, BreakerConfig};
use crate::error::BreakerError;

/// What a guarded call does when the backend cannot be read or updated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorPolicy {
    /// Surface [`BreakerError::Backend`] and do not run the work
    #[default]
    FailClosed,

    /// Run the work unguarded and record nothing
    FailOpen,
}

impl FromStr for BackendErrorPolicy {
    type Err = BreakerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            "fail_open" | "open" => Ok(Self::FailOpen),
            other => Err(BreakerError::Configuration(format!(
                "unknown backend error policy: {other}"
            ))),
        }
    }
}

/// Registry-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Threshold for breakers looked up without explicit registration
    pub default_threshold: u32,

    /// TTL for breakers looked up without explicit registration
    #[serde(with = "duration_millis")]
    pub default_ttl: Duration,

    /// Where breaker records live
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub on_backend_error: BackendErrorPolicy,

    /// Most recent events the registry's event log keeps; unbounded if `None`
    #[serde(default)]
    pub event_capacity: Option<usize>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_threshold: BreakerConfig::DEFAULT_THRESHOLD,
            default_ttl: BreakerConfig::DEFAULT_TTL,
            backend: BackendKind::default(),
            on_backend_error: BackendErrorPolicy::default(),
            event_capacity: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_default_threshold(mut self, threshold: u32) -> Self {
        self.default_threshold = threshold;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_on_backend_error(mut self, policy: BackendErrorPolicy) -> Self {
        self.on_backend_error = policy;
        self
    }

    pub fn with_event_capacity(mut self, capacity: Option<usize>) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Configuration for a breaker registered with the registry defaults
    pub fn breaker_defaults(&self, name: impl Into<String>) -> BreakerConfig {
        BreakerConfig::new(name)
            .with_threshold(self.default_threshold)
            .with_ttl(self.default_ttl)
    }

    /// Create configuration from environment variables
    ///
    /// - `PURGATORY_BACKEND`: `memory` (default) or `redis`
    /// - `PURGATORY_REDIS_URL`: required when the backend is `redis`
    /// - `PURGATORY_DEFAULT_THRESHOLD`: positive integer
    /// - `PURGATORY_DEFAULT_TTL_SECS`: positive number of seconds
    /// - `PURGATORY_ON_BACKEND_ERROR`: `fail_closed` (default) or `fail_open`
    /// - `PURGATORY_EVENT_CAPACITY`: events kept in memory (default unbounded)
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self, BreakerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), loading a `.env` file first if present
    pub fn from_dotenv() -> Result<Self, BreakerError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded environment file");
        }
        Self::from_env()
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, BreakerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(threshold) = parse_var::<u32>(&lookup, "PURGATORY_DEFAULT_THRESHOLD")? {
            config.default_threshold = threshold;
        }
        if let Some(secs) = parse_var::<f64>(&lookup, "PURGATORY_DEFAULT_TTL_SECS")? {
            config.default_ttl = Duration::try_from_secs_f64(secs).map_err(|e| {
                BreakerError::Configuration(format!("PURGATORY_DEFAULT_TTL_SECS: {e}"))
            })?;
        }
        if let Some(policy) = lookup("PURGATORY_ON_BACKEND_ERROR") {
            config.on_backend_error = policy.parse()?;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "PURGATORY_EVENT_CAPACITY")? {
            config.event_capacity = Some(capacity);
        }

        let backend = lookup("PURGATORY_BACKEND").unwrap_or_else(|| "memory".to_string());
        config.backend = match backend.trim().to_lowercase().as_str() {
            "memory" => BackendKind::Memory,
            "redis" => {
                let url = lookup("PURGATORY_REDIS_URL").ok_or_else(|| {
                    BreakerError::Configuration(
                        "PURGATORY_REDIS_URL must be set for the redis backend".to_string(),
                    )
                })?;
                BackendKind::Redis { url }
            }
            other => {
                return Err(BreakerError::Configuration(format!(
                    "unknown backend: {other}"
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the defaults would produce valid breakers
    pub fn validate(&self) -> Result<(), BreakerError> {
        if self.default_threshold == 0 {
            return Err(BreakerError::Configuration(
                "default threshold must be positive".to_string(),
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(BreakerError::Configuration(
                "default ttl must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, BreakerError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key}={raw}"))
        .map(Some)
        .map_err(|e| BreakerError::Configuration(format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.default_threshold, 5);
        assert_eq!(config.default_ttl, Duration::from_secs(30));
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.on_backend_error, BackendErrorPolicy::FailClosed);
        assert_eq!(config.event_capacity, None);
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = RegistryConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RegistryConfig::default());
    }

    #[test]
    fn test_from_environment() {
        let config = RegistryConfig::from_lookup(lookup(&[
            ("PURGATORY_BACKEND", "redis"),
            ("PURGATORY_REDIS_URL", "redis://cache:6379/0"),
            ("PURGATORY_DEFAULT_THRESHOLD", "3"),
            ("PURGATORY_DEFAULT_TTL_SECS", "1.5"),
            ("PURGATORY_ON_BACKEND_ERROR", "fail_open"),
            ("PURGATORY_EVENT_CAPACITY", "1000"),
        ]))
        .unwrap();

        assert_eq!(
            config.backend,
            BackendKind::Redis {
                url: "redis://cache:6379/0".to_string()
            }
        );
        assert_eq!(config.default_threshold, 3);
        assert_eq!(config.default_ttl, Duration::from_millis(1500));
        assert_eq!(config.on_backend_error, BackendErrorPolicy::FailOpen);
        assert_eq!(config.event_capacity, Some(1000));
    }

    #[test]
    fn test_invalid_values() {
        let cases: &[&[(&str, &str)]] = &[
            &[("PURGATORY_DEFAULT_THRESHOLD", "many")],
            &[("PURGATORY_DEFAULT_THRESHOLD", "0")],
            &[("PURGATORY_DEFAULT_TTL_SECS", "-1")],
            &[("PURGATORY_ON_BACKEND_ERROR", "sometimes")],
            &[("PURGATORY_BACKEND", "etcd")],
            &[("PURGATORY_BACKEND", "redis")],
            &[("PURGATORY_EVENT_CAPACITY", "-5")],
        ];
        for vars in cases {
            let result = RegistryConfig::from_lookup(lookup(vars));
            assert!(
                matches!(result, Err(BreakerError::Configuration(_))),
                "expected configuration error for {vars:?}"
            );
        }
    }

    #[test]
    fn test_parse_error_names_variable() {
        let err = RegistryConfig::from_lookup(lookup(&[("PURGATORY_DEFAULT_THRESHOLD", "x")]))
            .unwrap_err();
        assert!(err.to_string().contains("PURGATORY_DEFAULT_THRESHOLD=x"));
    }

    #[test]
    fn test_breaker_defaults() {
        let config = RegistryConfig::default()
            .with_default_threshold(2)
            .with_default_ttl(Duration::from_secs(5));
        let breaker = config.breaker_defaults("search");
        assert_eq!(breaker.name, "search");
        assert_eq!(breaker.threshold, 2);
        assert_eq!(breaker.ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_serde() {
        let config = RegistryConfig::default().with_on_backend_error(BackendErrorPolicy::FailOpen);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["default_ttl"], 30_000);
        assert_eq!(json["on_backend_error"], "fail_open");
        assert_eq!(json["backend"]["type"], "memory");
        assert!(json["event_capacity"].is_null());

        let parsed: RegistryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
