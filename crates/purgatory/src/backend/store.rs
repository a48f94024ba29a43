//! BreakerBackend trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::breaker::{BreakerConfig, BreakerRecord, CircuitState};

/// State a conditional update expects to find
///
/// Both fields must match. Comparing `opened_at` as well as `state` keeps a
/// caller holding a stale read of an earlier Open period from winning a swap
/// against a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedState {
    pub state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
}

impl ExpectedState {
    /// Expect exactly what `record` shows
    pub fn of(record: &BreakerRecord) -> Self {
        Self {
            state: record.state,
            opened_at: record.opened_at,
        }
    }
}

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The store could not be reached or refused the command
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A stored document could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No record exists for this breaker
    #[error("breaker not found: {0}")]
    NotFound(String),

    /// The backend cannot be built from the settings it was given
    #[error("invalid backend settings: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Store for breaker records
///
/// Every mutation of a [`BreakerRecord`] goes through these verbs. The state
/// machine never reads a value, changes it and writes it back; it relies on
/// `inc_failures` and `compare_and_set_state` being atomic in the backend.
/// Implementations must be thread-safe and support concurrent access,
/// including from several processes when the store is shared.
#[async_trait]
pub trait BreakerBackend: Send + Sync + 'static {
    /// Identifier used in logs (`"memory"`, `"redis"`, ...)
    fn kind(&self) -> &'static str;

    /// Get a copy of the record, or `None` if the name was never registered
    async fn get(&self, name: &str) -> Result<Option<BreakerRecord>, BackendError>;

    /// Create a Closed record if none exists
    ///
    /// Returns `true` if this call created it. An existing record is left
    /// untouched, whatever its configuration or state.
    async fn register(&self, config: &BreakerConfig) -> Result<bool, BackendError>;

    /// Overwrite `state` and `opened_at`
    async fn update_state(
        &self,
        name: &str,
        state: CircuitState,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError>;

    /// Overwrite `state` and `opened_at` only if the record still matches `expected`
    ///
    /// Returns whether the swap happened. Used to guarantee that exactly one
    /// caller wins each transition.
    async fn compare_and_set_state(
        &self,
        name: &str,
        expected: ExpectedState,
        state: CircuitState,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<bool, BackendError>;

    /// Atomically add one to the failure counter, returning the new value
    async fn inc_failures(&self, name: &str) -> Result<u32, BackendError>;

    /// Atomically set the failure counter to zero
    async fn reset_failures(&self, name: &str) -> Result<(), BackendError>;
}
