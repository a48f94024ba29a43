//! In-memory implementation of BreakerBackend

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::store::*;
use crate::breaker::{BreakerConfig, BreakerRecord, CircuitState};

/// Process-local breaker store
///
/// Records live in one map guarded by a lock. Each verb takes the lock once
/// and never across an await point, so concurrent tasks cannot lose counter
/// updates and breakers never starve each other.
///
/// # Example
///
/// ```
/// use purgatory::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// assert_eq!(backend.len(), 0);
/// ```
pub struct InMemoryBackend {
    breakers: RwLock<HashMap<String, BreakerRecord>>,
}

impl InMemoryBackend {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Number of registered breakers
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker has been registered
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Drop all records (for testing)
    pub fn clear(&self) {
        self.breakers.write().clear();
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BreakerBackend for InMemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, name: &str) -> Result<Option<BreakerRecord>, BackendError> {
        Ok(self.breakers.read().get(name).cloned())
    }

    async fn register(&self, config: &BreakerConfig) -> Result<bool, BackendError> {
        let mut breakers = self.breakers.write();
        if breakers.contains_key(&config.name) {
            debug!(breaker = %config.name, "breaker already registered");
            return Ok(false);
        }
        breakers.insert(config.name.clone(), BreakerRecord::new(config));
        Ok(true)
    }

    async fn update_state(
        &self,
        name: &str,
        state: CircuitState,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        let mut breakers = self.breakers.write();
        let record = breakers
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        record.state = state;
        record.opened_at = opened_at;
        Ok(())
    }

    async fn compare_and_set_state(
        &self,
        name: &str,
        expected: ExpectedState,
        state: CircuitState,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<bool, BackendError> {
        let mut breakers = self.breakers.write();
        let record = breakers
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        if ExpectedState::of(record) != expected {
            return Ok(false);
        }
        record.state = state;
        record.opened_at = opened_at;
        Ok(true)
    }

    async fn inc_failures(&self, name: &str) -> Result<u32, BackendError> {
        let mut breakers = self.breakers.write();
        let record = breakers
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        record.failure_count = record.failure_count.saturating_add(1);
        Ok(record.failure_count)
    }

    async fn reset_failures(&self, name: &str) -> Result<(), BackendError> {
        let mut breakers = self.breakers.write();
        let record = breakers
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        record.failure_count = 0;
        Ok(())
    }
}
