//! Key-value layout shared by external store backends
//!
//! Each breaker occupies two keys:
//!
//! ```text
//! breaker:<name>                 → {"name":..,"threshold":..,"ttl":..,"state":..,"opened_at":..}
//! breaker:<name>:failure_count   → integer, mutated only by INCR / SET 0
//! ```
//!
//! The counter lives apart from the document so that concurrent failure
//! reports from many processes use the store's native increment instead of
//! rewriting the JSON. `ttl` and `opened_at` are stored as float seconds
//! (`opened_at` since the Unix epoch).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::store::*;
use crate::breaker::{BreakerConfig, BreakerRecord, CircuitState};

/// Attempts at a conditional swap before conceding to concurrent writers
const MAX_SWAP_ATTEMPTS: usize = 8;

/// Minimal command set a shared store must offer
///
/// Every method maps to a single atomic command on the server.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Identifier used in logs
    fn kind(&self) -> &'static str;

    /// Read several keys at once (`MGET`)
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError>;

    /// Unconditional write (`SET`)
    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Write only if the key does not exist (`SET NX`)
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, BackendError>;

    /// Write `new` only if the current value equals `expected`
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, BackendError>;

    /// Atomic increment by one, creating the key at zero first (`INCR`)
    async fn incr(&self, key: &str) -> Result<i64, BackendError>;
}

/// Structural fields of a breaker as stored under `breaker:<name>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct BreakerDocument {
    name: String,
    threshold: u32,
    ttl: f64,
    state: CircuitState,
    opened_at: Option<f64>,
}

impl BreakerDocument {
    fn from_config(config: &BreakerConfig) -> Self {
        Self {
            name: config.name.clone(),
            threshold: config.threshold,
            ttl: config.ttl.as_secs_f64(),
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    fn into_record(self, failure_count: u32) -> BreakerRecord {
        BreakerRecord {
            name: self.name,
            threshold: self.threshold,
            ttl: Duration::try_from_secs_f64(self.ttl).unwrap_or(Duration::ZERO),
            state: self.state,
            opened_at: self.opened_at.and_then(seconds_to_datetime),
            failure_count,
        }
    }
}

fn datetime_to_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn seconds_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
}

fn document_key(name: &str) -> String {
    format!("breaker:{name}")
}

fn counter_key(name: &str) -> String {
    format!("breaker:{name}:failure_count")
}

fn parse_counter(raw: Option<&str>) -> Result<u32, BackendError> {
    match raw {
        None => Ok(0),
        Some(raw) => {
            let value: i64 = raw.trim().parse().map_err(|_| {
                BackendError::Serialization(format!("failure counter is not an integer: {raw}"))
            })?;
            Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
        }
    }
}

/// Breaker backend over any [`KeyValueStore`]
///
/// # Example
///
/// ```ignore
/// use purgatory::backend::{KvBackend, RedisKeyValueStore};
///
/// let store = RedisKeyValueStore::connect("redis://localhost:6379").await?;
/// let backend = KvBackend::new(store);
/// ```
pub struct KvBackend<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> KvBackend<S> {
    /// Wrap a key-value store
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Get a reference to the underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn load_document(
        &self,
        name: &str,
    ) -> Result<Option<(String, BreakerDocument)>, BackendError> {
        let mut values = self.store.get_many(&[document_key(name)]).await?;
        match values.pop().flatten() {
            Some(raw) => {
                let document = serde_json::from_str(&raw)?;
                Ok(Some((raw, document)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: KeyValueStore> BreakerBackend for KvBackend<S> {
    fn kind(&self) -> &'static str {
        self.store.kind()
    }

    #[instrument(skip(self), fields(backend = self.store.kind()))]
    async fn get(&self, name: &str) -> Result<Option<BreakerRecord>, BackendError> {
        let values = self
            .store
            .get_many(&[document_key(name), counter_key(name)])
            .await?;
        let mut values = values.into_iter();
        let document = values.next().flatten();
        let counter = values.next().flatten();

        let Some(raw) = document else {
            return Ok(None);
        };
        let document: BreakerDocument = serde_json::from_str(&raw)?;
        let failure_count = parse_counter(counter.as_deref())?;
        Ok(Some(document.into_record(failure_count)))
    }

    #[instrument(skip(self, config), fields(breaker = %config.name, backend = self.store.kind()))]
    async fn register(&self, config: &BreakerConfig) -> Result<bool, BackendError> {
        let document = serde_json::to_string(&BreakerDocument::from_config(config))?;
        let created = self
            .store
            .set_if_absent(&document_key(&config.name), &document)
            .await?;
        if !created {
            debug!("breaker already registered");
        }
        Ok(created)
    }

    #[instrument(skip(self), fields(backend = self.store.kind()))]
    async fn update_state(
        &self,
        name: &str,
        state: CircuitState,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        let (_, mut document) = self
            .load_document(name)
            .await?
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        document.state = state;
        document.opened_at = opened_at.map(datetime_to_seconds);
        let raw = serde_json::to_string(&document)?;
        self.store.set(&document_key(name), &raw).await
    }

    #[instrument(skip(self), fields(backend = self.store.kind()))]
    async fn compare_and_set_state(
        &self,
        name: &str,
        expected: ExpectedState,
        state: CircuitState,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<bool, BackendError> {
        let key = document_key(name);
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let (current_raw, mut document) = self
                .load_document(name)
                .await?
                .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
            let current_opened_at = document.opened_at.and_then(seconds_to_datetime);
            if document.state != expected.state || current_opened_at != expected.opened_at {
                return Ok(false);
            }
            document.state = state;
            document.opened_at = opened_at.map(datetime_to_seconds);
            let new_raw = serde_json::to_string(&document)?;
            if self
                .store
                .compare_and_swap(&key, &current_raw, &new_raw)
                .await?
            {
                return Ok(true);
            }
            // The document changed between read and swap; re-check the state
        }
        warn!(breaker = %name, "state swap kept losing to concurrent writers");
        Ok(false)
    }

    #[instrument(skip(self), fields(backend = self.store.kind()))]
    async fn inc_failures(&self, name: &str) -> Result<u32, BackendError> {
        let value = self.store.incr(&counter_key(name)).await?;
        Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
    }

    #[instrument(skip(self), fields(backend = self.store.kind()))]
    async fn reset_failures(&self, name: &str) -> Result<(), BackendError> {
        self.store.set(&counter_key(name), "0").await
    }
}

/// Process-local [`KeyValueStore`]
///
/// Behaves like a single Redis instance: every command is atomic with respect
/// to every other. Useful for running the shared-store code path without a
/// server, and for simulating an outage with [`set_available`](Self::set_available).
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryKeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage; while unavailable every command fails
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Raw value of a key (for assertions on the stored layout)
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    fn kind(&self) -> &'static str {
        "memory-kv"
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
        self.check_available()?;
        let entries = self.entries.lock();
        Ok(keys.iter().map(|k| entries.get(k).cloned()).collect())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.check_available()?;
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, BackendError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, BackendError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(current) if current == expected => {
                *current = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, BackendError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                BackendError::Serialization(format!("value at {key} is not an integer"))
            })?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;

    fn backend() -> KvBackend<MemoryKeyValueStore> {
        KvBackend::new(MemoryKeyValueStore::new())
    }

    fn config(name: &str) -> BreakerConfig {
        BreakerConfig::new(name)
            .with_threshold(3)
            .with_ttl(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_two_key_layout() {
        let backend = backend();
        backend.register(&config("payments")).await.unwrap();
        backend.inc_failures("payments").await.unwrap();
        backend.inc_failures("payments").await.unwrap();

        let raw = backend.store().raw("breaker:payments").unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["name"], "payments");
        assert_eq!(json["threshold"], 3);
        assert_eq!(json["ttl"], 60.0);
        assert_eq!(json["state"], "closed");
        assert!(json["opened_at"].is_null());
        assert!(json.get("failure_count").is_none());

        assert_eq!(
            backend
                .store()
                .raw("breaker:payments:failure_count")
                .as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_get_merges_document_and_counter() {
        let backend = backend();
        assert!(backend.get("payments").await.unwrap().is_none());

        backend.register(&config("payments")).await.unwrap();
        let opened_at = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        backend
            .update_state("payments", CircuitState::Open, Some(opened_at))
            .await
            .unwrap();
        backend.inc_failures("payments").await.unwrap();

        let record = backend.get("payments").await.unwrap().unwrap();
        assert_eq!(record.name, "payments");
        assert_eq!(record.ttl, Duration::from_secs(60));
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.opened_at, Some(opened_at));
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn test_register_keeps_existing_state() {
        let backend = backend();
        assert!(backend.register(&config("svc")).await.unwrap());
        backend.inc_failures("svc").await.unwrap();
        backend
            .update_state("svc", CircuitState::Open, Some(Utc::now()))
            .await
            .unwrap();

        assert!(!backend.register(&config("svc")).await.unwrap());

        let record = backend.get("svc").await.unwrap().unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_state_single_winner() {
        let backend = Arc::new(backend());
        backend.register(&config("svc")).await.unwrap();
        backend
            .update_state("svc", CircuitState::Open, Some(Utc::now()))
            .await
            .unwrap();
        let expected = ExpectedState::of(&backend.get("svc").await.unwrap().unwrap());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    backend
                        .compare_and_set_state("svc", expected, CircuitState::HalfOpen, None)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_a_serialization_error() {
        let backend = backend();
        backend.register(&config("svc")).await.unwrap();
        backend
            .store()
            .set("breaker:svc:failure_count", "many")
            .await
            .unwrap();

        assert!(matches!(
            backend.get("svc").await,
            Err(BackendError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_error() {
        let backend = backend();
        backend.register(&config("svc")).await.unwrap();
        backend.store().set_available(false);

        assert!(matches!(
            backend.get("svc").await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(matches!(
            backend.inc_failures("svc").await,
            Err(BackendError::Unavailable(_))
        ));

        backend.store().set_available(true);
        assert!(backend.get("svc").await.unwrap().is_some());
    }

    #[test]
    fn test_timestamp_round_trip_keeps_microseconds() {
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(seconds_to_datetime(datetime_to_seconds(at)), Some(at));
    }
}
