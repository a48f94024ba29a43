//! Breaker registry
//!
//! The registry binds named breakers to one backend and runs units of work
//! under them. It is the entry point most applications need:
//!
//! ```ignore
//! let config = RegistryConfig::from_env()?;
//! let registry = BreakerRegistry::from_config(config, &BackendFactory::new()).await?;
//! registry.register_breaker("geocoder", 3, Duration::from_secs(60)).await?;
//!
//! let place = registry
//!     .call("geocoder", || async { geocoder.lookup(address).await })
//!     .await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendFactory, BreakerBackend, InMemoryBackend};
use crate::breaker::{BreakerConfig, BreakerSnapshot, CallPermit, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendErrorPolicy, RegistryConfig};
use crate::error::{BreakerError, CallError};
use crate::events::{BreakerEvent, EventListener, EventLog};

/// Named breakers sharing one backend, clock and event log
pub struct BreakerRegistry {
    backend: Arc<dyn BreakerBackend>,
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    config: RegistryConfig,
    /// Breakers registered through this registry
    known: RwLock<HashMap<String, BreakerConfig>>,
}

impl BreakerRegistry {
    /// Create a registry over `backend` using the system clock
    pub fn new(backend: Arc<dyn BreakerBackend>, config: RegistryConfig) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            events: Arc::new(EventLog::with_capacity(config.event_capacity)),
            config,
            known: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with a process-local backend
    pub fn in_memory(config: RegistryConfig) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), config)
    }

    /// Create a registry with the backend `config` names
    pub async fn from_config(
        config: RegistryConfig,
        factory: &BackendFactory,
    ) -> Result<Self, BreakerError> {
        config.validate()?;
        let backend = factory.create(&config.backend).await?;
        Ok(Self::new(backend, config))
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registry-wide settings
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Store holding every breaker record of this registry
    pub fn backend(&self) -> &Arc<dyn BreakerBackend> {
        &self.backend
    }

    /// Event log shared by every breaker of this registry
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Forward every subsequent event to `listener`
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.events.add_listener(listener);
    }

    /// Register a breaker
    ///
    /// Idempotent: if the backend already holds a record under `name`, that
    /// record (state, failure count and original settings) is kept.
    pub async fn register_breaker(
        &self,
        name: &str,
        threshold: u32,
        ttl: Duration,
    ) -> Result<CircuitBreaker, BreakerError> {
        self.register(
            BreakerConfig::new(name)
                .with_threshold(threshold)
                .with_ttl(ttl),
        )
        .await
    }

    /// Register a breaker from a full configuration
    ///
    /// When the backend already holds the breaker, [`configs`](Self::configs)
    /// reports the stored settings rather than `config`.
    pub async fn register(&self, config: BreakerConfig) -> Result<CircuitBreaker, BreakerError> {
        config.validate()?;

        let created = self.backend.register(&config).await?;
        let config = if created {
            info!(
                breaker = %config.name,
                threshold = config.threshold,
                ttl_ms = config.ttl.as_millis() as u64,
                backend = self.backend.kind(),
                "circuit breaker registered"
            );
            self.events
                .append(
                    self.clock.now(),
                    BreakerEvent::Registered {
                        name: config.name.clone(),
                        threshold: config.threshold,
                        ttl_ms: config.ttl.as_millis() as u64,
                    },
                )
                .await;
            config
        } else {
            debug!(breaker = %config.name, "circuit breaker already present in backend");
            match self.backend.get(&config.name).await? {
                Some(record) => record.config(),
                None => config,
            }
        };

        let breaker = self.handle(&config.name);
        self.known.write().insert(config.name.clone(), config);
        Ok(breaker)
    }

    /// Get the breaker for `name`, registering it with the registry defaults
    /// if this registry has not seen it yet
    pub async fn breaker(&self, name: &str) -> Result<CircuitBreaker, BreakerError> {
        if self.known.read().contains_key(name) {
            return Ok(self.handle(name));
        }
        self.register(self.config.breaker_defaults(name)).await
    }

    /// Configurations registered through this registry
    pub fn configs(&self) -> Vec<BreakerConfig> {
        let mut configs: Vec<_> = self.known.read().values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Run `work` under breaker `name`, counting every error as a failure
    pub async fn call<T, E, F, Fut>(&self, name: &str, work: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_excluding(name, |_: &E| false, work).await
    }

    /// Run `work` under breaker `name`
    ///
    /// - Rejected calls return [`CallError::Breaker`] without running `work`.
    /// - Errors for which `is_excluded` returns `true` are returned unchanged
    ///   and recorded as a successful round-trip.
    /// - Any other error is recorded as a failure and returned unchanged in
    ///   [`CallError::Inner`].
    ///
    /// When the backend fails before the call is admitted, the registry's
    /// [`BackendErrorPolicy`] decides between surfacing the error and running
    /// `work` unguarded. Failing to record the outcome afterwards is logged
    /// and never replaces the work's own result.
    pub async fn call_excluding<T, E, P, F, Fut>(
        &self,
        name: &str,
        is_excluded: P,
        work: F,
    ) -> Result<T, CallError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let fail_open = self.config.on_backend_error == BackendErrorPolicy::FailOpen;
        let permit = match self.admit(name).await {
            Ok(permit) => permit,
            Err(e) if e.is_backend() && fail_open => {
                warn!(
                    breaker = %name,
                    error = %e,
                    "breaker backend unavailable; running call unguarded"
                );
                return work().await.map_err(CallError::Inner);
            }
            Err(e) => return Err(CallError::Breaker(e)),
        };

        let result = work().await;
        let recorded = match &result {
            Ok(_) => permit.success().await,
            Err(e) if is_excluded(e) => {
                debug!(breaker = %name, "excluded error; not counted as a failure");
                permit.success().await
            }
            Err(_) => permit.failure().await,
        };
        if let Err(e) = recorded {
            error!(breaker = %name, error = %e, "failed to record call outcome");
        }

        result.map_err(CallError::Inner)
    }

    /// Acquire a permit, restoring a record the backend lost
    ///
    /// A store restart or eviction can drop a breaker this registry already
    /// knows. It is registered again from the known settings, starting Closed.
    async fn admit(&self, name: &str) -> Result<CallPermit, BreakerError> {
        let breaker = self.breaker(name).await?;
        match breaker.allow_call().await {
            Err(BreakerError::NotRegistered(_)) => {
                let known = self.known.read().get(name).cloned();
                let config = known.unwrap_or_else(|| self.config.breaker_defaults(name));
                warn!(breaker = %name, "breaker record missing from backend; registering again");
                self.register(config).await?.allow_call().await
            }
            admitted => admitted,
        }
    }

    /// Read-only view of a breaker for health checks
    pub async fn get_state(&self, name: &str) -> Result<BreakerSnapshot, BreakerError> {
        let record = self
            .backend
            .get(name)
            .await?
            .ok_or_else(|| BreakerError::NotRegistered(name.to_string()))?;
        Ok(record.snapshot())
    }

    /// Force a breaker Closed with no recorded failures
    pub async fn reset(&self, name: &str) -> Result<(), BreakerError> {
        self.handle(name).reset().await
    }

    fn handle(&self, name: &str) -> CircuitBreaker {
        CircuitBreaker::new(
            name,
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
        )
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("backend", &self.backend.kind())
            .field("breakers", &self.known.read().keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}
