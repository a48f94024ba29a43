//! # Purgatory
//!
//! Circuit breakers whose state can be shared between threads of one process
//! or between many processes through an external key-value store.
//!
//! ## Features
//!
//! - **Consecutive-failure breakers**: a breaker trips after `threshold` failures in a row
//! - **Lazy recovery**: an open breaker admits a single trial call once its TTL elapses
//! - **Pluggable persistence**: in-memory for one process, Redis for many
//! - **Atomic bookkeeping**: failure counters use the store's native increment,
//!   state transitions use a conditional swap
//! - **Event log**: every registration, transition and rejection is recorded
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BreakerRegistry                         │
//! │  (registration, defaults, guarded calls, introspection)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CircuitBreaker                          │
//! │  (Closed → Open → HalfOpen state machine, call permits)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BreakerBackend                          │
//! │  (InMemoryBackend | KvBackend<RedisKeyValueStore>)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use purgatory::prelude::*;
//!
//! let registry = BreakerRegistry::in_memory(RegistryConfig::default());
//! registry
//!     .register_breaker("payments", 3, Duration::from_secs(60))
//!     .await?;
//!
//! let result = registry
//!     .call_excluding(
//!         "payments",
//!         |e: &PaymentError| e.is_validation(),
//!         || async { client.charge(order).await },
//!     )
//!     .await;
//!
//! match result {
//!     Ok(receipt) => { /* ... */ }
//!     Err(CallError::Breaker(e)) if e.is_open() => { /* fallback */ }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

pub mod backend;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{
        BackendError, BackendFactory, BackendKind, BreakerBackend, InMemoryBackend, KvBackend,
        MemoryKeyValueStore, RedisKeyValueStore,
    };
    pub use crate::breaker::{
        BreakerConfig, BreakerRecord, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitState,
    };
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{BackendErrorPolicy, RegistryConfig};
    pub use crate::error::{BreakerError, CallError};
    pub use crate::events::{BreakerEvent, EventListener, EventLog, EventRecord};
    pub use crate::registry::BreakerRegistry;
}

// Re-export key types at crate root
pub use backend::{BackendError, BackendKind, BreakerBackend, InMemoryBackend, KvBackend};
pub use breaker::{BreakerConfig, BreakerRecord, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendErrorPolicy, RegistryConfig};
pub use error::{BreakerError, CallError};
pub use events::{BreakerEvent, EventListener, EventLog};
pub use registry::BreakerRegistry;
