//! Circuit breaker core
//!
//! - [`BreakerConfig`] and [`CircuitState`]: what a breaker is configured with
//! - [`BreakerRecord`]: what a backend stores for it
//! - [`CircuitBreaker`]: the transition logic over a backend

mod circuit_breaker;
mod config;
mod record;

pub use circuit_breaker::{CallPermit, CircuitBreaker};
pub use config::{BreakerConfig, CircuitState};
pub(crate) use config::duration_millis;
pub use record::{BreakerRecord, BreakerSnapshot};
