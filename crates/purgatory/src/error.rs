//! Error types for breaker operations

use thiserror::Error;

use crate::backend::BackendError;
use crate::breaker::CircuitState;

/// Errors raised by the breaker engine itself
#[derive(Debug, Error)]
pub enum BreakerError {
    /// Call rejected: the breaker is open, or half-open with its trial already in flight
    #[error("circuit breaker {name} is {state}")]
    Open { name: String, state: CircuitState },

    /// The backend could not be read or updated
    #[error("breaker backend unavailable: {0}")]
    Backend(#[from] BackendError),

    /// Invalid threshold, TTL or name
    #[error("invalid breaker configuration: {0}")]
    Configuration(String),

    /// The backend holds no record for this name
    #[error("circuit breaker not registered: {0}")]
    NotRegistered(String),
}

impl BreakerError {
    /// Whether this is a business-level rejection (as opposed to an infrastructure error)
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Whether the backend failed
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Result of a guarded call
///
/// Distinguishes a call the breaker refused (or could not evaluate) from a
/// call that ran and failed on its own.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The work was not executed
    #[error(transparent)]
    Breaker(#[from] BreakerError),

    /// The work ran and returned this error, unchanged
    #[error(transparent)]
    Inner(E),
}

impl<E> CallError<E> {
    /// Whether the breaker rejected the call
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Breaker(e) if e.is_open())
    }

    /// The protected call's own error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Breaker(_) => None,
        }
    }
}
