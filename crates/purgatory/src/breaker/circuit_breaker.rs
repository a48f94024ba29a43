//! Circuit breaker state machine
//!
//! A [`CircuitBreaker`] is a cheap handle: a name plus shared references to
//! the backend, the clock and the event log. It holds no state of its own, so
//! any number of handles (in any number of processes sharing a backend) see
//! the same breaker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{BreakerRecord, CircuitState};
use crate::backend::{BreakerBackend, ExpectedState};
use crate::clock::Clock;
use crate::error::BreakerError;
use crate::events::{BreakerEvent, EventLog, TransitionReason};

/// Handle on one named breaker
///
/// # Example
///
/// ```ignore
/// let breaker = registry.breaker("payments").await?;
///
/// match breaker.allow_call().await {
///     Ok(permit) => match charge(order).await {
///         Ok(receipt) => {
///             permit.success().await?;
///             Ok(receipt)
///         }
///         Err(e) => {
///             permit.failure().await?;
///             Err(e.into())
///         }
///     },
///     Err(e) if e.is_open() => Err(ServiceUnavailable),
///     Err(e) => Err(e.into()),
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    backend: Arc<dyn BreakerBackend>,
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
}

impl CircuitBreaker {
    /// Create a handle; the record must already be registered in `backend`
    pub fn new(
        name: impl Into<Arc<str>>,
        backend: Arc<dyn BreakerBackend>,
        clock: Arc<dyn Clock>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            clock,
            events,
        }
    }

    /// Get the breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the current record from the backend
    pub async fn record(&self) -> Result<BreakerRecord, BreakerError> {
        self.backend
            .get(&self.name)
            .await?
            .ok_or_else(|| BreakerError::NotRegistered(self.name.to_string()))
    }

    /// Check current state without acquiring a permit
    pub async fn state(&self) -> Result<CircuitState, BreakerError> {
        Ok(self.record().await?.state)
    }

    /// Decide whether a call may proceed
    ///
    /// - Closed: allowed.
    /// - Open, TTL not elapsed: rejected with [`BreakerError::Open`].
    /// - Open, TTL elapsed: this caller swaps the breaker to HalfOpen and
    ///   receives the trial permit. Callers losing the swap are rejected.
    /// - HalfOpen: rejected; the trial is already in flight.
    /// - HalfOpen for twice the TTL since opening: the trial outcome was lost
    ///   (its process died or the backend failed while recording it). The
    ///   caller winning the swap gets a new trial and `opened_at` restarts.
    pub async fn allow_call(&self) -> Result<CallPermit, BreakerError> {
        let record = self.record().await?;
        let now = self.clock.now();

        match record.state {
            CircuitState::Closed => Ok(CallPermit::new(self.clone(), false)),
            CircuitState::Open if record.ttl_elapsed(now) => {
                self.admit_trial(&record, record.opened_at, TransitionReason::TtlElapsed)
                    .await
            }
            CircuitState::HalfOpen if record.trial_expired(now) => {
                warn!(
                    breaker = %self.name,
                    "trial call never reported an outcome; admitting another"
                );
                self.admit_trial(&record, Some(now), TransitionReason::TrialExpired)
                    .await
            }
            state => Err(self.reject(state).await),
        }
    }

    /// Report a successful call
    ///
    /// Clears the consecutive-failure count while Closed; closes a HalfOpen
    /// breaker. Ignored while Open (a call admitted before the breaker tripped).
    pub async fn on_success(&self) -> Result<(), BreakerError> {
        let record = self.record().await?;
        self.apply_success(&record).await
    }

    /// Report a failed call
    ///
    /// Counts the failure while Closed and trips the breaker at the threshold;
    /// reopens a HalfOpen breaker. Ignored while Open.
    pub async fn on_failure(&self) -> Result<(), BreakerError> {
        let record = self.record().await?;
        self.apply_failure(&record).await
    }

    /// Force the breaker Closed with no recorded failures
    pub async fn reset(&self) -> Result<(), BreakerError> {
        let record = self.record().await?;
        self.backend
            .update_state(&self.name, CircuitState::Closed, None)
            .await?;
        self.backend.reset_failures(&self.name).await?;

        if record.state != CircuitState::Closed {
            info!(breaker = %self.name, from = %record.state, "circuit breaker reset");
            self.emit(BreakerEvent::StateChanged {
                name: self.name.to_string(),
                from: record.state,
                to: CircuitState::Closed,
                reason: TransitionReason::ManualReset,
            })
            .await;
        }
        Ok(())
    }

    async fn settle(&self, succeeded: bool, trial: bool) -> Result<(), BreakerError> {
        let record = self.record().await?;
        if record.state == CircuitState::HalfOpen && !trial {
            // Only the trial call decides a HalfOpen breaker
            debug!(breaker = %self.name, "outcome of a pre-trip call ignored while half-open");
            return Ok(());
        }
        if succeeded {
            self.apply_success(&record).await
        } else {
            self.apply_failure(&record).await
        }
    }

    async fn apply_success(&self, record: &BreakerRecord) -> Result<(), BreakerError> {
        match record.state {
            CircuitState::Closed => {
                if record.failure_count > 0 {
                    self.backend.reset_failures(&self.name).await?;
                }
                Ok(())
            }
            CircuitState::HalfOpen => {
                let won = self
                    .transition(
                        record,
                        CircuitState::Closed,
                        None,
                        TransitionReason::TrialSucceeded,
                    )
                    .await?;
                if won {
                    self.backend.reset_failures(&self.name).await?;
                    info!(breaker = %self.name, "circuit breaker recovered");
                    self.emit(BreakerEvent::Recovered {
                        name: self.name.to_string(),
                    })
                    .await;
                }
                Ok(())
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "success reported while open; ignored");
                Ok(())
            }
        }
    }

    async fn apply_failure(&self, record: &BreakerRecord) -> Result<(), BreakerError> {
        match record.state {
            CircuitState::Closed => {
                let failure_count = self.backend.inc_failures(&self.name).await?;
                debug!(
                    breaker = %self.name,
                    failure_count,
                    threshold = record.threshold,
                    "failure recorded"
                );
                self.emit(BreakerEvent::Failed {
                    name: self.name.to_string(),
                    failure_count,
                })
                .await;

                if failure_count >= record.threshold {
                    let won = self
                        .transition(
                            record,
                            CircuitState::Open,
                            Some(self.clock.now()),
                            TransitionReason::ThresholdReached,
                        )
                        .await?;
                    if won {
                        self.backend.reset_failures(&self.name).await?;
                    }
                }
                Ok(())
            }
            CircuitState::HalfOpen => {
                self.transition(
                    record,
                    CircuitState::Open,
                    Some(self.clock.now()),
                    TransitionReason::TrialFailed,
                )
                .await?;
                Ok(())
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "failure reported while open; ignored");
                Ok(())
            }
        }
    }

    async fn admit_trial(
        &self,
        record: &BreakerRecord,
        opened_at: Option<DateTime<Utc>>,
        reason: TransitionReason,
    ) -> Result<CallPermit, BreakerError> {
        let won = self
            .transition(record, CircuitState::HalfOpen, opened_at, reason)
            .await?;
        if won {
            Ok(CallPermit::new(self.clone(), true))
        } else {
            Err(self.reject(CircuitState::HalfOpen).await)
        }
    }

    /// Conditionally move from the state `record` shows to `to`
    ///
    /// Returns whether this caller performed the transition.
    async fn transition(
        &self,
        record: &BreakerRecord,
        to: CircuitState,
        opened_at: Option<DateTime<Utc>>,
        reason: TransitionReason,
    ) -> Result<bool, BreakerError> {
        let won = self
            .backend
            .compare_and_set_state(&self.name, ExpectedState::of(record), to, opened_at)
            .await?;
        if !won {
            debug!(
                breaker = %self.name,
                from = %record.state,
                to = %to,
                "lost state transition race"
            );
            return Ok(false);
        }

        if to == CircuitState::Open {
            warn!(breaker = %self.name, from = %record.state, %reason, "circuit breaker opened");
        } else {
            info!(
                breaker = %self.name,
                from = %record.state,
                to = %to,
                %reason,
                "circuit breaker state changed"
            );
        }
        self.emit(BreakerEvent::StateChanged {
            name: self.name.to_string(),
            from: record.state,
            to,
            reason,
        })
        .await;
        Ok(true)
    }

    async fn reject(&self, state: CircuitState) -> BreakerError {
        debug!(breaker = %self.name, %state, "call rejected");
        self.emit(BreakerEvent::CallRejected {
            name: self.name.to_string(),
            state,
        })
        .await;
        BreakerError::Open {
            name: self.name.to_string(),
            state,
        }
    }

    async fn emit(&self, event: BreakerEvent) {
        self.events.append(self.clock.now(), event).await;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

/// Permit that must be held during a protected call
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). A permit dropped without an outcome (for
/// example because the guarded future was cancelled) counts as a failure,
/// reported on a background task.
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this is the single trial call of a HalfOpen breaker
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the call succeeded
    pub async fn success(mut self) -> Result<(), BreakerError> {
        self.settled = true;
        self.breaker.settle(true, self.trial).await
    }

    /// Report the call failed
    pub async fn failure(mut self) -> Result<(), BreakerError> {
        self.settled = true;
        self.breaker.settle(false, self.trial).await
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let breaker = self.breaker.clone();
        let trial = self.trial;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(breaker = %breaker.name, trial, "call permit abandoned; recording failure");
                handle.spawn(async move {
                    if let Err(e) = breaker.settle(false, trial).await {
                        warn!(
                            breaker = %breaker.name,
                            error = %e,
                            "failed to record abandoned call"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    breaker = %breaker.name,
                    trial,
                    "call permit dropped outside a runtime; outcome lost"
                );
            }
        }
    }
}
