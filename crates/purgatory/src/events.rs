//! Breaker events
//!
//! An append-only, in-memory log of what the breakers did: registrations,
//! state transitions, rejected calls. The log has no bearing on breaker
//! correctness. It exists for observability and test assertions, and it
//! forwards each event to any registered [`EventListener`].
//!
//! A log created with a capacity keeps only the most recent events. Sequence
//! numbers keep counting, so a gap at the front shows how much was dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitState;

/// Why a breaker changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Consecutive failures reached the threshold
    ThresholdReached,

    /// The open-state TTL elapsed and a trial call was admitted
    TtlElapsed,

    /// The trial call succeeded
    TrialSucceeded,

    /// The trial call failed
    TrialFailed,

    /// The trial call never reported back and a new one was admitted
    TrialExpired,

    /// An operator forced the breaker closed
    ManualReset,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdReached => write!(f, "threshold reached"),
            Self::TtlElapsed => write!(f, "ttl elapsed"),
            Self::TrialSucceeded => write!(f, "trial call succeeded"),
            Self::TrialFailed => write!(f, "trial call failed"),
            Self::TrialExpired => write!(f, "trial call expired"),
            Self::ManualReset => write!(f, "manual reset"),
        }
    }
}

/// Domain events emitted by breakers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakerEvent {
    /// A breaker record was created in the backend
    Registered {
        name: String,
        threshold: u32,
        ttl_ms: u64,
    },

    /// A breaker moved between states
    StateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
        reason: TransitionReason,
    },

    /// A call was refused without running
    CallRejected { name: String, state: CircuitState },

    /// A failure was counted while the breaker stayed closed
    Failed { name: String, failure_count: u32 },

    /// A trial call closed the breaker again
    Recovered { name: String },
}

impl BreakerEvent {
    /// Name of the breaker the event concerns
    pub fn breaker(&self) -> &str {
        match self {
            Self::Registered { name, .. }
            | Self::StateChanged { name, .. }
            | Self::CallRejected { name, .. }
            | Self::Failed { name, .. }
            | Self::Recovered { name } => name,
        }
    }

    /// Stable event type identifier (`breaker.registered`, ...)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "breaker.registered",
            Self::StateChanged { .. } => "breaker.state_changed",
            Self::CallRejected { .. } => "breaker.call_rejected",
            Self::Failed { .. } => "breaker.failed",
            Self::Recovered { .. } => "breaker.recovered",
        }
    }
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered {
                name,
                threshold,
                ttl_ms,
            } => write!(
                f,
                "breaker {name} registered (threshold {threshold}, ttl {ttl_ms}ms)"
            ),
            Self::StateChanged {
                name,
                from,
                to,
                reason,
            } => write!(f, "breaker {name} changed from {from} to {to}: {reason}"),
            Self::CallRejected { name, state } => {
                write!(f, "breaker {name} rejected a call while {state}")
            }
            Self::Failed {
                name,
                failure_count,
            } => write!(f, "breaker {name} recorded failure #{failure_count}"),
            Self::Recovered { name } => write!(f, "breaker {name} recovered"),
        }
    }
}

/// An event with its position in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// 1-based position in the log
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub event: BreakerEvent,
}

/// Trait for listening to events after they are appended.
///
/// Listeners should be fast and non-blocking. For heavy processing,
/// consider spawning background tasks.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Called after an event is appended to the log.
    async fn on_event(&self, record: &EventRecord);

    /// Optional: Filter which event types this listener cares about.
    ///
    /// Return `None` to receive all events (default).
    fn event_types(&self) -> Option<Vec<&'static str>> {
        None
    }

    /// Human-readable name for logging/debugging.
    fn name(&self) -> &'static str {
        "EventListener"
    }
}

/// Ordered, append-only event log
#[derive(Default)]
pub struct EventLog {
    records: RwLock<Entries>,
    /// Most recent events kept; `None` keeps everything
    capacity: Option<usize>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

#[derive(Default)]
struct Entries {
    kept: VecDeque<EventRecord>,
    next_sequence: u64,
}

impl EventLog {
    /// Create an empty, unbounded log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log keeping at most `capacity` events, dropping the oldest
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Add a listener notified of every subsequent event
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        tracing::debug!(listener = listener.name(), "event listener added");
        self.listeners.write().push(listener);
    }

    /// Append an event and notify listeners
    pub async fn append(&self, occurred_at: DateTime<Utc>, event: BreakerEvent) {
        let record = {
            let mut records = self.records.write();
            records.next_sequence += 1;
            let record = EventRecord {
                sequence: records.next_sequence,
                occurred_at,
                event,
            };
            match self.capacity {
                Some(0) => {}
                Some(capacity) => {
                    if records.kept.len() >= capacity {
                        records.kept.pop_front();
                    }
                    records.kept.push_back(record.clone());
                }
                None => records.kept.push_back(record.clone()),
            }
            record
        };

        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            let interested = listener
                .event_types()
                .map_or(true, |types| types.contains(&record.event.event_type()));
            if interested {
                listener.on_event(&record).await;
            }
        }
    }

    /// All kept events in append order
    pub fn events(&self) -> Vec<EventRecord> {
        self.records.read().kept.iter().cloned().collect()
    }

    /// Events concerning one breaker
    pub fn events_for(&self, name: &str) -> Vec<BreakerEvent> {
        self.records
            .read()
            .kept
            .iter()
            .filter(|r| r.event.breaker() == name)
            .map(|r| r.event.clone())
            .collect()
    }

    /// Human-readable messages in append order
    pub fn messages(&self) -> Vec<String> {
        self.records
            .read()
            .kept
            .iter()
            .map(|r| r.event.to_string())
            .collect()
    }

    /// Number of events kept
    pub fn len(&self) -> usize {
        self.records.read().kept.len()
    }

    /// Whether no event is kept
    pub fn is_empty(&self) -> bool {
        self.records.read().kept.is_empty()
    }

    /// Maximum number of events kept, if bounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("events", &self.len())
            .field("capacity", &self.capacity)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
