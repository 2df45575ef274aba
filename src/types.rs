//! Core event and subscription types for the reactive messaging core
//!
//! All wire types use camelCase JSON serialization.

use crate::ids::{new_event_id, now_millis};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// String→any metadata map, attached to events and subscriptions for
/// diagnostics and protocol markers (e.g. replay flags).
pub type Metadata = HashMap<String, serde_json::Value>;

/// Immutable event record flowing through the bus, store, and plugins.
///
/// `payload` and `metadata` values are erased (`serde_json::Value`) to keep
/// the core generic over producer/consumer payload types; strongly-typed
/// helpers can wrap this at the edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Unique event identifier (`evt-<uuid>`), assigned at construction.
    pub id: String,

    /// Routing key. Must not be empty — used as the subscription map key.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Unix timestamp in milliseconds, set once at construction.
    pub timestamp: u64,

    /// Opaque payload.
    pub payload: serde_json::Value,

    /// Optional key-value metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,

    /// Optional correlation id threading related events together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl DomainEvent {
    /// Create a new event with an auto-generated id and timestamp.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: new_event_id(),
            event_type: event_type.into(),
            timestamp: now_millis(),
            payload,
            metadata: Metadata::new(),
            correlation_id: None,
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// A shallow copy of this event retargeted to a new event type.
    ///
    /// Used by the router to re-publish a matched event under a derived
    /// type without disturbing the original event's id/timestamp semantics.
    pub fn retargeted(&self, new_type: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.event_type = new_type.into();
        copy
    }

    /// Validate the structural invariants this crate enforces: a non-empty
    /// event type.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.event_type.is_empty() {
            return Err(crate::error::EventError::Validation(
                "event type must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// An async handler invoked with an event's payload. The bus calls
/// `handler(payload)`, not `handler(event)` — the envelope is bus metadata.
pub type HandlerFn = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, crate::error::Result<()>> + Send + Sync>;

/// A synchronous predicate over the full event, used for global bus filters
/// and per-subscription filters.
pub type FilterFn = Arc<dyn Fn(&DomainEvent) -> bool + Send + Sync>;

/// A router function: given an event, returns zero or more derived event
/// types to which a retargeted copy should be re-published.
pub type RouterFn = Arc<dyn Fn(&DomainEvent) -> Vec<String> + Send + Sync>;

/// An async observer invoked with a clone of every event that completes
/// dispatch, awaited before `publish` returns. Lets auxiliary components
/// (the content-based router) react to every publish without the caller
/// wiring them in as a manual second step.
pub type ObserverFn =
    Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, crate::error::Result<()>> + Send + Sync>;

/// Options controlling how a subscription participates in dispatch.
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Higher priority handlers run first. Default 0.
    pub priority: i32,
    /// If true, the subscription is removed after its first delivery
    /// (whether or not the handler ran, and regardless of filter match).
    pub once: bool,
    /// Optional diagnostic name.
    pub name: Option<String>,
    /// Optional diagnostic metadata.
    pub metadata: Metadata,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            once: false,
            name: None,
            metadata: Metadata::new(),
        }
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("name", &self.name)
            .finish()
    }
}

/// A live binding of a handler to an event type, with optional filter,
/// priority, and one-shot semantics.
///
/// Held internally by the bus; see [`SubscriptionHandle`] for the value
/// returned to callers.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub id: String,
    pub event_type: String,
    pub handler: HandlerFn,
    pub filter: Option<FilterFn>,
    pub options: SubscriptionOptions,
    /// Insertion sequence, used to break priority ties deterministically.
    pub sequence: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("options", &self.options)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Lightweight handle returned by `subscribe`/`subscribe_with_filter`,
/// identifying a live subscription so it can later be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub event_type: String,
}

/// Per-event-type policy mediating producer load.
///
/// `should_accept` is consulted before each dispatch; when it returns
/// false the bus sleeps for `calculate_delay()` before continuing — it
/// never drops events silently.
pub trait BackpressureStrategy: Send + Sync {
    /// Whether the bus should proceed to dispatch without delay, given the
    /// current in-flight count for this event type.
    fn should_accept(&self, queue_depth: usize) -> bool;

    /// How long to sleep before retrying when `should_accept` returns false.
    fn calculate_delay(&self) -> Duration;
}

/// A simple threshold-based backpressure strategy: accepts while the
/// in-flight count is below `max_queue_depth`, otherwise delays by a fixed
/// `delay`.
#[derive(Debug, Clone)]
pub struct ThresholdBackpressure {
    pub max_queue_depth: usize,
    pub delay: Duration,
}

impl ThresholdBackpressure {
    pub fn new(max_queue_depth: usize, delay: Duration) -> Self {
        Self {
            max_queue_depth,
            delay,
        }
    }
}

impl BackpressureStrategy for ThresholdBackpressure {
    fn should_accept(&self, queue_depth: usize) -> bool {
        queue_depth < self.max_queue_depth
    }

    fn calculate_delay(&self) -> Duration {
        self.delay
    }
}
