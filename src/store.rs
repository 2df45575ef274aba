//! Event store — append-only in-memory storage with three indexes
//!
//! A small trait plus an in-memory implementation behind
//! `tokio::sync::RwLock`, indexing events by insertion order, type, and
//! correlation id, and carrying the snapshot surface the event-sourcing
//! plugin needs.

use crate::error::{EventError, Result};
use crate::ids::now_millis;
use crate::types::DomainEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A compact materialisation of aggregate state at a known version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub state: serde_json::Value,
    pub timestamp: u64,
}

impl AggregateSnapshot {
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: u64,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            state,
            timestamp: now_millis(),
        }
    }
}

/// Metadata key aggregate events carry their owning aggregate id under.
pub const META_AGGREGATE_ID: &str = "aggregateId";
/// Metadata key aggregate events carry their version under.
pub const META_VERSION: &str = "version";
/// Metadata key a correlation id can be carried under when an event has no
/// top-level `correlation_id` set. Indexed as a fallback so
/// `events_by_correlation_id` finds events either way.
pub const META_CORRELATION_ID: &str = "correlationId";

/// Append-only event storage with three simultaneous indexes (insertion
/// order, type, correlation id) plus an optional snapshot surface for event
/// sourcing.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a single event. O(1) amortised.
    async fn store_event(&self, event: DomainEvent) -> Result<()>;

    /// Events of `event_type` whose timestamp falls within the inclusive
    /// range (open-ended if a bound is `None`), sorted by ascending
    /// timestamp, ties broken by insertion order.
    async fn events_by_type(
        &self,
        event_type: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<DomainEvent>>;

    /// All events with a matching `correlation_id`, either as the top-level
    /// field or, absent that, under `metadata.correlationId`.
    async fn events_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<DomainEvent>>;

    /// All events in the inclusive timestamp range, sorted the same way as
    /// `events_by_type`.
    async fn all_events(&self, start: Option<u64>, end: Option<u64>) -> Result<Vec<DomainEvent>>;

    /// Events tagged with `metadata.aggregateId == aggregate_id`, sorted by
    /// ascending `metadata.version`.
    async fn events_by_aggregate(&self, aggregate_id: &str) -> Result<Vec<DomainEvent>>;

    /// The highest `metadata.version` stored for `aggregate_id`, or 0 if
    /// none.
    async fn max_version(&self, aggregate_id: &str) -> Result<u64>;

    /// Append a batch of aggregate events atomically, enforcing optimistic
    /// concurrency: the batch's lowest version must be exactly one greater
    /// than the aggregate's current max version, and versions within the
    /// batch must be contiguous. Rejects with `EventError::Conflict`
    /// otherwise.
    async fn save_events(&self, events: Vec<DomainEvent>) -> Result<()>;

    /// Persist a snapshot, replacing any prior snapshot for the same
    /// aggregate.
    async fn save_snapshot(&self, snapshot: AggregateSnapshot) -> Result<()>;

    /// The latest snapshot for `aggregate_id`, if any.
    async fn latest_snapshot(&self, aggregate_id: &str) -> Result<Option<AggregateSnapshot>>;
}

#[derive(Default)]
struct Inner {
    events: Vec<DomainEvent>,
    by_type: HashMap<String, Vec<usize>>,
    by_correlation: HashMap<String, Vec<usize>>,
    snapshots: HashMap<String, AggregateSnapshot>,
}

impl Inner {
    fn index_of(&mut self, event: DomainEvent) -> usize {
        let idx = self.events.len();
        self.by_type
            .entry(event.event_type.clone())
            .or_default()
            .push(idx);
        if let Some(cid) = event_correlation_id(&event) {
            self.by_correlation
                .entry(cid.to_string())
                .or_default()
                .push(idx);
        }
        self.events.push(event);
        idx
    }
}

fn in_range(timestamp: u64, start: Option<u64>, end: Option<u64>) -> bool {
    start.map(|s| timestamp >= s).unwrap_or(true) && end.map(|e| timestamp <= e).unwrap_or(true)
}

fn sorted_by_timestamp(mut events: Vec<DomainEvent>) -> Vec<DomainEvent> {
    events.sort_by_key(|e| e.timestamp);
    events
}

fn event_version(event: &DomainEvent) -> Option<u64> {
    event.metadata.get(META_VERSION).and_then(|v| v.as_u64())
}

fn event_aggregate_id(event: &DomainEvent) -> Option<&str> {
    event
        .metadata
        .get(META_AGGREGATE_ID)
        .and_then(|v| v.as_str())
}

/// The effective correlation id for an event: its top-level `correlation_id`
/// field if set, otherwise `metadata.correlationId` if present.
fn event_correlation_id(event: &DomainEvent) -> Option<&str> {
    event
        .correlation_id
        .as_deref()
        .or_else(|| event.metadata.get(META_CORRELATION_ID).and_then(|v| v.as_str()))
}

/// In-memory event store. Non-persistent — state is lost on drop, per the
/// crate's "durable disk persistence" non-goal.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, event: DomainEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.index_of(event);
        Ok(())
    }

    async fn events_by_type(
        &self,
        event_type: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<DomainEvent>> {
        let inner = self.inner.read().await;
        let events = inner
            .by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .map(|&idx| inner.events[idx].clone())
            .filter(|e| in_range(e.timestamp, start, end))
            .collect();
        Ok(sorted_by_timestamp(events))
    }

    async fn events_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<DomainEvent>> {
        let inner = self.inner.read().await;
        let events = inner
            .by_correlation
            .get(correlation_id)
            .into_iter()
            .flatten()
            .map(|&idx| inner.events[idx].clone())
            .collect();
        Ok(sorted_by_timestamp(events))
    }

    async fn all_events(&self, start: Option<u64>, end: Option<u64>) -> Result<Vec<DomainEvent>> {
        let inner = self.inner.read().await;
        let events = inner
            .events
            .iter()
            .filter(|e| in_range(e.timestamp, start, end))
            .cloned()
            .collect();
        Ok(sorted_by_timestamp(events))
    }

    async fn events_by_aggregate(&self, aggregate_id: &str) -> Result<Vec<DomainEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<DomainEvent> = inner
            .events
            .iter()
            .filter(|e| event_aggregate_id(e) == Some(aggregate_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| event_version(e).unwrap_or(0));
        Ok(events)
    }

    async fn max_version(&self, aggregate_id: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        let max = inner
            .events
            .iter()
            .filter(|e| event_aggregate_id(e) == Some(aggregate_id))
            .filter_map(event_version)
            .max()
            .unwrap_or(0);
        Ok(max)
    }

    async fn save_events(&self, events: Vec<DomainEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let aggregate_id = event_aggregate_id(&events[0])
            .ok_or_else(|| {
                EventError::Validation("aggregate event missing metadata.aggregateId".to_string())
            })?
            .to_string();

        let mut versions = Vec::with_capacity(events.len());
        for event in &events {
            if event_aggregate_id(event).as_deref() != Some(aggregate_id.as_str()) {
                return Err(EventError::Validation(
                    "save_events received events for more than one aggregate".to_string(),
                ));
            }
            let v = event_version(event).ok_or_else(|| {
                EventError::Validation("aggregate event missing metadata.version".to_string())
            })?;
            versions.push(v);
        }

        let mut inner = self.inner.write().await;
        let current_max = inner
            .events
            .iter()
            .filter(|e| event_aggregate_id(e) == Some(aggregate_id.as_str()))
            .filter_map(event_version)
            .max()
            .unwrap_or(0);

        let expected_start = current_max + 1;
        for (offset, v) in versions.iter().enumerate() {
            if *v != expected_start + offset as u64 {
                return Err(EventError::Conflict(format!(
                    "expected version {} for aggregate '{}', got {}",
                    expected_start + offset as u64,
                    aggregate_id,
                    v
                )));
            }
        }

        for event in events {
            inner.index_of(event);
        }
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: AggregateSnapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .snapshots
            .insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn latest_snapshot(&self, aggregate_id: &str) -> Result<Option<AggregateSnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner.snapshots.get(aggregate_id).cloned())
    }
}
