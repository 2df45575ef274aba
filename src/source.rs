//! Event source — replays stored events back through a bus
//!
//! A thin façade over the store's query helpers that re-publishes
//! historical events with replay markers rather than just returning them
//! to the caller.

use crate::bus::EventBus;
use crate::error::Result;
use crate::ids::now_millis;
use crate::store::EventStore;
use std::sync::Arc;
use tracing::debug;

/// Marks a replayed event's metadata so subscribers can distinguish replay
/// traffic from live traffic.
pub const META_REPLAYED: &str = "replayed";
/// Wall-clock time (ms) at which a replay re-publish occurred.
pub const META_REPLAY_TIMESTAMP: &str = "replayTimestamp";

/// Replays events from a store back through a bus, tagging each with replay
/// metadata before re-publishing.
pub struct EventSource {
    bus: EventBus,
    store: Arc<dyn EventStore>,
}

impl EventSource {
    pub fn new(bus: EventBus, store: Arc<dyn EventStore>) -> Self {
        Self { bus, store }
    }

    /// Replay every event of `event_type` within the inclusive timestamp
    /// window, publishing each back through the bus in stored order.
    pub async fn replay_events(
        &self,
        event_type: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<usize> {
        let events = self.store.events_by_type(event_type, start, end).await?;
        let count = events.len();
        debug!(event_type, count, "replaying events");
        for event in events {
            self.bus.publish(mark_replayed(event)).await?;
        }
        Ok(count)
    }

    /// Replay every event sharing `correlation_id`, in stored order.
    pub async fn replay_by_correlation_id(&self, correlation_id: &str) -> Result<usize> {
        let events = self
            .store
            .events_by_correlation_id(correlation_id)
            .await?;
        let count = events.len();
        debug!(correlation_id, count, "replaying correlated events");
        for event in events {
            self.bus.publish(mark_replayed(event)).await?;
        }
        Ok(count)
    }
}

fn mark_replayed(mut event: crate::types::DomainEvent) -> crate::types::DomainEvent {
    event
        .metadata
        .insert(META_REPLAYED.to_string(), serde_json::json!(true));
    event.metadata.insert(
        META_REPLAY_TIMESTAMP.to_string(),
        serde_json::json!(now_millis()),
    );
    event
}
