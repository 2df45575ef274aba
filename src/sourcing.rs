//! Event-sourcing plugin — commands, aggregates, and snapshot-aware replay
//!
//! Keyed registries (factories, command handlers) live behind
//! `RwLock<HashMap<...>>`. Commands are ordinary bus events on
//! `command.<type>`; handlers produce aggregates whose uncommitted events
//! are appended to the store and re-published as `event.<type>`.

use crate::bus::EventBus;
use crate::error::{EventError, Result};
use crate::ids::now_millis;
use crate::store::{AggregateSnapshot, EventStore, META_AGGREGATE_ID, META_VERSION};
use crate::types::{DomainEvent, SubscriptionOptions};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// A command submitted to an aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

impl Command {
    pub fn new(
        command_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            timestamp: now_millis(),
        }
    }
}

/// An event-sourced aggregate: state reconstructed by folding events, with
/// pending events buffered until `save_aggregate` persists them.
pub trait AggregateRoot: Send + Sync {
    fn aggregate_id(&self) -> &str;
    fn version(&self) -> u64;

    /// Fold a historical event into this aggregate's state, advancing
    /// `version` to the event's version.
    fn apply(&mut self, event: &DomainEvent);

    /// Events recorded since the last `save_aggregate`, not yet persisted.
    fn uncommitted_events(&self) -> Vec<DomainEvent>;

    /// Clear the uncommitted buffer after a successful save.
    fn clear_uncommitted(&mut self);

    /// Seed this aggregate from a snapshot's opaque state at a known
    /// version, without replaying any events.
    fn load_from_snapshot(&mut self, version: u64, state: serde_json::Value);

    /// A serialisable snapshot of the current state, for `create_snapshot`.
    fn snapshot_state(&self) -> serde_json::Value;
}

type AggregateFactory = Arc<dyn Fn(&str) -> Box<dyn AggregateRoot> + Send + Sync>;
type CommandHandler =
    Arc<dyn Fn(Command, Box<dyn AggregateRoot>) -> BoxFuture<'static, Result<Box<dyn AggregateRoot>>> + Send + Sync>;

/// Coordinates command dispatch, aggregate reconstruction, and persistence
/// on top of a bus and a store.
pub struct EventSourcingPlugin {
    bus: EventBus,
    store: Arc<dyn EventStore>,
    factories: RwLock<HashMap<String, AggregateFactory>>,
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

impl EventSourcingPlugin {
    pub fn new(bus: EventBus, store: Arc<dyn EventStore>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            factories: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register_aggregate_factory(
        &self,
        aggregate_type: impl Into<String>,
        factory: AggregateFactory,
    ) {
        self.factories
            .write()
            .await
            .insert(aggregate_type.into(), factory);
    }

    /// Register a command handler for `command_type` and subscribe the bus
    /// to `command.<command_type>`. The subscription dispatches commands to
    /// `handler`, saves the resulting aggregate, and emits
    /// `command.rejected` on failure.
    pub async fn register_command_handler(
        self: Arc<Self>,
        command_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        handler: CommandHandler,
    ) {
        let command_type = command_type.into();
        let aggregate_type = aggregate_type.into();
        self.handlers
            .write()
            .await
            .insert(command_type.clone(), handler);

        let event_type = format!("command.{command_type}");
        let plugin = self.clone();
        let aggregate_type_for_sub = aggregate_type.clone();
        let command_type_for_sub = command_type.clone();

        self.bus
            .subscribe(
                event_type,
                Arc::new(move |payload| {
                    let plugin = plugin.clone();
                    let aggregate_type = aggregate_type_for_sub.clone();
                    let command_type = command_type_for_sub.clone();
                    Box::pin(async move {
                        plugin
                            .dispatch_command(command_type, aggregate_type, payload)
                            .await
                    })
                }),
                SubscriptionOptions::default(),
            )
            .await;
    }

    async fn dispatch_command(
        self: Arc<Self>,
        command_type: String,
        aggregate_type: String,
        payload: serde_json::Value,
    ) -> Result<()> {
        let command: Command = serde_json::from_value(payload)?;
        let aggregate_id = command.aggregate_id.clone();

        let result = self
            .dispatch_command_inner(&aggregate_type, command.clone())
            .await;

        if let Err(e) = &result {
            error!(
                command_type = %command_type,
                aggregate_id = %aggregate_id,
                error = %e,
                "command rejected"
            );
            self.bus
                .publish(DomainEvent::new(
                    "command.rejected",
                    serde_json::json!({
                        "commandType": command_type,
                        "aggregateId": aggregate_id,
                        "reason": e.to_string(),
                    }),
                ))
                .await?;
        }

        result
    }

    async fn dispatch_command_inner(
        &self,
        aggregate_type: &str,
        command: Command,
    ) -> Result<()> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&command.command_type)
            .cloned()
            .ok_or_else(|| {
                EventError::NotFound(format!(
                    "no command handler registered for '{}'",
                    command.command_type
                ))
            })?;

        let aggregate = self
            .load_aggregate(aggregate_type, &command.aggregate_id)
            .await?;

        let aggregate = handler(command, aggregate).await?;
        self.save_aggregate(aggregate).await
    }

    /// Reconstruct an aggregate by replaying every stored event for
    /// `aggregate_id` in ascending version order.
    pub async fn load_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Box<dyn AggregateRoot>> {
        let factory = self
            .factories
            .read()
            .await
            .get(aggregate_type)
            .cloned()
            .ok_or_else(|| {
                EventError::NotFound(format!("no aggregate factory for '{aggregate_type}'"))
            })?;

        let mut aggregate = factory(aggregate_id);
        let events = self.store.events_by_aggregate(aggregate_id).await?;
        for event in &events {
            aggregate.apply(event);
        }
        Ok(aggregate)
    }

    /// Reconstruct an aggregate from its latest snapshot (if any), then
    /// replay only the events newer than the snapshot's version.
    pub async fn load_aggregate_from_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Box<dyn AggregateRoot>> {
        let factory = self
            .factories
            .read()
            .await
            .get(aggregate_type)
            .cloned()
            .ok_or_else(|| {
                EventError::NotFound(format!("no aggregate factory for '{aggregate_type}'"))
            })?;

        let mut aggregate = factory(aggregate_id);
        let snapshot = self.store.latest_snapshot(aggregate_id).await?;
        let since_version = match snapshot {
            Some(snap) => {
                aggregate.load_from_snapshot(snap.version, snap.state);
                snap.version
            }
            None => 0,
        };

        let events = self.store.events_by_aggregate(aggregate_id).await?;
        for event in events
            .iter()
            .filter(|e| event_version(e).unwrap_or(0) > since_version)
        {
            aggregate.apply(event);
        }
        Ok(aggregate)
    }

    /// Persist an aggregate's uncommitted events and re-publish each as
    /// `event.<eventType>`. A no-op if there are no uncommitted events. On
    /// store failure, the uncommitted buffer is left intact.
    pub async fn save_aggregate(&self, mut aggregate: Box<dyn AggregateRoot>) -> Result<()> {
        let events = aggregate.uncommitted_events();
        if events.is_empty() {
            return Ok(());
        }

        self.store.save_events(events.clone()).await?;
        aggregate.clear_uncommitted();

        for event in events {
            let published_type = format!("event.{}", event.event_type);
            let republished = event.retargeted(published_type);
            if let Err(e) = self.bus.publish(republished).await {
                error!(error = %e, "failed to publish aggregate event");
            }
        }

        info!(
            aggregate_id = %aggregate.aggregate_id(),
            version = aggregate.version(),
            "aggregate saved"
        );
        Ok(())
    }

    /// Write a snapshot of `aggregate`'s current state under the given
    /// `aggregate_type`.
    pub async fn create_snapshot(
        &self,
        aggregate: &dyn AggregateRoot,
        aggregate_type: impl Into<String>,
    ) -> Result<()> {
        let snapshot = AggregateSnapshot::new(
            aggregate.aggregate_id(),
            aggregate_type,
            aggregate.version(),
            aggregate.snapshot_state(),
        );
        self.store.save_snapshot(snapshot).await
    }
}

fn event_version(event: &DomainEvent) -> Option<u64> {
    event.metadata.get(META_VERSION).and_then(|v| v.as_u64())
}

/// Stamp an aggregate event with the metadata keys `load_aggregate`/
/// `save_events` key on: `metadata.aggregateId` and `metadata.version`.
pub fn tag_aggregate_event(
    event: DomainEvent,
    aggregate_id: impl Into<String>,
    version: u64,
) -> DomainEvent {
    event
        .with_metadata(META_AGGREGATE_ID, serde_json::json!(aggregate_id.into()))
        .with_metadata(META_VERSION, serde_json::json!(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;

    struct Counter {
        id: String,
        version: u64,
        count: i64,
        uncommitted: Vec<DomainEvent>,
    }

    impl Counter {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                version: 0,
                count: 0,
                uncommitted: Vec::new(),
            }
        }

        fn increment(&mut self, by: i64) {
            self.count += by;
            let next_version = self.version + 1;
            let event = tag_aggregate_event(
                DomainEvent::new("counter.incremented", serde_json::json!({"by": by})),
                self.id.clone(),
                next_version,
            );
            self.uncommitted.push(event);
            self.version = next_version;
        }
    }

    impl AggregateRoot for Counter {
        fn aggregate_id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn apply(&mut self, event: &DomainEvent) {
            if event.event_type == "counter.incremented" {
                self.count += event.payload["by"].as_i64().unwrap_or(0);
            }
            if let Some(v) = event_version(event) {
                self.version = v;
            }
        }
        fn uncommitted_events(&self) -> Vec<DomainEvent> {
            self.uncommitted.clone()
        }
        fn clear_uncommitted(&mut self) {
            self.uncommitted.clear();
        }
        fn load_from_snapshot(&mut self, version: u64, state: serde_json::Value) {
            self.version = version;
            self.count = state["count"].as_i64().unwrap_or(0);
        }
        fn snapshot_state(&self) -> serde_json::Value {
            serde_json::json!({"count": self.count})
        }
    }

    #[tokio::test]
    async fn test_save_and_load_aggregate_replays_events() {
        let bus = EventBus::new();
        let store = Arc::new(InMemoryEventStore::new());
        let plugin = EventSourcingPlugin::new(bus, store);
        plugin
            .register_aggregate_factory("Counter", Arc::new(|id| Box::new(Counter::new(id))))
            .await;

        let mut counter = Counter::new("c-1");
        counter.increment(5);
        counter.increment(3);
        plugin.save_aggregate(Box::new(counter)).await.unwrap();

        let loaded = plugin.load_aggregate("Counter", "c-1").await.unwrap();
        assert_eq!(loaded.version(), 2);
    }

    #[tokio::test]
    async fn test_save_aggregate_noop_when_no_uncommitted_events() {
        let bus = EventBus::new();
        let store = Arc::new(InMemoryEventStore::new());
        let plugin = EventSourcingPlugin::new(bus, store);
        let counter = Counter::new("c-2");
        plugin.save_aggregate(Box::new(counter)).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_dispatch_saves_aggregate_and_republishes() {
        let bus = EventBus::new();
        let store = Arc::new(InMemoryEventStore::new());
        let plugin = EventSourcingPlugin::new(bus.clone(), store.clone());
        plugin
            .register_aggregate_factory("Counter", Arc::new(|id| Box::new(Counter::new(id))))
            .await;

        let republished = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r = republished.clone();
        bus.subscribe(
            "event.counter.incremented",
            Arc::new(move |_payload| {
                let r = r.clone();
                Box::pin(async move {
                    r.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
            }),
            SubscriptionOptions::default(),
        )
        .await;

        let handler: CommandHandler = Arc::new(|command, aggregate| {
            Box::pin(async move {
                let by = command.payload["by"].as_i64().unwrap_or(1);
                let mut concrete = Counter::new(&command.aggregate_id);
                concrete.version = aggregate.version();
                concrete.increment(by);
                Ok(Box::new(concrete) as Box<dyn AggregateRoot>)
            })
        });
        plugin
            .register_command_handler("IncrementCounter", "Counter", handler)
            .await;

        bus.publish(DomainEvent::new(
            "command.IncrementCounter",
            serde_json::to_value(Command::new("IncrementCounter", "c-3", serde_json::json!({"by": 4})))
                .unwrap(),
        ))
        .await
        .unwrap();

        assert_eq!(republished.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.max_version("c-3").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_command_dispatch_unknown_type_emits_rejected() {
        let bus = EventBus::new();
        let store = Arc::new(InMemoryEventStore::new());
        let plugin = EventSourcingPlugin::new(bus.clone(), store);
        plugin
            .register_aggregate_factory("Counter", Arc::new(|id| Box::new(Counter::new(id))))
            .await;

        let rejected = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r = rejected.clone();
        bus.subscribe(
            "command.rejected",
            Arc::new(move |_payload| {
                let r = r.clone();
                Box::pin(async move {
                    r.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
            }),
            SubscriptionOptions::default(),
        )
        .await;

        let handler: CommandHandler =
            Arc::new(|_command, _aggregate| Box::pin(async move {
                Err(EventError::Validation("always rejects".into()))
            }));
        plugin
            .register_command_handler("AlwaysFails", "Counter", handler)
            .await;

        let _ = bus
            .publish(DomainEvent::new(
                "command.AlwaysFails",
                serde_json::to_value(Command::new(
                    "AlwaysFails",
                    "c-4",
                    serde_json::json!({}),
                ))
                .unwrap(),
            ))
            .await;

        assert_eq!(rejected.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_seeds_aggregate_and_skips_old_events() {
        let bus = EventBus::new();
        let store = Arc::new(InMemoryEventStore::new());
        let plugin = EventSourcingPlugin::new(bus, store.clone());
        plugin
            .register_aggregate_factory("Counter", Arc::new(|id| Box::new(Counter::new(id))))
            .await;

        let mut counter = Counter::new("c-5");
        counter.increment(10);
        plugin.save_aggregate(Box::new(counter)).await.unwrap();

        let loaded = plugin.load_aggregate("Counter", "c-5").await.unwrap();
        plugin
            .create_snapshot(loaded.as_ref(), "Counter")
            .await
            .unwrap();

        let mut counter2 = Counter::new("c-5");
        counter2.version = 1;
        counter2.increment(5);
        plugin.save_aggregate(Box::new(counter2)).await.unwrap();

        let from_snapshot = plugin
            .load_aggregate_from_snapshot("Counter", "c-5")
            .await
            .unwrap();
        assert_eq!(from_snapshot.version(), 2);
    }
}
