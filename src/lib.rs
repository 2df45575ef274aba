//! # reactive-messaging-core
//!
//! An in-process reactive messaging core: a pub/sub event bus with a
//! dependency-ordered extension pipeline, append-only event storage with
//! replay and correlation, content-based routing, and an event-sourcing
//! plugin for command-driven aggregates.
//!
//! ## Quick start
//!
//! ```rust
//! use reactive_messaging_core::{DomainEvent, EventBus, SubscriptionOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> reactive_messaging_core::Result<()> {
//! let bus = EventBus::new();
//!
//! bus.subscribe(
//!     "market.forex",
//!     Arc::new(|payload| Box::pin(async move {
//!         println!("forex update: {payload}");
//!         Ok(())
//!     })),
//!     SubscriptionOptions::default(),
//! ).await;
//!
//! bus.publish(DomainEvent::new("market.forex", serde_json::json!({"rate": 7.35})))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`types`] — the wire envelope (`DomainEvent`), subscription options,
//!   and the backpressure trait.
//! - [`extensions`] — a dependency-ordered hook pipeline wired into publish
//!   at `event.beforePublish`/`event.afterPublish`.
//! - [`store`] — append-only event storage indexed by insertion order,
//!   type, and correlation id, plus aggregate snapshots.
//! - [`bus`] — the `EventBus` itself: the publish algorithm, subscription
//!   management, filters, routers, and backpressure.
//! - [`source`] — replays stored events back through a bus.
//! - [`sourcing`] — command dispatch and event-sourced aggregates on top of
//!   a bus and a store.
//! - [`router`] — content-based routing: republish transformed copies of
//!   matching events under derived types.

pub mod bus;
pub mod error;
pub mod extensions;
pub mod ids;
pub mod router;
pub mod source;
pub mod sourcing;
pub mod store;
pub mod types;

pub use bus::EventBus;
pub use error::{EventError, Result};
pub use extensions::{
    Extension, ExtensionSystem, HookFn, HookRegistration, EVENT_AFTER_PUBLISH,
    EVENT_BEFORE_PUBLISH, SYSTEM_INIT, TASK_AFTER_EXECUTE, TASK_BEFORE_EXECUTE,
};
pub use router::{ContentBasedRouter, Route, ROUTE_MATCHED_EVENT};
pub use source::EventSource;
pub use sourcing::{AggregateRoot, Command, EventSourcingPlugin};
pub use store::{AggregateSnapshot, EventStore, InMemoryEventStore};
pub use types::{
    BackpressureStrategy, DomainEvent, FilterFn, HandlerFn, Metadata, ObserverFn, RouterFn,
    SubscriptionHandle, SubscriptionOptions, ThresholdBackpressure,
};
