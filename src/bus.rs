//! The event bus — publish/subscribe dispatch, filters, backpressure,
//! routers, and optional persistence.
//!
//! Subscription maps live behind `Arc<RwLock<HashMap<...>>>`; dispatch runs
//! entirely in-process, with the extension-hook, backpressure, and router
//! stages wired into the publish pipeline.

use crate::error::{EventError, Result};
use crate::extensions::{ExtensionSystem, EVENT_AFTER_PUBLISH, EVENT_BEFORE_PUBLISH};
use crate::ids::new_subscription_id;
use crate::store::EventStore;
use crate::types::{
    BackpressureStrategy, DomainEvent, FilterFn, HandlerFn, ObserverFn, RouterFn, Subscription,
    SubscriptionHandle, SubscriptionOptions,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// In-process pub/sub event bus.
///
/// Cheaply cloneable: internally `Arc`-backed, so handing out clones to
/// plugins (the event-sourcing plugin, the router) shares the same
/// subscription/storage state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    filters: RwLock<Vec<FilterFn>>,
    routers: RwLock<Vec<RouterFn>>,
    observers: RwLock<Vec<ObserverFn>>,
    backpressure: RwLock<HashMap<String, Arc<dyn BackpressureStrategy>>>,
    in_flight: RwLock<HashMap<String, Arc<AtomicU64>>>,
    extensions: RwLock<Option<Arc<ExtensionSystem>>>,
    store: RwLock<Option<Arc<dyn EventStore>>>,
    sequence: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: RwLock::new(HashMap::new()),
                filters: RwLock::new(Vec::new()),
                routers: RwLock::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
                backpressure: RwLock::new(HashMap::new()),
                in_flight: RwLock::new(HashMap::new()),
                extensions: RwLock::new(None),
                store: RwLock::new(None),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Wire an extension system into the publish pipeline's
    /// `event.beforePublish`/`event.afterPublish` points.
    pub async fn with_extensions(self, extensions: Arc<ExtensionSystem>) -> Self {
        *self.inner.extensions.write().await = Some(extensions);
        self
    }

    /// Enable storage of every published event into `store`.
    pub async fn enable_persistence(&self, store: Arc<dyn EventStore>) {
        *self.inner.store.write().await = Some(store);
    }

    /// Disable persistence. Previously stored events are unaffected.
    pub async fn disable_persistence(&self) {
        *self.inner.store.write().await = None;
    }

    /// Install a per-event-type backpressure strategy.
    pub async fn apply_backpressure(
        &self,
        event_type: impl Into<String>,
        strategy: Arc<dyn BackpressureStrategy>,
    ) {
        self.inner
            .backpressure
            .write()
            .await
            .insert(event_type.into(), strategy);
    }

    /// Append a global filter; an event is dropped before dispatch if any
    /// global filter returns `false`.
    pub async fn add_event_filter(&self, filter: FilterFn) {
        self.inner.filters.write().await.push(filter);
    }

    /// Append a content router consulted after `event.beforePublish` on
    /// every publish.
    pub async fn add_event_router(&self, router: RouterFn) {
        self.inner.routers.write().await.push(router);
    }

    /// Append a publish observer, awaited with a clone of every event that
    /// completes dispatch, before `publish` returns. Used by auxiliary
    /// components that need to react to every publish automatically, such
    /// as the content-based router.
    pub async fn add_event_observer(&self, observer: ObserverFn) {
        self.inner.observers.write().await.push(observer);
    }

    /// Subscribe `handler` to `event_type`.
    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: HandlerFn,
        options: SubscriptionOptions,
    ) -> SubscriptionHandle {
        self.subscribe_with_filter(event_type, None, handler, options)
            .await
    }

    /// Subscribe `handler` to `event_type`, additionally gated by `filter`.
    pub async fn subscribe_with_filter(
        &self,
        event_type: impl Into<String>,
        filter: Option<FilterFn>,
        handler: HandlerFn,
        options: SubscriptionOptions,
    ) -> SubscriptionHandle {
        let event_type = event_type.into();
        let id = new_subscription_id();
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);

        let subscription = Subscription {
            id: id.clone(),
            event_type: event_type.clone(),
            handler,
            filter,
            options,
            sequence,
        };

        self.inner
            .subscriptions
            .write()
            .await
            .entry(event_type.clone())
            .or_default()
            .push(subscription);

        SubscriptionHandle { id, event_type }
    }

    /// Remove a single subscription by id. No-op if unknown.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut subs = self.inner.subscriptions.write().await;
        if let Some(list) = subs.get_mut(&handle.event_type) {
            list.retain(|s| s.id != handle.id);
        }
    }

    /// Remove every subscription for `event_type`.
    pub async fn clear_subscriptions(&self, event_type: &str) {
        self.inner.subscriptions.write().await.remove(event_type);
    }

    /// Remove every subscription for every event type.
    pub async fn clear_all_subscriptions(&self) {
        self.inner.subscriptions.write().await.clear();
    }

    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .await
            .get(event_type)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub async fn has_subscribers(&self, event_type: &str) -> bool {
        self.subscriber_count(event_type).await > 0
    }

    /// Events sharing `correlation_id`, delegated to the store. Empty if
    /// persistence is disabled.
    pub async fn correlate(&self, correlation_id: &str) -> Result<Vec<DomainEvent>> {
        match self.inner.store.read().await.as_ref() {
            Some(store) => store.events_by_correlation_id(correlation_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Publish a sequence of events in order, stopping at the first error.
    pub async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Publish a single event through the full pipeline: global filters,
    /// `event.beforePublish`, backpressure, priority-sorted dispatch,
    /// one-shot pruning, router fan-out, publish observers, storage,
    /// `event.afterPublish`.
    pub async fn publish(&self, event: DomainEvent) -> Result<()> {
        event.validate()?;

        for filter in self.inner.filters.read().await.iter() {
            if !filter(&event) {
                debug!(event_type = %event.event_type, "event dropped by global filter");
                return Ok(());
            }
        }

        let event = self.run_before_publish(event).await?;

        let queue_depth = self.enter_in_flight(&event.event_type).await;
        if let Some(strategy) = self
            .inner
            .backpressure
            .read()
            .await
            .get(&event.event_type)
            .cloned()
        {
            if !strategy.should_accept(queue_depth) {
                let delay = strategy.calculate_delay();
                warn!(event_type = %event.event_type, ?delay, "backpressure engaged, delaying dispatch");
                tokio::time::sleep(delay).await;
            }
        }

        let result = self.dispatch(&event).await;
        self.leave_in_flight(&event.event_type).await;
        result?;

        self.fan_out_routers(&event).await;
        self.run_observers(&event).await;

        if let Some(store) = self.inner.store.read().await.as_ref() {
            if let Err(e) = store.store_event(event.clone()).await {
                error!(error = %e, event_type = %event.event_type, "failed to persist event");
            }
        }

        self.run_after_publish(&event).await;

        Ok(())
    }

    async fn run_before_publish(&self, event: DomainEvent) -> Result<DomainEvent> {
        let Some(extensions) = self.inner.extensions.read().await.clone() else {
            return Ok(event);
        };

        let params = serde_json::json!({
            "eventType": event.event_type,
            "payload": event.payload,
        });

        let rewritten = extensions
            .execute_extension_point(EVENT_BEFORE_PUBLISH, params)
            .await
            .map_err(|e| EventError::Hook(e.to_string()))?;

        let mut event = event;
        if let Some(payload) = rewritten.get("payload") {
            event.payload = payload.clone();
        }
        Ok(event)
    }

    async fn run_after_publish(&self, event: &DomainEvent) {
        let Some(extensions) = self.inner.extensions.read().await.clone() else {
            return;
        };

        let params = serde_json::json!({
            "eventId": event.id,
            "eventType": event.event_type,
            "payload": event.payload,
        });

        if let Err(e) = extensions
            .execute_extension_point(EVENT_AFTER_PUBLISH, params)
            .await
        {
            error!(error = %e, event_type = %event.event_type, "event.afterPublish hook failed");
        }
    }

    async fn enter_in_flight(&self, event_type: &str) -> usize {
        let counter = {
            let mut map = self.inner.in_flight.write().await;
            map.entry(event_type.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        counter.fetch_add(1, Ordering::SeqCst) as usize
    }

    async fn leave_in_flight(&self, event_type: &str) {
        if let Some(counter) = self.inner.in_flight.read().await.get(event_type) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn dispatch(&self, event: &DomainEvent) -> Result<()> {
        let mut snapshot: Vec<Subscription> = self
            .inner
            .subscriptions
            .read()
            .await
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        // Every once=true subscription present in this snapshot is pruned
        // below regardless of per-subscription filter match, so capture the
        // ids before `retain` drops the ones the filter rejects.
        let once_ids: Vec<String> = snapshot
            .iter()
            .filter(|s| s.options.once)
            .map(|s| s.id.clone())
            .collect();

        snapshot.retain(|s| s.filter.as_ref().map(|f| f(event)).unwrap_or(true));
        snapshot.sort_by(|a, b| {
            b.options
                .priority
                .cmp(&a.options.priority)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        for sub in &snapshot {
            if let Err(e) = (sub.handler)(event.payload.clone()).await {
                error!(
                    error = %e,
                    subscription_id = %sub.id,
                    event_type = %event.event_type,
                    "subscriber handler failed"
                );
            }
        }

        if !once_ids.is_empty() {
            if let Some(list) = self
                .inner
                .subscriptions
                .write()
                .await
                .get_mut(&event.event_type)
            {
                list.retain(|s| !once_ids.contains(&s.id));
            }
        }

        Ok(())
    }

    async fn fan_out_routers(&self, event: &DomainEvent) {
        let routers = self.inner.routers.read().await.clone();
        for router in routers.iter() {
            let targets = router(event);
            for target in targets {
                if target == event.event_type {
                    continue;
                }
                let derived = event.retargeted(target);
                if let Err(e) = Box::pin(self.publish(derived)).await {
                    error!(error = %e, "router fan-out publish failed");
                }
            }
        }
    }

    async fn run_observers(&self, event: &DomainEvent) {
        let observers = self.inner.observers.read().await.clone();
        for observer in observers.iter() {
            if let Err(e) = observer(event.clone()).await {
                error!(error = %e, event_type = %event.event_type, "publish observer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThresholdBackpressure;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn record_handler(counter: Arc<AtomicUsize>) -> HandlerFn {
        Arc::new(move |_payload| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_publish_dispatches_to_subscriber() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "market.forex",
            record_handler(hits.clone()),
            SubscriptionOptions::default(),
        )
        .await;

        bus.publish(DomainEvent::new("market.forex", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(
            "t",
            Arc::new(move |_p| {
                let o = o1.clone();
                Box::pin(async move {
                    o.lock().unwrap().push("low");
                    Ok(())
                })
            }),
            SubscriptionOptions {
                priority: 1,
                ..Default::default()
            },
        )
        .await;

        let o2 = order.clone();
        bus.subscribe(
            "t",
            Arc::new(move |_p| {
                let o = o2.clone();
                Box::pin(async move {
                    o.lock().unwrap().push("high");
                    Ok(())
                })
            }),
            SubscriptionOptions {
                priority: 10,
                ..Default::default()
            },
        )
        .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_once_subscription_removed_after_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "t",
            record_handler(hits.clone()),
            SubscriptionOptions {
                once: true,
                ..Default::default()
            },
        )
        .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();
        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_once_subscription_pruned_even_when_filter_rejects() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let filter: FilterFn = Arc::new(|e: &DomainEvent| e.payload["ok"] == true);
        bus.subscribe_with_filter(
            "t",
            Some(filter),
            record_handler(hits.clone()),
            SubscriptionOptions {
                once: true,
                ..Default::default()
            },
        )
        .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({"ok": false})))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_global_filter_drops_event() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "t",
            record_handler(hits.clone()),
            SubscriptionOptions::default(),
        )
        .await;
        bus.add_event_filter(Arc::new(|e: &DomainEvent| e.event_type != "t"))
            .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_filter_gates_dispatch() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let filter: FilterFn = Arc::new(|e: &DomainEvent| e.payload["ok"] == true);
        bus.subscribe_with_filter(
            "t",
            Some(filter),
            record_handler(hits.clone()),
            SubscriptionOptions::default(),
        )
        .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({"ok": false})))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.publish(DomainEvent::new("t", serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = bus
            .subscribe(
                "t",
                record_handler(hits.clone()),
                SubscriptionOptions::default(),
            )
            .await;

        bus.unsubscribe(&handle).await;
        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_router_fans_out_to_derived_type() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "market.forex.high",
            record_handler(hits.clone()),
            SubscriptionOptions::default(),
        )
        .await;

        bus.add_event_router(Arc::new(|e: &DomainEvent| {
            if e.event_type == "market.forex" && e.payload["rate"].as_f64().unwrap_or(0.0) > 7.0 {
                vec!["market.forex.high".to_string()]
            } else {
                Vec::new()
            }
        }))
        .await;

        bus.publish(DomainEvent::new(
            "market.forex",
            serde_json::json!({"rate": 7.5}),
        ))
        .await
        .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_router_self_loop_skipped() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "t",
            record_handler(hits.clone()),
            SubscriptionOptions::default(),
        )
        .await;
        bus.add_event_router(Arc::new(|e: &DomainEvent| vec![e.event_type.clone()]))
            .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_observer_runs_before_publish_returns() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.add_event_observer(Arc::new(move |event: DomainEvent| {
            let s = s.clone();
            Box::pin(async move {
                s.lock().unwrap().push(event.event_type);
                Ok(())
            })
        }))
        .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_backpressure_delays_dispatch() {
        let bus = EventBus::new();
        bus.apply_backpressure(
            "t",
            Arc::new(ThresholdBackpressure::new(0, Duration::from_millis(5))),
        )
        .await;

        let start = std::time::Instant::now();
        bus.publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        use crate::store::InMemoryEventStore;

        let bus = EventBus::new();
        let store = Arc::new(InMemoryEventStore::new());
        bus.enable_persistence(store.clone()).await;

        bus.publish(
            DomainEvent::new("t", serde_json::json!({})).with_correlation_id("c-1"),
        )
        .await
        .unwrap();

        let correlated = bus.correlate("c-1").await.unwrap();
        assert_eq!(correlated.len(), 1);
    }

    #[tokio::test]
    async fn test_extension_hook_rewrites_payload() {
        use crate::extensions::{Extension, ExtensionSystem, HookFn, HookRegistration};
        use async_trait::async_trait;

        struct Doubler;
        #[async_trait]
        impl Extension for Doubler {
            fn id(&self) -> &str {
                "doubler"
            }
            fn name(&self) -> &str {
                "doubler"
            }
            fn hooks(&self) -> Vec<HookRegistration> {
                let hook: HookFn = Arc::new(|params| {
                    Box::pin(async move {
                        let n = params["payload"]["n"].as_i64().unwrap_or(0);
                        Ok(serde_json::json!({"payload": {"n": n * 2}}))
                    })
                });
                vec![HookRegistration::new(EVENT_BEFORE_PUBLISH, 0, hook)]
            }
        }

        let extensions = Arc::new(ExtensionSystem::new());
        extensions.register_extension(Arc::new(Doubler)).await.unwrap();

        let bus = EventBus::new().with_extensions(extensions).await;
        let seen = Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        bus.subscribe(
            "t",
            Arc::new(move |payload| {
                let s = s.clone();
                Box::pin(async move {
                    *s.lock().unwrap() = Some(payload);
                    Ok(())
                })
            }),
            SubscriptionOptions::default(),
        )
        .await;

        bus.publish(DomainEvent::new("t", serde_json::json!({"n": 5})))
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().clone().unwrap()["n"], 10);
    }

    #[tokio::test]
    async fn test_hook_error_aborts_publish() {
        use crate::extensions::{Extension, ExtensionSystem, HookFn, HookRegistration};
        use async_trait::async_trait;

        struct Failer;
        #[async_trait]
        impl Extension for Failer {
            fn id(&self) -> &str {
                "failer"
            }
            fn name(&self) -> &str {
                "failer"
            }
            fn hooks(&self) -> Vec<HookRegistration> {
                let hook: HookFn =
                    Arc::new(|_| Box::pin(async move { Err(EventError::Hook("nope".into())) }));
                vec![HookRegistration::new(EVENT_BEFORE_PUBLISH, 0, hook)]
            }
        }

        let extensions = Arc::new(ExtensionSystem::new());
        extensions.register_extension(Arc::new(Failer)).await.unwrap();
        let bus = EventBus::new().with_extensions(extensions).await;

        let err = bus
            .publish(DomainEvent::new("t", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Hook(_)));
    }

    #[tokio::test]
    async fn test_publish_all_preserves_order_and_stops_on_error() {
        let bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o = order.clone();
        bus.subscribe(
            "t",
            Arc::new(move |payload| {
                let o = o.clone();
                Box::pin(async move {
                    o.lock().unwrap().push(payload["i"].as_i64().unwrap());
                    Ok(())
                })
            }),
            SubscriptionOptions::default(),
        )
        .await;

        let events = vec![
            DomainEvent::new("t", serde_json::json!({"i": 1})),
            DomainEvent::new("t", serde_json::json!({"i": 2})),
            DomainEvent::new("", serde_json::json!({"i": 3})),
        ];

        let err = bus.publish_all(events).await.unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
