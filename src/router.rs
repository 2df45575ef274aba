//! Content-based router — observes events and republishes transformed
//! copies to derived types when a route matches.
//!
//! Routes live in a name-keyed map behind a `RwLock`, with a side list
//! preserving registration order for deterministic iteration.

use crate::bus::EventBus;
use crate::error::{EventError, Result};
use crate::ids::now_millis;
use crate::types::DomainEvent;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

/// Predicate over an event used for route matching beyond JSON-path
/// equality.
pub type RoutePredicate = Arc<dyn Fn(&DomainEvent) -> bool + Send + Sync>;
/// Payload rewrite applied to a matched event before publishing under the
/// target type.
pub type PayloadTransform = Arc<dyn Fn(&serde_json::Value) -> serde_json::Value + Send + Sync>;

/// A single routing rule.
#[derive(Clone)]
pub struct Route {
    pub name: String,
    pub source_event_type: Option<String>,
    pub json_path: Option<String>,
    pub expected_value: Option<serde_json::Value>,
    pub predicate: Option<RoutePredicate>,
    pub target_event_type: String,
    pub transform_payload: Option<PayloadTransform>,
}

impl Route {
    pub fn new(name: impl Into<String>, target_event_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_event_type: None,
            json_path: None,
            expected_value: None,
            predicate: None,
            target_event_type: target_event_type.into(),
            transform_payload: None,
        }
    }

    pub fn with_source_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.source_event_type = Some(event_type.into());
        self
    }

    pub fn with_json_path_match(
        mut self,
        json_path: impl Into<String>,
        expected_value: serde_json::Value,
    ) -> Self {
        self.json_path = Some(json_path.into());
        self.expected_value = Some(expected_value);
        self
    }

    pub fn with_predicate(mut self, predicate: RoutePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_transform(mut self, transform: PayloadTransform) -> Self {
        self.transform_payload = Some(transform);
        self
    }

    fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(ref source) = self.source_event_type {
            if source != &event.event_type {
                return false;
            }
        }

        if let Some(ref predicate) = self.predicate {
            if predicate(event) {
                return true;
            }
        }

        if let (Some(path), Some(expected)) = (&self.json_path, &self.expected_value) {
            if let Some(actual) = resolve_json_path(&event.payload, path) {
                return &actual == expected;
            }
            return false;
        }

        self.predicate.is_none() && self.json_path.is_none() && self.source_event_type.is_some()
    }
}

/// Resolves a minimal JSON-path dialect: dot-separated segments, optional
/// `[idx]` array index suffixes, optional leading `$` root marker. Any
/// navigation through a missing key or `null` yields `None`.
fn resolve_json_path<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        let (field, index) = match segment.find('[') {
            Some(bracket_pos) => {
                let field = &segment[..bracket_pos];
                let idx_str = segment[bracket_pos + 1..].trim_end_matches(']');
                let idx: usize = idx_str.parse().ok()?;
                (field, Some(idx))
            }
            None => (segment, None),
        };

        current = if field.is_empty() {
            current
        } else {
            current.get(field)?
        };

        if let Some(idx) = index {
            current = current.get(idx)?;
        }

        if current.is_null() {
            return None;
        }
    }

    Some(current)
}

/// Diagnostic event type published when `emit_route_events` is enabled and
/// a route matches.
pub const ROUTE_MATCHED_EVENT: &str = "router.route.matched";

struct Inner {
    routes: HashMap<String, Route>,
    order: Vec<String>,
    emit_route_events: bool,
}

/// Observes every event published on a bus and republishes transformed
/// copies to derived types for each matching route.
pub struct ContentBasedRouter {
    bus: EventBus,
    inner: RwLock<Inner>,
}

impl ContentBasedRouter {
    /// Build a router and register it as a publish observer on `bus`, so
    /// every subsequent `bus.publish(...)` evaluates routes automatically.
    /// Callers never need to invoke [`route_event`](Self::route_event)
    /// themselves.
    ///
    /// The observer closure holds only a `Weak` reference back to the
    /// router, so the router and the bus don't keep each other alive.
    pub async fn new(bus: EventBus, emit_route_events: bool) -> Arc<Self> {
        let router = Arc::new(Self {
            bus: bus.clone(),
            inner: RwLock::new(Inner {
                routes: HashMap::new(),
                order: Vec::new(),
                emit_route_events,
            }),
        });

        let weak_router: Weak<ContentBasedRouter> = Arc::downgrade(&router);
        bus.add_event_observer(Arc::new(move |event: DomainEvent| {
            let weak_router = weak_router.clone();
            Box::pin(async move {
                match weak_router.upgrade() {
                    Some(router) => router.route_event(&event).await,
                    None => Ok(()),
                }
            })
        }))
        .await;

        router
    }

    pub async fn register_route(&self, route: Route) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.routes.contains_key(&route.name) {
            return Err(EventError::Validation(format!(
                "route '{}' is already registered",
                route.name
            )));
        }
        inner.order.push(route.name.clone());
        inner.routes.insert(route.name.clone(), route);
        Ok(())
    }

    pub async fn update_route(&self, route: Route) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.routes.contains_key(&route.name) {
            return Err(EventError::NotFound(format!(
                "route '{}' does not exist",
                route.name
            )));
        }
        inner.routes.insert(route.name.clone(), route);
        Ok(())
    }

    pub async fn remove_route(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.routes.remove(name).is_none() {
            return Err(EventError::NotFound(format!("route '{name}' does not exist")));
        }
        inner.order.retain(|n| n != name);
        Ok(())
    }

    pub async fn route(&self, name: &str) -> Option<Route> {
        self.inner.read().await.routes.get(name).cloned()
    }

    pub async fn routes(&self) -> Vec<Route> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|name| inner.routes.get(name).cloned())
            .collect()
    }

    /// Evaluate every route against `event`, publishing a retargeted copy
    /// for each match, in route registration order.
    pub async fn route_event(&self, event: &DomainEvent) -> Result<()> {
        let (routes, emit_route_events) = {
            let inner = self.inner.read().await;
            let routes: Vec<Route> = inner
                .order
                .iter()
                .filter_map(|name| inner.routes.get(name).cloned())
                .collect();
            (routes, inner.emit_route_events)
        };

        for route in routes {
            if !route.matches(event) {
                continue;
            }

            debug!(route = %route.name, event_type = %event.event_type, "route matched");

            let payload = match &route.transform_payload {
                Some(transform) => transform(&event.payload),
                None => event.payload.clone(),
            };

            let mut retargeted = DomainEvent::new(route.target_event_type.clone(), payload);
            if let Some(ref cid) = event.correlation_id {
                retargeted = retargeted.with_correlation_id(cid.clone());
            }
            self.bus.publish(retargeted).await?;

            if emit_route_events {
                self.bus
                    .publish(DomainEvent::new(
                        ROUTE_MATCHED_EVENT,
                        serde_json::json!({
                            "routeName": route.name,
                            "originalEventType": event.event_type,
                            "targetEventType": route.target_event_type,
                            "timestamp": now_millis(),
                        }),
                    ))
                    .await?;
            }
        }

        Ok(())
    }
}
