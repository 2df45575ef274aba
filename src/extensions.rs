//! Extension system — dependency-ordered hook pipeline
//!
//! A trait-object registry behind `RwLock`s, with dependency-graph
//! bookkeeping layered on top: extensions declare dependencies on other
//! extensions by id, and hook execution at a named extension point runs in
//! the extensions' topological order (Kahn's algorithm), with hooks within
//! one extension run by descending priority.

use crate::error::{EventError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// System initialization point. Params `{version, config}`.
pub const SYSTEM_INIT: &str = "system.init";
/// Runs before an event is dispatched to subscribers. Params
/// `{eventType, payload}`; a hook may return rewritten params to substitute
/// the payload that reaches subscribers.
pub const EVENT_BEFORE_PUBLISH: &str = "event.beforePublish";
/// Runs after dispatch, router fan-out, publish observers, and storage
/// complete. Params `{eventId, eventType, payload}`.
pub const EVENT_AFTER_PUBLISH: &str = "event.afterPublish";
/// Task collaborator surface — defined here as a named point only; no task
/// executor is implemented in this crate.
pub const TASK_BEFORE_EXECUTE: &str = "task.beforeExecute";
/// Task collaborator surface — defined here as a named point only.
pub const TASK_AFTER_EXECUTE: &str = "task.afterExecute";

/// An extension hook: receives the pipeline's running params and returns
/// either rewritten params or an error that aborts the pipeline.
pub type HookFn = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync,
>;

/// A single hook registration returned by `Extension::hooks()`.
pub struct HookRegistration {
    pub point_name: String,
    pub hook: HookFn,
    pub priority: i32,
}

impl HookRegistration {
    pub fn new(point_name: impl Into<String>, priority: i32, hook: HookFn) -> Self {
        Self {
            point_name: point_name.into(),
            hook,
            priority,
        }
    }
}

/// A pluggable extension observing/rewriting the publish pipeline.
///
/// Extensions are identified by a unique `id` and may declare dependencies
/// on other extension ids; the extension system runs hooks for a given
/// point in dependency order (dependencies before dependents).
#[async_trait]
pub trait Extension: Send + Sync {
    /// Unique id within the extension system.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Ids of other extensions that must be registered (and run) before
    /// this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Hook registrations this extension contributes.
    fn hooks(&self) -> Vec<HookRegistration>;

    /// Semantic version string.
    fn version(&self) -> &str {
        "0.1.0"
    }

    /// Free-form capability tags, for diagnostics.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Dependency-ordered registry of extensions, and the hook runner for
/// named extension points.
pub struct ExtensionSystem {
    extensions: RwLock<HashMap<String, Arc<dyn Extension>>>,
    points: RwLock<HashSet<String>>,
    /// Cached topological order, recomputed on register/unregister.
    topo_order: RwLock<Vec<String>>,
}

impl Default for ExtensionSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionSystem {
    pub fn new() -> Self {
        Self {
            extensions: RwLock::new(HashMap::new()),
            points: RwLock::new(HashSet::new()),
            topo_order: RwLock::new(Vec::new()),
        }
    }

    /// Idempotent registration of a known extension point name.
    pub async fn register_extension_point(&self, name: impl Into<String>) {
        let mut points = self.points.write().await;
        points.insert(name.into());
    }

    pub async fn has_extension_point(&self, name: &str) -> bool {
        self.points.read().await.contains(name)
    }

    /// Register an extension. Fails if the id already exists, a declared
    /// dependency is missing, or the resulting graph has a cycle.
    pub async fn register_extension(&self, ext: Arc<dyn Extension>) -> Result<()> {
        let id = ext.id().to_string();
        let mut extensions = self.extensions.write().await;

        if extensions.contains_key(&id) {
            return Err(EventError::Validation(format!(
                "extension '{id}' is already registered"
            )));
        }

        for dep in ext.dependencies() {
            if !extensions.contains_key(&dep) {
                return Err(EventError::Validation(format!(
                    "extension '{id}' depends on unregistered extension '{dep}'"
                )));
            }
        }

        extensions.insert(id.clone(), ext);

        match topological_order(&extensions) {
            Ok(order) => {
                *self.topo_order.write().await = order;
                Ok(())
            }
            Err(e) => {
                // Roll back — a cycle means this registration is rejected.
                extensions.remove(&id);
                Err(e)
            }
        }
    }

    /// Unregister an extension. Fails if any other registered extension
    /// still depends on it.
    pub async fn unregister_extension(&self, id: &str) -> Result<()> {
        let mut extensions = self.extensions.write().await;

        if !extensions.contains_key(id) {
            return Err(EventError::NotFound(format!(
                "extension '{id}' is not registered"
            )));
        }

        let dependents: Vec<String> = extensions
            .values()
            .filter(|e| e.id() != id && e.dependencies().iter().any(|d| d == id))
            .map(|e| e.id().to_string())
            .collect();

        if !dependents.is_empty() {
            return Err(EventError::Validation(format!(
                "cannot unregister '{id}': depended on by {dependents:?}"
            )));
        }

        extensions.remove(id);
        let order = topological_order(&extensions)
            .expect("removing a node from an acyclic graph cannot introduce a cycle");
        *self.topo_order.write().await = order;
        Ok(())
    }

    pub async fn extensions(&self) -> Vec<Arc<dyn Extension>> {
        self.extensions.read().await.values().cloned().collect()
    }

    pub async fn extension(&self, id: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.read().await.get(id).cloned()
    }

    pub async fn has_extension(&self, id: &str) -> bool {
        self.extensions.read().await.contains_key(id)
    }

    /// Run every hook registered at `point_name`, in extension dependency
    /// order (dependencies first), then by descending hook priority within
    /// one extension. Returns the final (possibly rewritten) params, or the
    /// first hook error encountered.
    pub async fn execute_extension_point(
        &self,
        point_name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let order = self.topo_order.read().await.clone();
        let extensions = self.extensions.read().await;

        let mut current = params;
        for ext_id in &order {
            let Some(ext) = extensions.get(ext_id) else {
                continue;
            };
            let mut hooks: Vec<HookRegistration> = ext
                .hooks()
                .into_iter()
                .filter(|h| h.point_name == point_name)
                .collect();
            hooks.sort_by(|a, b| b.priority.cmp(&a.priority));

            for reg in hooks {
                current = (reg.hook)(current).await?;
            }
        }

        Ok(current)
    }
}

/// Kahn's algorithm over the dependency graph. Returns the extension ids in
/// an order where every extension appears after all of its dependencies.
/// Ties among ready nodes are broken lexicographically for determinism.
fn topological_order(extensions: &HashMap<String, Arc<dyn Extension>>) -> Result<Vec<String>> {
    let mut in_degree: HashMap<String, usize> =
        extensions.keys().map(|id| (id.clone(), 0)).collect();
    let mut successors: HashMap<String, Vec<String>> =
        extensions.keys().map(|id| (id.clone(), Vec::new())).collect();

    for ext in extensions.values() {
        for dep in ext.dependencies() {
            if let Some(list) = successors.get_mut(&dep) {
                list.push(ext.id().to_string());
            }
            if let Some(deg) = in_degree.get_mut(ext.id()) {
                *deg += 1;
            }
        }
    }

    let mut ready: Vec<String> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| id.clone())
        .collect();
    ready.sort();
    let mut queue: VecDeque<String> = ready.into();

    let mut order = Vec::with_capacity(extensions.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        let mut newly_ready = Vec::new();
        if let Some(succs) = successors.get(&id) {
            for succ in succs {
                let deg = in_degree.get_mut(succ).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(succ.clone());
                }
            }
        }
        newly_ready.sort();
        for n in newly_ready {
            queue.push_back(n);
        }
    }

    if order.len() != extensions.len() {
        let stuck: Vec<String> = extensions
            .keys()
            .filter(|id| !order.contains(id))
            .cloned()
            .collect();
        return Err(EventError::Validation(format!(
            "dependency cycle detected among extensions: {stuck:?}"
        )));
    }

    Ok(order)
}
