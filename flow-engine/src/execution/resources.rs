// Resource Lifecycle Manager
// Live instance map, LIFO cleanup stack, and once-guarded destruction

use super::events::{EventSender, ExecutionEvent, ProgressSender};
use super::node::Node;
use crate::address::Address;
use crate::handlers::{ResourceHandler, ResourceInstance};

use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};

struct LiveResource {
    instance: ResourceInstance,
    handler: Arc<dyn ResourceHandler>,
}

/// Owns every created resource instance for the duration of one run
pub struct ResourceManager {
    live: DashMap<Address, LiveResource>,
    /// Creation order; the sweep walks it back to front
    cleanup: Mutex<Vec<Arc<Node>>>,
    progress: Option<ProgressSender>,
}

impl ResourceManager {
    pub fn new(progress: Option<ProgressSender>) -> Self {
        Self {
            live: DashMap::new(),
            cleanup: Mutex::new(Vec::new()),
            progress,
        }
    }

    /// Store a freshly created instance and push its node onto the cleanup stack
    pub fn register(
        &self,
        node: Arc<Node>,
        handler: Arc<dyn ResourceHandler>,
        instance: ResourceInstance,
    ) {
        self.live.insert(
            node.address().clone(),
            LiveResource { instance, handler },
        );
        self.cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node.clone());

        tracing::debug!(resource = %node.address(), "resource created");
        self.progress
            .send_event(ExecutionEvent::resource_created(node.address()));
    }

    /// The live instance for `address`, if created and not yet destroyed
    pub fn instance(&self, address: &Address) -> Option<ResourceInstance> {
        self.live.get(address).map(|live| live.instance.clone())
    }

    pub fn is_live(&self, address: &Address) -> bool {
        self.live.contains_key(address)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Eagerly destroy a resource whose last direct step dependent finished.
    ///
    /// Returns true if this call invoked the destroy handler.
    pub async fn destroy(&self, node: &Node) -> bool {
        self.release(node, true).await
    }

    /// Destroy everything still live in reverse creation order.
    ///
    /// Destroy failures are logged and do not stop the sweep.
    pub async fn shutdown(&self) {
        let stack = std::mem::take(&mut *self.cleanup.lock().unwrap_or_else(PoisonError::into_inner));
        let mut released = 0;
        for node in stack.iter().rev() {
            if self.release(node, false).await {
                released += 1;
            }
        }
        tracing::debug!(released, "resource shutdown sweep finished");
    }

    async fn release(&self, node: &Node, eager: bool) -> bool {
        if !node.claim_destroy() {
            return false;
        }
        let Some((address, live)) = self.live.remove(node.address()) else {
            return false;
        };

        // Own task so a panicking handler cannot abort the rest of the sweep
        let handler = live.handler.clone();
        let value = live.instance.value().clone();
        let outcome = match tokio::spawn(async move { handler.destroy(value).await }).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("destroy handler panicked: {}", panic_message(e))),
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(resource = %address, eager, "resource destroyed");
            }
            Err(e) => {
                tracing::warn!(resource = %address, eager, error = %e, "failed to destroy resource");
                self.progress.send_event(ExecutionEvent::warning(
                    format!("failed to destroy {}: {}", address, e),
                    Some(address.clone()),
                ));
            }
        }

        self.progress
            .send_event(ExecutionEvent::resource_destroyed(&address, eager));
        true
    }
}

/// Best-effort text of a panic payload carried by a failed join
pub(crate) fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::execution::node::{Instance, NodeConfig};
    use crate::execution::testing::{registry_with, Journal};
    use serde_json::json;

    fn resource_node(name: &str) -> Arc<Node> {
        let config = ResourceConfig::new("store", name);
        Arc::new(Node::new(
            config.address(),
            NodeConfig::Resource(Arc::new(config)),
            Instance::Single,
        ))
    }

    async fn create(
        manager: &ResourceManager,
        handler: &Arc<dyn ResourceHandler>,
        name: &str,
        args: serde_json::Value,
    ) -> Arc<Node> {
        let node = resource_node(name);
        let value = handler.create(args).await.unwrap();
        let instance = ResourceInstance::new(
            "store",
            Arc::new(handler.schema().capabilities.clone()),
            value,
        );
        manager.register(node.clone(), handler.clone(), instance);
        node
    }

    #[tokio::test]
    async fn test_eager_destroy_runs_once() {
        let journal = Arc::new(Journal::default());
        let registry = registry_with(journal.clone());
        let handler = registry.resource("store").unwrap().clone();
        let manager = ResourceManager::new(None);

        let node = create(&manager, &handler, "main", json!({ "label": "main" })).await;
        assert!(manager.is_live(node.address()));
        assert!(manager.instance(node.address()).is_some());

        assert!(manager.destroy(&node).await);
        assert!(!manager.destroy(&node).await);
        manager.shutdown().await;

        assert!(!manager.is_live(node.address()));
        assert_eq!(journal.count("destroy:main"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_lifo() {
        let journal = Arc::new(Journal::default());
        let registry = registry_with(journal.clone());
        let handler = registry.resource("store").unwrap().clone();
        let manager = ResourceManager::new(None);

        for name in ["first", "second", "third"] {
            create(&manager, &handler, name, json!({ "label": name })).await;
        }
        assert_eq!(manager.live_count(), 3);

        manager.shutdown().await;
        assert_eq!(manager.live_count(), 0);

        let destroys: Vec<String> = journal
            .events()
            .into_iter()
            .filter(|e| e.starts_with("destroy:"))
            .collect();
        assert_eq!(destroys, vec!["destroy:third", "destroy:second", "destroy:first"]);
    }

    #[tokio::test]
    async fn test_shutdown_continues_past_destroy_errors() {
        let journal = Arc::new(Journal::default());
        let registry = registry_with(journal.clone());
        let handler = registry.resource("store").unwrap().clone();
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let manager = ResourceManager::new(Some(tx));

        create(&manager, &handler, "ok", json!({ "label": "ok" })).await;
        create(
            &manager,
            &handler,
            "bad",
            json!({ "label": "bad", "fail_destroy": true }),
        )
        .await;

        manager.shutdown().await;
        assert_eq!(manager.live_count(), 0);
        assert_eq!(journal.count("destroy:ok"), 1);
        assert_eq!(journal.count("destroy:bad"), 1);

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ExecutionEvent::Log { .. }) {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_shutdown_continues_past_destroy_panic() {
        let journal = Arc::new(Journal::default());
        let registry = registry_with(journal.clone());
        let handler = registry.resource("store").unwrap().clone();
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let manager = ResourceManager::new(Some(tx));

        create(&manager, &handler, "first", json!({ "label": "first" })).await;
        let bomb = create(
            &manager,
            &handler,
            "second",
            json!({ "label": "second", "panic_destroy": true }),
        )
        .await;

        manager.shutdown().await;
        assert_eq!(manager.live_count(), 0);
        assert!(bomb.is_destroyed());
        assert_eq!(journal.count("destroy:second"), 1);
        assert_eq!(journal.count("destroy:first"), 1);

        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::Log { message, .. } = event {
                messages.push(message);
            }
        }
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("panicked"));
        assert!(messages[0].contains("resource.store.second"));
    }

    #[tokio::test]
    async fn test_destroy_of_uncreated_resource_is_noop() {
        let manager = ResourceManager::new(None);
        let node = resource_node("ghost");
        assert!(!manager.destroy(&node).await);
    }
}
