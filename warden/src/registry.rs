//! The `entityType -> handler` lookup (spec.md §6 "Handler registry"), the
//! concrete counterpart to `warden_tasks::HandlerRegistry`. Backed by a
//! `DashMap` so handlers can be registered and deregistered while the
//! dispatcher is running, grounded on `host/src/server/auth.rs`'s
//! `DashMap`-backed key registry.

use std::sync::Arc;

use dashmap::DashMap;
use warden_tasks::{HandlerRegistry, TaskHandler};

/// A concurrent `entityType -> handler` map, cloneable cheaply (the
/// `DashMap` itself is wrapped in an `Arc`) so the same registry can be
/// shared between [`crate::TaskScheduler`] and the `Dispatcher` it drives.
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: Arc<DashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        HandlerMap::default()
    }

    /// Registers `handler` for `entity_type`, replacing any previous
    /// registration.
    pub fn register(&self, entity_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(entity_type.into(), handler);
    }

    pub fn deregister(&self, entity_type: &str) {
        self.handlers.remove(entity_type);
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.handlers.contains_key(entity_type)
    }
}

impl HandlerRegistry for HandlerMap {
    fn get(&self, entity_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(entity_type).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use warden_tasks::{TaskContext, TaskUpdate};

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _ctx: &TaskContext) -> Result<Option<TaskUpdate>, String> {
            Ok(None)
        }
    }

    #[test]
    fn register_then_lookup() {
        let registry = HandlerMap::new();
        assert!(registry.get("echo").is_none());
        registry.register("echo", Arc::new(NoopHandler));
        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_some());

        registry.deregister("echo");
        assert!(!registry.contains("echo"));
    }
}
