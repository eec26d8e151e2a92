//! Shared engine context
//!
//! An [`Engine`] bundles everything a process or stage driver needs: the
//! store and queue adapters, the stage registry, the key namespace and the
//! configuration. It is cheap to clone and is passed by reference everywhere.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::coordination::WorkerTracker;
use crate::error::Result;
use crate::process::{KeyNamespace, Process, ProcessId, ProcessSpecification};
use crate::stages::StageRegistry;
use crate::storage::{
    KeyValueStore, MemoryQueue, QueueOrder, StorageFactory, StorageHandles, WorkQueue,
};

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn KeyValueStore>,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<StageRegistry>,
    keys: KeyNamespace,
    config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(handles: StorageHandles, registry: StageRegistry, config: EngineConfig) -> Self {
        Self {
            store: handles.store,
            queue: handles.queue,
            registry: Arc::new(registry),
            keys: KeyNamespace::new(config.namespace.clone()),
            config: Arc::new(config),
        }
    }

    /// Engine over fresh in-memory adapters with default configuration
    pub fn in_memory(registry: StageRegistry) -> Self {
        Self::new(
            StorageHandles::in_memory(),
            registry,
            EngineConfig::default(),
        )
    }

    /// Engine over the backend the configuration selects
    pub async fn from_config(config: EngineConfig, registry: StageRegistry) -> Result<Self> {
        config.validate()?;
        let handles = StorageFactory::from_config(&config.storage, &config.namespace).await?;
        Ok(Self::new(handles, registry, config))
    }

    /// Same store, but a private last-in-first-out queue drained by the caller
    ///
    /// Units dispatched through the derived engine never reach the shared
    /// queue, and draining it runs them depth-first.
    pub(crate) fn inline(&self) -> Self {
        Self {
            queue: Arc::new(MemoryQueue::with_order(QueueOrder::Lifo)),
            ..self.clone()
        }
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    pub fn store_handle(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn keys(&self) -> &KeyNamespace {
        &self.keys
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> WorkerTracker {
        WorkerTracker::new(self)
    }

    /// Shorthand for [`Process::create`]
    pub async fn create_process(&self, specification: ProcessSpecification) -> Result<Process> {
        Process::create(self, specification).await
    }

    /// Shorthand for [`Process::open`]
    pub async fn open_process(&self, pid: &ProcessId) -> Result<Process> {
        Process::open(self, pid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Job;

    #[tokio::test]
    async fn test_inline_shares_store_not_queue() {
        let engine = Engine::in_memory(StageRegistry::new());
        let inline = engine.inline();

        inline.store().set("k", "v").await.unwrap();
        assert_eq!(engine.store().get("k").await.unwrap().as_deref(), Some("v"));

        inline.queue().enqueue(Job::new("a", vec![])).await.unwrap();
        inline.queue().enqueue(Job::new("b", vec![])).await.unwrap();
        assert_eq!(engine.queue().size().await.unwrap(), 0);
        let next = inline.queue().reserve().await.unwrap().unwrap();
        assert_eq!(next.worker, "b");
    }

    #[tokio::test]
    async fn test_namespace_from_config() {
        let mut config = EngineConfig::default();
        config.namespace = "jobs".to_string();
        let engine = Engine::from_config(config, StageRegistry::new()).await.unwrap();
        assert_eq!(engine.keys().prefix(), "jobs");
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_redis_requires_feature() {
        let mut config = EngineConfig::default();
        config.storage.backend = crate::storage::BackendType::Redis;
        assert!(Engine::from_config(config, StageRegistry::new()).await.is_err());
    }
}
