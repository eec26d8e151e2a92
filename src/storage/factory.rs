//! Storage factory for creating store and queue instances

use std::sync::Arc;

use super::backends::{MemoryQueue, MemoryStore};
#[cfg(feature = "redis")]
use super::backends::RedisBackend;
use super::config::{BackendType, StorageConfig};
use super::error::StorageResult;
use super::traits::{KeyValueStore, WorkQueue};

/// The pair of adapters an engine runs against
#[derive(Clone)]
pub struct StorageHandles {
    pub store: Arc<dyn KeyValueStore>,
    pub queue: Arc<dyn WorkQueue>,
}

impl StorageHandles {
    /// Fresh in-memory store and FIFO queue
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(MemoryQueue::new()),
        }
    }
}

/// Factory for creating storage instances
pub struct StorageFactory;

impl StorageFactory {
    /// Create the store and queue from explicit configuration
    ///
    /// `namespace` prefixes the queue key for backends that share a keyspace.
    pub async fn from_config(
        config: &StorageConfig,
        namespace: &str,
    ) -> StorageResult<StorageHandles> {
        match config.backend {
            BackendType::Memory => Ok(StorageHandles::in_memory()),
            #[cfg(feature = "redis")]
            BackendType::Redis => {
                let queue_key = format!("{}:queue:{}", namespace, config.queue);
                let backend = Arc::new(RedisBackend::new(&config.redis, queue_key).await?);
                Ok(StorageHandles {
                    store: backend.clone(),
                    queue: backend,
                })
            }
            #[cfg(not(feature = "redis"))]
            BackendType::Redis => {
                let _ = namespace;
                Err(super::error::StorageError::configuration(
                    "Redis backend not enabled. Enable with --features redis",
                ))
            }
        }
    }
}
