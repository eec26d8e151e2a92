//! Storage abstraction layer
//!
//! The engine coordinates exclusively through two adapters: a key-value
//! store with atomic list/set/hash primitives and an at-least-once work
//! queue. Both are traits; backends live in [`backends`].

pub mod backends;
pub mod config;
pub mod error;
pub mod factory;
#[cfg(test)]
pub(crate) mod testing;
pub mod traits;
pub mod types;

pub use backends::{MemoryQueue, MemoryStore, QueueOrder};
pub use config::{BackendType, RedisConfig, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use factory::{StorageFactory, StorageHandles};
pub use traits::{KeyValueStore, WorkQueue};
pub use types::{HealthStatus, Job, PopOutcome};
