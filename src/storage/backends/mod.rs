//! Storage backend implementations

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryQueue, MemoryStore, QueueOrder};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;
