//! Core trait definitions for the store and queue adapters

use async_trait::async_trait;

use super::error::StorageResult;
use super::types::{HealthStatus, Job, PopOutcome};

/// Persistent key-value store
///
/// Every method is a single atomic operation against the backend. Multi-step
/// coordination (stage completion in particular) must be expressed through
/// one of these primitives, never as a read followed by a write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a scalar value
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Set a scalar value
    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Set a scalar value only if the key is absent; returns whether it was set
    async fn set_nx(&self, key: &str, value: &str) -> StorageResult<bool>;

    /// Overwrite a scalar only if it still holds `expected`; returns whether it was written
    async fn compare_and_set(&self, key: &str, expected: &str, value: &str)
        -> StorageResult<bool>;

    /// Delete keys of any type; returns how many existed
    async fn delete(&self, keys: &[String]) -> StorageResult<usize>;

    /// Append to a list; returns the new length
    async fn list_push(&self, key: &str, value: &str) -> StorageResult<usize>;

    /// Read a list range, inclusive, with negative indices counting from the end
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> StorageResult<Vec<String>>;

    /// Length of a list
    async fn list_len(&self, key: &str) -> StorageResult<usize>;

    /// Replace the whole list with a single value
    async fn list_replace(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove one occurrence of `value` from a list and report how many
    /// elements remain, atomically
    ///
    /// When the removal empties the list and `on_empty` names another list and
    /// value, that value is appended to it in the same atomic step.
    async fn list_remove_check(
        &self,
        key: &str,
        value: &str,
        on_empty: Option<(&str, &str)>,
    ) -> StorageResult<PopOutcome>;

    /// Add a member to a set; returns whether it was newly added
    async fn set_add(&self, key: &str, member: &str) -> StorageResult<bool>;

    /// Remove a member from a set
    async fn set_remove(&self, key: &str, member: &str) -> StorageResult<bool>;

    /// All members of a set, in no particular order
    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>>;

    /// Add a member to a sorted set with the given score
    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> StorageResult<()>;

    /// All members of a sorted set with their scores, ascending by score
    async fn sorted_range(&self, key: &str) -> StorageResult<Vec<(String, f64)>>;

    /// Set a hash field
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StorageResult<()>;

    /// Get a hash field
    async fn hash_get(&self, key: &str, field: &str) -> StorageResult<Option<String>>;

    /// All fields of a hash
    async fn hash_get_all(&self, key: &str) -> StorageResult<Vec<(String, String)>>;

    /// Drop every key; test and bulk-reset use only
    async fn flush_all(&self) -> StorageResult<()>;

    /// Check the health of the backend
    async fn health_check(&self) -> StorageResult<HealthStatus>;
}

/// Distributed work queue with at-least-once delivery
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a worker invocation
    async fn enqueue(&self, job: Job) -> StorageResult<()>;

    /// Take the next job off the queue, if any
    async fn reserve(&self) -> StorageResult<Option<Job>>;

    /// Inspect pending jobs without removing them; `count` of `None` means all
    async fn peek(&self, offset: usize, count: Option<usize>) -> StorageResult<Vec<Job>>;

    /// Number of pending jobs
    async fn size(&self) -> StorageResult<usize>;

    /// Remove every pending job belonging to `pid`; returns how many were removed
    async fn cancel(&self, pid: &str) -> StorageResult<usize>;

    /// Drop every pending job
    async fn clear(&self) -> StorageResult<()>;
}
