//! Fault injection for unit tests
//!
//! [`FaultyStore`] wraps a [`MemoryStore`] and fails chosen operations with a
//! retryable connection error, or rewrites a key right after it is read to
//! stand in for a concurrent writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    HealthStatus, KeyValueStore, MemoryQueue, MemoryStore, PopOutcome, StorageError,
    StorageHandles, StorageResult,
};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::stages::StageRegistry;

#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    failures: Mutex<HashMap<&'static str, (usize, usize)>>,
    overwrite: Mutex<Option<(String, String)>>,
}

impl FaultyStore {
    /// Fail the next `times` calls of `op`
    pub fn fail(&self, op: &'static str, times: usize) {
        self.fail_later(op, 0, times);
    }

    /// Let `skip` calls of `op` through, then fail the `times` after them
    pub fn fail_later(&self, op: &'static str, skip: usize, times: usize) {
        self.failures.lock().unwrap().insert(op, (skip, times));
    }

    /// The next time `key` is read, replace it with `value` after the read
    pub fn overwrite_after_get(&self, key: &str, value: &str) {
        *self.overwrite.lock().unwrap() = Some((key.to_string(), value.to_string()));
    }

    fn trip(&self, op: &'static str) -> StorageResult<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some((skip, _)) if *skip > 0 => {
                *skip -= 1;
                Ok(())
            }
            Some((_, left)) if *left > 0 => {
                *left -= 1;
                Err(StorageError::connection(format!("injected {} failure", op)))
            }
            _ => Ok(()),
        }
    }
}

/// Engine over a [`FaultyStore`] and a plain FIFO queue
pub(crate) fn faulty_engine() -> (Engine, Arc<FaultyStore>) {
    let store = Arc::new(FaultyStore::default());
    let handles = StorageHandles {
        store: store.clone(),
        queue: Arc::new(MemoryQueue::new()),
    };
    let engine = Engine::new(handles, StageRegistry::with_builtins(), EngineConfig::default());
    (engine, store)
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.trip("get")?;
        let value = self.inner.get(key).await?;
        let pending = {
            let mut overwrite = self.overwrite.lock().unwrap();
            match overwrite.as_ref() {
                Some((target, _)) if target == key => overwrite.take(),
                _ => None,
            }
        };
        if let Some((target, replacement)) = pending {
            self.inner.set(&target, &replacement).await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.trip("set")?;
        self.inner.set(key, value).await
    }

    async fn set_nx(&self, key: &str, value: &str) -> StorageResult<bool> {
        self.trip("set_nx")?;
        self.inner.set_nx(key, value).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> StorageResult<bool> {
        self.trip("compare_and_set")?;
        self.inner.compare_and_set(key, expected, value).await
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<usize> {
        self.trip("delete")?;
        self.inner.delete(keys).await
    }

    async fn list_push(&self, key: &str, value: &str) -> StorageResult<usize> {
        self.trip("list_push")?;
        self.inner.list_push(key, value).await
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StorageResult<Vec<String>> {
        self.trip("list_range")?;
        self.inner.list_range(key, start, stop).await
    }

    async fn list_len(&self, key: &str) -> StorageResult<usize> {
        self.trip("list_len")?;
        self.inner.list_len(key).await
    }

    async fn list_replace(&self, key: &str, value: &str) -> StorageResult<()> {
        self.trip("list_replace")?;
        self.inner.list_replace(key, value).await
    }

    async fn list_remove_check(
        &self,
        key: &str,
        value: &str,
        on_empty: Option<(&str, &str)>,
    ) -> StorageResult<PopOutcome> {
        self.trip("list_remove_check")?;
        self.inner.list_remove_check(key, value, on_empty).await
    }

    async fn set_add(&self, key: &str, member: &str) -> StorageResult<bool> {
        self.trip("set_add")?;
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StorageResult<bool> {
        self.trip("set_remove")?;
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        self.trip("set_members")?;
        self.inner.set_members(key).await
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> StorageResult<()> {
        self.trip("sorted_add")?;
        self.inner.sorted_add(key, score, member).await
    }

    async fn sorted_range(&self, key: &str) -> StorageResult<Vec<(String, f64)>> {
        self.trip("sorted_range")?;
        self.inner.sorted_range(key).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StorageResult<()> {
        self.trip("hash_set")?;
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        self.trip("hash_get")?;
        self.inner.hash_get(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> StorageResult<Vec<(String, String)>> {
        self.trip("hash_get_all")?;
        self.inner.hash_get_all(key).await
    }

    async fn flush_all(&self) -> StorageResult<()> {
        self.inner.flush_all().await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }
}
