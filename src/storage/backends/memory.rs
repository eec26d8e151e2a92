//! In-memory store and queue backends
//!
//! Used by tests, by synchronous runs, and by single-process deployments.
//! Every operation takes the backend's single lock, which makes each trait
//! method atomic with respect to every other.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::storage::{
    error::StorageResult,
    traits::{KeyValueStore, WorkQueue},
    types::{HealthStatus, Job, PopOutcome},
};

#[derive(Debug, Default)]
struct MemoryData {
    scalars: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    sorted: HashMap<String, Vec<(String, f64)>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl MemoryData {
    fn remove_key(&mut self, key: &str) -> bool {
        let mut existed = self.scalars.remove(key).is_some();
        existed |= self.lists.remove(key).is_some();
        existed |= self.sets.remove(key).is_some();
        existed |= self.sorted.remove(key).is_some();
        existed |= self.hashes.remove(key).is_some();
        existed
    }
}

/// In-memory key-value store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<MemoryData>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve an inclusive, possibly negative, index range against `len`
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.data.read().await.scalars.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.data
            .write()
            .await
            .scalars
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> StorageResult<bool> {
        let mut data = self.data.write().await;
        if data.scalars.contains_key(key) {
            return Ok(false);
        }
        data.scalars.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> StorageResult<bool> {
        let mut data = self.data.write().await;
        if data.scalars.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        data.scalars.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<usize> {
        let mut data = self.data.write().await;
        Ok(keys.iter().filter(|key| data.remove_key(key)).count())
    }

    async fn list_push(&self, key: &str, value: &str) -> StorageResult<usize> {
        let mut data = self.data.write().await;
        let list = data.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StorageResult<Vec<String>> {
        let data = self.data.read().await;
        let Some(list) = data.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn list_len(&self, key: &str) -> StorageResult<usize> {
        Ok(self
            .data
            .read()
            .await
            .lists
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0))
    }

    async fn list_replace(&self, key: &str, value: &str) -> StorageResult<()> {
        self.data
            .write()
            .await
            .lists
            .insert(key.to_string(), VecDeque::from([value.to_string()]));
        Ok(())
    }

    async fn list_remove_check(
        &self,
        key: &str,
        value: &str,
        on_empty: Option<(&str, &str)>,
    ) -> StorageResult<PopOutcome> {
        let mut data = self.data.write().await;
        let Some(list) = data.lists.get_mut(key) else {
            return Ok(PopOutcome::Empty);
        };
        let Some(position) = list.iter().position(|element| element == value) else {
            return Ok(PopOutcome::Empty);
        };
        list.remove(position);
        let remaining = list.len();
        if remaining == 0 {
            data.lists.remove(key);
            if let Some((next, next_value)) = on_empty {
                data.lists
                    .entry(next.to_string())
                    .or_default()
                    .push_back(next_value.to_string());
            }
        }
        Ok(PopOutcome::Popped { remaining })
    }

    async fn set_add(&self, key: &str, member: &str) -> StorageResult<bool> {
        Ok(self
            .data
            .write()
            .await
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StorageResult<bool> {
        let mut data = self.data.write().await;
        let Some(set) = data.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            data.sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .data
            .read()
            .await
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> StorageResult<()> {
        let mut data = self.data.write().await;
        let entries = data.sorted.entry(key.to_string()).or_default();
        match entries.iter_mut().find(|(existing, _)| existing == member) {
            Some(entry) => entry.1 = score,
            None => entries.push((member.to_string(), score)),
        }
        // Same ordering as a redis sorted set: score, then member bytes
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(())
    }

    async fn sorted_range(&self, key: &str) -> StorageResult<Vec<(String, f64)>> {
        Ok(self
            .data
            .read()
            .await
            .sorted
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StorageResult<()> {
        self.data
            .write()
            .await
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        Ok(self
            .data
            .read()
            .await
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .data
            .read()
            .await
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn flush_all(&self) -> StorageResult<()> {
        *self.data.write().await = MemoryData::default();
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            backend_type: "memory".to_string(),
            latency_ms: 0,
            errors: vec![],
        })
    }
}

/// Dequeue order of a [`MemoryQueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueOrder {
    /// First in, first out; the shared queue
    #[default]
    Fifo,
    /// Last in, first out; gives depth-first execution for synchronous runs
    Lifo,
}

/// In-memory work queue
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
    order: QueueOrder,
}

impl MemoryQueue {
    /// Create an empty FIFO queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty queue with the given dequeue order
    pub fn with_order(order: QueueOrder) -> Self {
        Self {
            jobs: Arc::default(),
            order,
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> StorageResult<()> {
        self.jobs.lock().await.push_back(job);
        Ok(())
    }

    async fn reserve(&self) -> StorageResult<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        Ok(match self.order {
            QueueOrder::Fifo => jobs.pop_front(),
            QueueOrder::Lifo => jobs.pop_back(),
        })
    }

    async fn peek(&self, offset: usize, count: Option<usize>) -> StorageResult<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let pending = jobs.iter().skip(offset).cloned();
        Ok(match count {
            Some(count) => pending.take(count).collect(),
            None => pending.collect(),
        })
    }

    async fn size(&self) -> StorageResult<usize> {
        Ok(self.jobs.lock().await.len())
    }

    async fn cancel(&self, pid: &str) -> StorageResult<usize> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job| !job.belongs_to(pid));
        Ok(before - jobs.len())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.jobs.lock().await.clear();
        Ok(())
    }
}
