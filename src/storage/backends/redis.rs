//! Redis store and queue backend
//!
//! Scalars, lists, sets, sorted sets and hashes map one-to-one onto the
//! native redis types. The queue is a redis list of JSON-encoded jobs.
//! Operations that must be atomic across more than one command run as Lua
//! scripts or MULTI pipelines.

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::storage::{
    config::RedisConfig,
    error::{StorageError, StorageResult},
    traits::{KeyValueStore, WorkQueue},
    types::{HealthStatus, Job, PopOutcome},
};

/// Removes one ARGV[1] from KEYS[1] and returns the remaining length, or -1
/// if none was present. Emptying KEYS[1] appends ARGV[2] to KEYS[2], if given.
static REMOVE_CHECK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
        if removed == 0 then
            return -1
        end
        local remaining = redis.call('LLEN', KEYS[1])
        if remaining == 0 and KEYS[2] then
            redis.call('RPUSH', KEYS[2], ARGV[2])
        end
        return remaining
        ",
    )
});

/// Sets KEYS[1] to ARGV[2] only while it still holds ARGV[1]
static COMPARE_AND_SET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('SET', KEYS[1], ARGV[2])
            return 1
        end
        return 0
        ",
    )
});

/// Removes every queued job whose first argument equals ARGV[1]
static CANCEL_JOBS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local removed = 0
        local jobs = redis.call('LRANGE', KEYS[1], 0, -1)
        for _, raw in ipairs(jobs) do
            local ok, job = pcall(cjson.decode, raw)
            if ok and type(job) == 'table' and job.args and job.args[1] == ARGV[1] then
                removed = removed + redis.call('LREM', KEYS[1], 0, raw)
            end
        end
        return removed
        ",
    )
});

/// Redis backend serving both the store and the queue adapters
#[derive(Clone)]
pub struct RedisBackend {
    pool: Arc<Pool>,
    queue_key: String,
}

impl RedisBackend {
    /// Create a new Redis backend; `queue_key` is the list holding pending jobs
    pub async fn new(config: &RedisConfig, queue_key: String) -> StorageResult<Self> {
        info!("Initializing Redis backend");

        let mut pool_config = Config::from_url(&config.url);
        let mut limits = PoolConfig::new(config.pool_size);
        limits.timeouts.wait = Some(config.timeout);
        limits.timeouts.create = Some(config.timeout);
        limits.timeouts.recycle = Some(config.timeout);
        pool_config.pool = Some(limits);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::connection(format!("Failed to create Redis pool: {}", e)))?;

        // Fail fast on a bad url instead of on the first job
        let mut conn = pool
            .get()
            .await
            .map_err(|e| StorageError::connection(format!("Failed to connect to Redis: {}", e)))?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            pool: Arc::new(pool),
            queue_key,
        })
    }

    async fn conn(&self) -> StorageResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::connection(e.to_string()))
    }
}

#[async_trait]
impl KeyValueStore for RedisBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.set_nx(key, value).await?)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        let written: i64 = COMPARE_AND_SET
            .key(key)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.del(keys).await?)
    }

    async fn list_push(&self, key: &str, value: &str) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.rpush(key, value).await?)
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StorageResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn list_len(&self, key: &str) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn list_replace(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .del(key)
            .ignore()
            .rpush(key, value)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_remove_check(
        &self,
        key: &str,
        value: &str,
        on_empty: Option<(&str, &str)>,
    ) -> StorageResult<PopOutcome> {
        let mut invocation = REMOVE_CHECK.prepare_invoke();
        invocation.key(key).arg(value);
        if let Some((next, next_value)) = on_empty {
            invocation.key(next).arg(next_value);
        }
        let mut conn = self.conn().await?;
        let remaining: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(match usize::try_from(remaining) {
            Ok(remaining) => PopOutcome::Popped { remaining },
            Err(_) => PopOutcome::Empty,
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.sadd(key, member).await?)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.srem(key, member).await?)
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_range(&self, key: &str) -> StorageResult<Vec<(String, f64)>> {
        let mut conn = self.conn().await?;
        Ok(conn.zrange_withscores(key, 0, -1).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> StorageResult<Vec<(String, String)>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields.into_iter().collect())
    }

    async fn flush_all(&self) -> StorageResult<()> {
        warn!("Flushing every key in the Redis database");
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        debug!("Performing Redis health check");

        let start = std::time::Instant::now();
        let mut errors = Vec::new();
        let healthy = match self.conn().await {
            Ok(mut conn) => {
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                match pong {
                    Ok(response) if response == "PONG" => true,
                    Ok(response) => {
                        errors.push(format!("Unexpected PING response: {}", response));
                        false
                    }
                    Err(e) => {
                        errors.push(e.to_string());
                        false
                    }
                }
            }
            Err(e) => {
                errors.push(e.to_string());
                false
            }
        };

        Ok(HealthStatus {
            healthy,
            backend_type: "redis".to_string(),
            latency_ms: start.elapsed().as_millis() as u64,
            errors,
        })
    }
}

#[async_trait]
impl WorkQueue for RedisBackend {
    async fn enqueue(&self, job: Job) -> StorageResult<()> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn().await?;
        let _: usize = conn.rpush(&self.queue_key, payload).await?;
        Ok(())
    }

    async fn reserve(&self) -> StorageResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.lpop(&self.queue_key, None).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn peek(&self, offset: usize, count: Option<usize>) -> StorageResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let start = offset as isize;
        let stop = match count {
            Some(0) => return Ok(Vec::new()),
            Some(count) => start + count as isize - 1,
            None => -1,
        };
        let raw: Vec<String> = conn.lrange(&self.queue_key, start, stop).await?;
        raw.iter()
            .map(|payload| serde_json::from_str(payload).map_err(StorageError::from))
            .collect()
    }

    async fn size(&self) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(&self.queue_key).await?)
    }

    async fn cancel(&self, pid: &str) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        let removed: usize = CANCEL_JOBS
            .key(&self.queue_key)
            .arg(pid)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: usize = conn.del(&self.queue_key).await?;
        Ok(())
    }
}
