//! Storage configuration types and utilities

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{StorageError, StorageResult};

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process memory (default; tests and single-process runs)
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

impl std::str::FromStr for BackendType {
    type Err = StorageError;

    fn from_str(s: &str) -> StorageResult<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(StorageError::configuration(format!(
                "Unknown storage backend: {}",
                other
            ))),
        }
    }
}

/// Main storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend type
    #[serde(default)]
    pub backend: BackendType,

    /// Name of the work queue
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Redis connection settings, used when `backend = "redis"`
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection url, including the database number if not 0
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Timeout for acquiring, creating and recycling pooled connections
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            timeout: default_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            queue: default_queue(),
            redis: RedisConfig::default(),
        }
    }
}

// Default value functions for serde
fn default_queue() -> String {
    "mapstage".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl StorageConfig {
    /// Apply `MAPSTAGE_BACKEND`, `MAPSTAGE_QUEUE` and `MAPSTAGE_REDIS_URL` overrides
    pub fn merge_env(&mut self) -> StorageResult<()> {
        if let Ok(backend) = std::env::var("MAPSTAGE_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Ok(queue) = std::env::var("MAPSTAGE_QUEUE") {
            self.queue = queue;
        }
        if let Ok(url) = std::env::var("MAPSTAGE_REDIS_URL") {
            self.redis.url = url;
        }
        Ok(())
    }
}
