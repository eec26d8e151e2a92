//! Engine configuration
//!
//! Loaded from a TOML file, then overridden from `MAPSTAGE_*` environment
//! variables:
//!
//! ```toml
//! namespace = "mapstage"
//! reduce_policy = "replace"
//!
//! [storage]
//! backend = "redis"
//! queue = "mapstage"
//!
//! [storage.redis]
//! url = "redis://127.0.0.1:6379"
//! pool_size = 10
//! timeout = "10s"
//!
//! [worker]
//! concurrency = 4
//! poll_interval = "500ms"
//! max_retries = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::StorageConfig;

/// How the reducer driver writes a reduced value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReducePolicy {
    /// The new value replaces the reduced list; redelivered reducers stay idempotent
    #[default]
    Replace,
    /// The new value is appended; redelivered reducers leave duplicates
    Append,
}

/// Worker loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent polling tasks
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sleep between polls of an empty queue
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Redeliveries of a unit that failed recoverably
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retries() -> u32 {
    3
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            max_retries: default_max_retries(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefix of every storage key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub reduce_policy: ReducePolicy,
}

fn default_namespace() -> String {
    "mapstage".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            storage: StorageConfig::default(),
            worker: WorkerConfig::default(),
            reduce_policy: ReducePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.merge_env()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.merge_env()?;
        Ok(config)
    }

    /// Apply `MAPSTAGE_*` overrides
    pub fn merge_env(&mut self) -> Result<()> {
        if let Ok(namespace) = std::env::var("MAPSTAGE_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(concurrency) = std::env::var("MAPSTAGE_CONCURRENCY") {
            self.worker.concurrency = concurrency.parse().map_err(|_| {
                Error::Config(format!("MAPSTAGE_CONCURRENCY is not a number: {}", concurrency))
            })?;
        }
        self.storage
            .merge_env()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace) {
            return Err(Error::Config(format!(
                "namespace must be non-empty without whitespace: {:?}",
                self.namespace
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(Error::Config("worker concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendType;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.namespace, "mapstage");
        assert_eq!(config.storage.backend, BackendType::Memory);
        assert_eq!(config.worker.concurrency, 1);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(500));
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.reduce_policy, ReducePolicy::Replace);
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml(
            r#"
            namespace = "jobs"
            reduce_policy = "append"

            [storage]
            backend = "redis"

            [storage.redis]
            url = "redis://cache:6379/2"

            [worker]
            concurrency = 8
            poll_interval = "2s"
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace, "jobs");
        assert_eq!(config.reduce_policy, ReducePolicy::Append);
        assert_eq!(config.storage.backend, BackendType::Redis);
        assert_eq!(config.storage.redis.url, "redis://cache:6379/2");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.poll_interval, Duration::from_secs(2));
        assert_eq!(config.worker.max_retries, 3);
    }

    #[test]
    fn test_invalid_config() {
        assert!(EngineConfig::from_toml("namespace = \"a b\"").is_err());
        assert!(EngineConfig::from_toml("[worker]\nconcurrency = 0").is_err());
        assert!(EngineConfig::from_toml("reduce_policy = \"sometimes\"").is_err());
    }

    #[test]
    #[serial]
    fn test_load_with_env_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "namespace = \"from_file\"\n[worker]\nconcurrency = 2").unwrap();

        std::env::set_var("MAPSTAGE_CONCURRENCY", "6");
        let config = EngineConfig::load(file.path());
        std::env::remove_var("MAPSTAGE_CONCURRENCY");

        let config = config.unwrap();
        assert_eq!(config.namespace, "from_file");
        assert_eq!(config.worker.concurrency, 6);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("MAPSTAGE_NAMESPACE", "envspace");
        std::env::set_var("MAPSTAGE_BACKEND", "redis");
        let config = EngineConfig::from_env();
        std::env::remove_var("MAPSTAGE_NAMESPACE");
        std::env::remove_var("MAPSTAGE_BACKEND");

        let config = config.unwrap();
        assert_eq!(config.namespace, "envspace");
        assert_eq!(config.storage.backend, BackendType::Redis);
    }

    #[test]
    #[serial]
    fn test_bad_env_value() {
        std::env::set_var("MAPSTAGE_CONCURRENCY", "many");
        let config = EngineConfig::from_env();
        std::env::remove_var("MAPSTAGE_CONCURRENCY");
        assert!(matches!(config, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/mapstage.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("cannot read")));
    }
}
