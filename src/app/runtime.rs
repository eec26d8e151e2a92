//! Engine startup for the binary

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::app::config::AppConfig;
use crate::engine::Engine;
use crate::stages::StageRegistry;

/// Build the engine described by the command-line settings
///
/// The stage registry is fixed here for the lifetime of the process.
pub async fn initialize_engine(config: &AppConfig, registry: StageRegistry) -> Result<Engine> {
    let engine_config = config.engine_config()?;
    let backend = engine_config.storage.backend;
    let engine = Engine::from_config(engine_config, registry)
        .await
        .context("Failed to connect to storage")?;

    let health = engine.store().health_check().await?;
    if health.healthy {
        info!(
            "Using {:?} storage under namespace {:?} ({} ms)",
            backend,
            engine.keys().prefix(),
            health.latency_ms
        );
    } else {
        warn!("Storage reports unhealthy: {:?}", health.errors);
    }
    Ok(engine)
}
