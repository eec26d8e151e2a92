//! Command-line level settings

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::EngineConfig;

/// Settings gathered from the command line
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
    /// Engine configuration file, if given
    pub config_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn new(verbose: u8) -> Self {
        Self {
            verbose,
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Get the log level string based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            2 => "trace",
            _ => "trace,redis=debug",
        }
    }

    /// Engine configuration from the config file, or defaults, plus environment overrides
    pub fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config_path {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display())),
            None => EngineConfig::from_env().context("Invalid environment configuration"),
        }
    }
}
