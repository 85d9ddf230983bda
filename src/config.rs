//! Configuration loading.
//!
//! Loads from `./postrider.toml` (or `$POSTRIDER_CONFIG_PATH`).
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level courier configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Redis connection URL for the queue engine.
    pub redis_url: String,
    /// SQLite connection URL for the relational store.
    pub database_url: String,
    /// Number of sender workers.
    pub max_workers: usize,
    /// Maximum SQLite pool connections.
    pub db_max_connections: u32,
    /// Logical queue name for outbound sends.
    pub msg_queue: String,
    /// Logical queue name for inbound events.
    pub event_queue: String,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_owned(),
            database_url: "sqlite:postrider.db?mode=rwc".to_owned(),
            max_workers: 8,
            db_max_connections: 8,
            msg_queue: "msgs".to_owned(),
            event_queue: "events".to_owned(),
            log_level: "info".to_owned(),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                toml::from_str(&contents).context("failed to parse config TOML")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("POSTRIDER_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("postrider.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("POSTRIDER_REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = env("POSTRIDER_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env("POSTRIDER_MAX_WORKERS") {
            match v.parse() {
                Ok(n) => self.max_workers = n,
                Err(_) => tracing::warn!(
                    var = "POSTRIDER_MAX_WORKERS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("POSTRIDER_LOG_LEVEL") {
            self.log_level = v;
        }
    }
}
