//! Configuration loader for YAML files and environment overrides

use crate::config::types::*;
use crate::errors::EngineError;
use std::env;
use std::path::Path;
use tokio::fs;

pub const ENV_BACKEND: &str = "KOALA_BACKEND";
pub const ENV_MAX_SESSIONS: &str = "KOALA_MAX_SESSIONS";
pub const ENV_TIMEOUT_SECONDS: &str = "KOALA_TIMEOUT_SECONDS";
pub const ENV_MEMORY_MB: &str = "KOALA_MEMORY_MB";
pub const ENV_SANDBOX_IMAGE: &str = "KOALA_SANDBOX_IMAGE";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<KoalaConfig, EngineError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load from `path` when it exists, otherwise start from the defaults.
    pub async fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<KoalaConfig, EngineError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::info!(
                "No configuration file at {}, using built-in defaults",
                path.display()
            );
            let mut config = KoalaConfig::default();
            Self::apply_env_overrides(&mut config)?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<KoalaConfig, EngineError> {
        // serde_yaml turns an empty document into unit; treat it as "all defaults"
        let mut config: KoalaConfig = if content.trim().is_empty() {
            KoalaConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| EngineError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Apply `KOALA_*` environment variables on top of the parsed file
    pub fn apply_env_overrides(config: &mut KoalaConfig) -> Result<(), EngineError> {
        if let Ok(value) = env::var(ENV_BACKEND) {
            config.engine.backend = value.parse()?;
        }
        if let Some(value) = Self::numeric_env::<usize>(ENV_MAX_SESSIONS)? {
            config.engine.max_concurrent_sessions = value;
        }
        if let Some(value) = Self::numeric_env::<u64>(ENV_TIMEOUT_SECONDS)? {
            config.limits.timeout_seconds = value;
        }
        if let Some(value) = Self::numeric_env::<u64>(ENV_MEMORY_MB)? {
            config.limits.memory_mb = value;
        }
        if let Ok(value) = env::var(ENV_SANDBOX_IMAGE) {
            config.container.image = value;
        }
        Ok(())
    }

    fn numeric_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, EngineError> {
        match env::var(key) {
            Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                EngineError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))
            }),
            Err(_) => Ok(None),
        }
    }
}
