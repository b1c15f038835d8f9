//! Configuration loader for YAML files and environment resolution

use crate::config::types::ScriptboxConfig;
use crate::errors::ScriptboxError;
use std::env;
use std::path::Path;
use tokio::fs;

/// Environment variable that overrides `logging.level`.
pub const LOG_LEVEL_ENV: &str = "SCRIPTBOX_LOG_LEVEL";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<ScriptboxConfig, ScriptboxError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            ScriptboxError::IoError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a file if it exists, otherwise fall back to defaults
    pub async fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<ScriptboxConfig, ScriptboxError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::debug!("No config file at {}, using defaults", path.display());
            let mut config = ScriptboxConfig::default();
            Self::resolve_environment(&mut config);
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<ScriptboxConfig, ScriptboxError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let mut config: ScriptboxConfig = if content.trim().is_empty() {
            ScriptboxConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        Self::resolve_environment(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn resolve_environment(config: &mut ScriptboxConfig) {
        if let Ok(level) = env::var(LOG_LEVEL_ENV) {
            if !level.trim().is_empty() {
                log::debug!("Overriding logging level from {}", LOG_LEVEL_ENV);
                config.logging.level = level.trim().to_string();
            }
        }
    }
}
