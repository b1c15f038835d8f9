//! Error types for the execution engine
//!
//! Failures inside a user program never surface here: the runner absorbs them
//! into console text plus a terminal run outcome. These types cover the
//! surrounding machinery instead, such as loading configuration, spawning an
//! execution unit, or asking for a language that is not registered.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ScriptboxError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
}

impl From<serde_yaml::Error> for ScriptboxError {
    fn from(err: serde_yaml::Error) -> Self {
        ScriptboxError::ConfigError(format!("Failed to parse YAML config: {}", err))
    }
}

// Specific error for execution contexts
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("execution context was already started")]
    AlreadyStarted,
    #[error("failed to spawn execution unit: {0}")]
    Spawn(#[from] std::io::Error),
}
