//! Configuration type definitions
//!
//! Every field carries a default so that a missing or partial YAML file still
//! produces a usable configuration. Start with nothing and override only what
//! differs.

use crate::errors::ScriptboxError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest input buffer accepted for the blocking-read backend.
pub const MAX_INPUT_BUFFER_BYTES: usize = 1024 * 1024;
/// Room for one character of any UTF-8 width.
pub const MIN_INPUT_BUFFER_BYTES: usize = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptboxConfig {
    #[serde(default)]
    pub runners: RunnersConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnersConfig {
    #[serde(default)]
    pub javascript: JavaScriptRunnerConfig,
    #[serde(default)]
    pub lua: LuaRunnerConfig,
    #[serde(default)]
    pub python: PythonRunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaScriptRunnerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub echo_input: bool,
}

impl Default for JavaScriptRunnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            echo_input: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LuaRunnerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub echo_input: bool,
    /// Number of VM instructions between two polls of the cancellation flag.
    #[serde(default = "default_hook_instruction_interval")]
    pub hook_instruction_interval: u32,
}

impl Default for LuaRunnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            echo_input: false,
            hook_instruction_interval: default_hook_instruction_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonRunnerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub echo_input: bool,
    /// Capacity of the shared stdin buffer. Longer answers are truncated.
    #[serde(default = "default_input_buffer_bytes")]
    pub input_buffer_bytes: usize,
}

impl Default for PythonRunnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            echo_input: false,
            input_buffer_bytes: default_input_buffer_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Written to the console when a run is cancelled. Empty disables it.
    #[serde(default = "default_interruption_marker")]
    pub interruption_marker: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            interruption_marker: default_interruption_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_hook_instruction_interval() -> u32 {
    10_000
}

fn default_input_buffer_bytes() -> usize {
    10 * 1024
}

fn default_interruption_marker() -> String {
    "\n[execution interrupted]\n".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ScriptboxConfig {
    pub fn validate(&self) -> Result<(), ScriptboxError> {
        if self.runners.lua.hook_instruction_interval == 0 {
            return Err(ScriptboxError::ConfigError(
                "runners.lua.hook_instruction_interval must be greater than zero".to_string(),
            ));
        }

        let buffer = self.runners.python.input_buffer_bytes;
        if !(MIN_INPUT_BUFFER_BYTES..=MAX_INPUT_BUFFER_BYTES).contains(&buffer) {
            return Err(ScriptboxError::ConfigError(format!(
                "runners.python.input_buffer_bytes must be between {} and {}, got {}",
                MIN_INPUT_BUFFER_BYTES, MAX_INPUT_BUFFER_BYTES, buffer
            )));
        }

        match self.logging.level.to_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ScriptboxError::ConfigError(format!(
                "Unknown logging level '{}'",
                other
            ))),
        }
    }
}
