//! Configuration module for the execution engine
//!
//! Supports YAML configuration files with per-backend sections, console
//! presentation settings and logging options.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;
