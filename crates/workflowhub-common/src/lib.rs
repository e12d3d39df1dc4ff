//! # WorkflowHub Common
//!
//! Logging configuration and config-file loading shared by the offline cache
//! worker and the update coordinator.
//!
//! ## Features
//!
//! - `tracing` subscriber setup with pretty, compact, and JSON output
//! - JSON config loading with serde defaults

pub mod config;
pub mod logging;

pub use config::{load_json_config, parse_json_config, ConfigError};
pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
