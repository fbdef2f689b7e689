//! Configuration Module
//!
//! Handles configuration loading, validation, and CLI overrides. The result
//! is built once at startup and shared read-only afterwards.

pub mod manager;
pub mod types;

pub use manager::{CliOverrides, ConfigManager};
pub use types::*;
