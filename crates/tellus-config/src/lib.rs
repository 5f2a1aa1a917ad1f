//! Configuration system for the Tellus surface renderer.
//!
//! Provides runtime-configurable settings that persist to disk as RON files,
//! with forward/backward compatible serialization: missing sections or fields
//! fall back to their defaults.

mod config;
mod error;

pub use config::{Config, SurfaceConfig, TuningConfig};
pub use error::ConfigError;
