//! Configuration module for the execution engine
//!
//! Supports a YAML file plus `KOALA_*` environment overrides. Per-request limit
//! overrides are handled by [`crate::limits::ResourceLimits`], not here.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::EngineError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<KoalaConfig, EngineError> {
    ConfigLoader::from_file(path).await
}
