//! YAML configuration loading.
//!
//! Loads a [`RunConfig`] from a YAML file on disk. Every section and field is
//! optional; missing values take their defaults.

use crate::{AdvRegError, Result, RunConfig};
use std::path::Path;

/// Load a [`RunConfig`] from a YAML file at `path` and validate it.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or the
/// resulting configuration fails validation.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let config = parse_config(path)?;
    config.validate()?;
    Ok(config)
}

/// Read and parse a [`RunConfig`] without validating it.
///
/// For callers that adjust fields afterwards and validate the final result.
pub fn parse_config(path: &Path) -> Result<RunConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        AdvRegError::Config(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    let config: RunConfig = serde_yaml::from_str(&contents)
        .map_err(|e| AdvRegError::Config(format!("Failed to parse config YAML: {e}")))?;
    Ok(config)
}
