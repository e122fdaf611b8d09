//! CLI command implementations.

pub mod run;
pub mod streams;

use std::path::Path;

use streamvm::config::VmConfig;

use crate::error::{CliError, CliResult};

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON for programmatic consumption.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = CliError;

    fn from_str(s: &str) -> CliResult<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(CliError::InvalidFormat(format!(
                "Unknown format '{}'. Valid options: text, json",
                s
            ))),
        }
    }
}

/// Load a configuration file, or the defaults when no path is given.
pub fn load_config(path: Option<&str>) -> CliResult<VmConfig> {
    let Some(path) = path else {
        return Ok(VmConfig::default());
    };
    let content = std::fs::read_to_string(Path::new(path))?;
    let config: VmConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
