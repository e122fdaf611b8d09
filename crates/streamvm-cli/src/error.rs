//! Error types for the StreamVM CLI.

use streamvm::VmError;
use thiserror::Error;

/// CLI result type alias.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error type.
#[derive(Error, Debug)]
pub enum CliError {
    /// IO error while reading a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown output format.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Report serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The virtual machine rejected or failed the work.
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl From<toml::de::Error> for CliError {
    fn from(e: toml::de::Error) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Serialization(e.to_string())
    }
}
