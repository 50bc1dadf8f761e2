//! CLI error types

use dlsim_core::SimError;
use thiserror::Error;

/// Errors raised by the command-line driver
#[derive(Debug, Error)]
pub enum CliError {
    /// Scenario file or environment could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A line command could not be parsed
    #[error("{0}")]
    Parse(String),

    /// The simulation rejected a command
    #[error(transparent)]
    Sim(#[from] SimError),

    /// Reading stdin failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event could not be encoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn parse(message: impl Into<String>) -> Self {
        CliError::Parse(message.into())
    }
}

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;
