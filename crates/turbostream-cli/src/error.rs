//! Error types for CLI operations

use std::fmt;

use thiserror::Error;
use turbostream_transport::TransportError;

/// Result alias used throughout the CLI.
pub type CliResult<T> = Result<T, CliError>;

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Transport layer errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid command arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The stream settled in the error state after exhausting its retries
    #[error("Stream failed: {0}")]
    StreamFailed(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Logging could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

impl CliError {
    /// User-facing hints for resolving the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Transport(TransportError::Configuration(_)) | Self::Config(_) => vec![
                "Check the configuration file and TURBOSTREAM__* variables",
                "Run `turbostream-cli config` to print the effective configuration",
            ],
            Self::Transport(_) | Self::StreamFailed(_) => vec![
                "Check that the endpoint is reachable",
                "Verify the protocol matches what the server speaks (--protocol)",
            ],
            Self::InvalidArguments(_) => vec![
                "Pass --endpoint or set TURBOSTREAM_ENDPOINT",
                "Use --help to see expected formats",
            ],
            _ => vec![],
        }
    }

    /// Coarse category, used as the error prefix.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::StreamFailed(_) => ErrorCategory::Connection,
            Self::InvalidArguments(_) => ErrorCategory::User,
            Self::Json(_) => ErrorCategory::Parsing,
            Self::Io(_) | Self::Logging(_) => ErrorCategory::System,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::User | ErrorCategory::Config => 2,
            _ => 1,
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    User,
    Parsing,
    System,
    Config,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "Connection"),
            Self::User => write!(f, "User Input"),
            Self::Parsing => write!(f, "Parsing"),
            Self::System => write!(f, "System"),
            Self::Config => write!(f, "Configuration"),
        }
    }
}
