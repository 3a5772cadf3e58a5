//! Error types for the supervisor.

use thiserror::Error;

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Supervisor errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Failed to launch {app}: {reason}")]
    LaunchError { app: String, reason: String },

    #[error("Unknown app: {0}")]
    UnknownApp(String),

    #[error("App already running: {0}")]
    AlreadyRunning(String),

    #[error("App not running: {0}")]
    NotRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
