//! Errors from building the logging subscriber.

use std::path::PathBuf;

use thiserror::Error;

/// What [`setup_logging`](crate::setup_logging) can fail on.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level or an extra directive is not valid `EnvFilter` syntax.
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter {
        /// The rejected level or directive.
        filter: String,
        /// Parser message.
        message: String,
    },

    /// A log format name that is not one of the supported formats.
    #[error("unknown log format '{0}' (expected pretty, compact, json or full)")]
    UnknownFormat(String),

    /// The directory for rolling log files could not be created.
    #[error("failed to create log directory {path}: {source}")]
    LogDirectory {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber is already installed.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
