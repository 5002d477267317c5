//! SDK error types.

use tessera_plugin_protocol::ProtocolError;
use thiserror::Error;

/// Errors that end [`serve`](crate::serve).
#[derive(Debug, Error)]
pub enum SdkError {
    /// The cookie variable is missing or holds the wrong value: the binary
    /// was not started by a Tessera host.
    #[error(
        "this binary is a Tessera plugin and is not meant to be executed directly \
         (cookie {key} missing or wrong)"
    )]
    CookieMismatch {
        /// Cookie variable name.
        key: String,
    },

    /// Reading stdin or writing stdout failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;

/// Error returned by a plugin method, sent back to the host as
/// `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct CallError {
    /// Numeric code, see [`error_codes`](tessera_plugin_protocol::error_codes).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl CallError {
    /// An error with an explicit code.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Internal plugin failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(tessera_plugin_protocol::error_codes::INTERNAL_ERROR, message)
    }

    /// A static resource does not exist.
    #[must_use]
    pub fn not_found(path: &str) -> Self {
        Self::new(
            tessera_plugin_protocol::error_codes::RESOURCE_NOT_FOUND,
            format!("resource not found: {path}"),
        )
    }
}
