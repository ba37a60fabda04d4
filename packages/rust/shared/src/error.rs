//! Error types for WikiAccess.
//!
//! Library crates use [`WikiAccessError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all WikiAccess operations.
#[derive(Debug, thiserror::Error)]
pub enum WikiAccessError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while probing the wiki.
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed identifier or otherwise invalid input.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The external document renderer failed for one page.
    #[error("render error: {0}")]
    Render(String),

    /// The external accessibility checker failed for one artifact.
    #[error("accessibility check error: {0}")]
    Accessibility(String),

    /// An operation required a row that does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WikiAccessError>;

impl WikiAccessError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map any displayable storage failure into [`WikiAccessError::Storage`].
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
