//! Error types for DocHarvest.
//!
//! Library crates use [`HarvestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! The variants double as the crawl error taxonomy: [`HarvestError::Cancelled`]
//! is the cooperative cancellation signal, [`HarvestError::Content`] means a
//! crawl produced nothing to store, and everything else is unexpected from the
//! orchestrator's point of view. Per-chunk and per-page failures never surface
//! as errors; they are logged and counted where they happen.

use std::path::PathBuf;

/// Top-level error type for all DocHarvest operations.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during fetch or embedding calls.
    #[error("network error: {0}")]
    Network(String),

    /// HTML, XML or text parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or repository error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding service error (whole request failed).
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad URL, bad request option, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// The crawl fetched no usable content.
    #[error("content error: {message}")]
    Content { message: String },

    /// Cooperative cancellation was observed at a checkpoint.
    #[error("crawl cancelled: {reason}")]
    Cancelled { reason: String },

    /// A progress stage name with no known band.
    #[error("unknown progress stage: {0}")]
    UnknownStage(String),

    /// A background job task panicked or was aborted.
    #[error("job task error: {0}")]
    Task(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a content error (nothing was fetched or nothing usable).
    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content {
            message: msg.into(),
        }
    }

    /// Create a cancellation signal.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is the cooperative cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
