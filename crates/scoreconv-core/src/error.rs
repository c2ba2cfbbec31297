//! Error types for the scoreconv worker.

use thiserror::Error;

/// Result type alias using scoreconv's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for scoreconv operations.
///
/// The first five variants are the job-facing taxonomy: each one maps to a
/// well-defined outcome in the pipeline (dropped, reported as failed, or
/// tolerated). The rest are plumbing errors that get folded into one of
/// those categories at the component boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Job identifier unknown to the graph store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or incomplete job payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// Download or decompression of the input failed
    #[error("Staging error: {0}")]
    Staging(String),

    /// Conversion tool could not be spawned or exited non-zero
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Graph protocol operation failed (transport or protocol-level)
    #[error("Remote error: {0}")]
    Remote(String),

    /// Converted output could not be persisted
    #[error("Publish error: {0}")]
    Publish(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Human-readable message written to a failed job's `error` field.
    ///
    /// Unlike `Display`, this drops the category prefix so tool diagnostics
    /// and validation messages reach the job record verbatim.
    pub fn job_message(&self) -> String {
        match self {
            Error::NotFound(msg)
            | Error::Validation(msg)
            | Error::Staging(msg)
            | Error::Conversion(msg)
            | Error::Remote(msg)
            | Error::Publish(msg)
            | Error::Config(msg)
            | Error::Serialization(msg)
            | Error::Internal(msg) => msg.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// Whether this error ends a job with a Failed status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Staging(_) | Error::Conversion(_) | Error::Publish(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
