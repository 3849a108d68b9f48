//! Container runtime error types.

use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the container runtime adapter.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime CLI invocation failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Failed to parse runtime output.
    #[error("failed to parse runtime output: {0}")]
    ParseError(String),

    /// No container runtime binary available.
    #[error("no container runtime available (docker or podman)")]
    Unavailable,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An exec or pull exceeded its deadline.
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
