//! Broker error types.

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by the session broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Underlying broker command or connection failure. Transient failures
    /// are retried with bounded backoff before this surfaces.
    #[error("broker error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A record on a session channel could not be encoded or decoded.
    #[error("broker payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
