//! Pool scheduler error types.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::registry::RegistryError;
use crate::runtime::RuntimeError;

pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A per-agent or total cap is exhausted. Callers may retry later.
    #[error("container pool at capacity: {0}")]
    Capacity(String),

    /// The runtime rejected create or start. Never retried automatically
    /// within a single request.
    #[error("container creation failed: {0}")]
    CreationFailed(String),

    /// The container runtime is not reachable.
    #[error("container runtime unavailable")]
    RuntimeUnavailable,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
