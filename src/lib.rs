//! Container pool scheduler and session I/O fabric.
//!
//! `berth` keeps a pool of sandboxed worker containers, each hosting a
//! long-running agent process, and routes prompt-execution requests keyed by
//! a logical session identifier to a dedicated container. Structured agent
//! output is streamed back to the caller over a Redis broker in near real
//! time; containers are recycled or scaled according to demand, age and
//! health.
//!
//! The main entry point is [`runner::AgentRunner`], which orchestrates a
//! single request end-to-end on top of the [`pool::PoolManager`] scheduler
//! and the [`broker::SessionBroker`] channel set. The matching in-container
//! side of the protocol ships as the `berth-wrapper` binary built from
//! [`wrapper`].

pub mod broker;
pub mod config;
pub mod health;
pub mod naming;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod stream;
#[cfg(test)]
pub(crate) mod testing;
pub mod wrapper;

pub use broker::{RedisBroker, SessionBroker, SessionState};
pub use config::BerthConfig;
pub use health::{HealthMonitor, HealthReport};
pub use pool::{PoolError, PoolManager, PoolSnapshot};
pub use protocol::{AgentMessage, InputRecord, Interrupt, TokenUsage, TurnResult};
pub use registry::{ContainerRecord, ContainerStatus, Registry};
pub use runner::{AgentRunner, RunOutcome, RunRequest};
pub use runtime::{CliRuntime, ContainerRuntimeApi};
pub use stream::StreamParser;
