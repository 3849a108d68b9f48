//! Composed availability signal for the pool subsystem.
//!
//! One boolean plus a structured detail report over three checks: runtime
//! reachability, broker reachability (with measured latency), and the pool
//! manager's running state and counts. Per-session health derives from the
//! broker state record and heartbeat freshness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::broker::SessionBroker;
use crate::pool::{PoolManager, PoolSnapshot};
use crate::registry::ContainerStatus;
use crate::runtime::ContainerRuntimeApi;

/// Aggregate availability report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub runtime_available: bool,
    /// Broker round-trip latency; `None` when unreachable.
    pub broker_latency_ms: Option<u64>,
    pub pool_running: bool,
    pub pool: PoolSnapshot,
}

/// Health of one session's container, from its state record.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub healthy: bool,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ContainerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_age_ms: Option<u64>,
}

impl SessionHealth {
    fn absent() -> Self {
        Self {
            healthy: false,
            stale: true,
            status: None,
            heartbeat_age_ms: None,
        }
    }
}

/// Composes runtime, broker and pool liveness.
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntimeApi>,
    broker: Arc<dyn SessionBroker>,
    pool: PoolManager,
    health_interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        broker: Arc<dyn SessionBroker>,
        pool: PoolManager,
        health_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            broker,
            pool,
            health_interval,
        }
    }

    /// Single availability signal plus detail.
    pub async fn check(&self) -> HealthReport {
        let runtime_available = self.runtime.available().await;
        let broker_latency_ms = self
            .broker
            .ping()
            .await
            .ok()
            .map(|latency| latency.as_millis() as u64);
        let pool_running = self.pool.is_running();
        let pool = self.pool.snapshot().await;

        HealthReport {
            healthy: runtime_available && broker_latency_ms.is_some() && pool_running,
            runtime_available,
            broker_latency_ms,
            pool_running,
            pool,
        }
    }

    pub async fn is_available(&self) -> bool {
        self.check().await.healthy
    }

    /// A session is healthy iff its state record exists, its status is idle
    /// or running, and its heartbeat is younger than three health
    /// intervals. A missing record is always unhealthy and stale.
    pub async fn session_health(&self, session_key: &str) -> SessionHealth {
        let state = match self.broker.get_state(session_key).await {
            Ok(Some(state)) => state,
            _ => return SessionHealth::absent(),
        };

        let heartbeat_age = state
            .last_heartbeat
            .map(|hb| Utc::now().signed_duration_since(hb).to_std().unwrap_or_default());
        let stale = match heartbeat_age {
            Some(age) => age >= self.health_interval * 3,
            None => true,
        };
        let status_ok = matches!(
            state.status,
            ContainerStatus::Idle | ContainerStatus::Running
        );

        SessionHealth {
            healthy: status_ok && !stale,
            stale,
            status: Some(state.status),
            heartbeat_age_ms: heartbeat_age.map(|age| age.as_millis() as u64),
        }
    }
}
