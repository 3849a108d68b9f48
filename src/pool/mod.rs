//! The container-pool scheduler.
//!
//! Owns container lifecycles under concurrent demand and strict resource
//! caps: assignment of sessions to containers, warm-pool maintenance,
//! health-driven reaping, and reconciliation of the durable registry with
//! the actual runtime. All mutation of the in-memory maps is serialized
//! behind one mutex; broker and runtime calls happen outside it and
//! invariants are re-checked after blocking I/O.

mod error;

pub use error::{PoolError, PoolResult};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::SessionBroker;
use crate::config::{BerthConfig, DEFAULT_REDIS_URL};
use crate::naming::{config_fingerprint, derive_container_name};
use crate::protocol::Interrupt;
use crate::registry::{ContainerRecord, ContainerStatus, Registry};
use crate::runtime::{
    ContainerRuntimeApi, CreateContainerArgs, LogOptions, StateProbe, LABEL_AGENT,
    LABEL_CREATED_MS, LABEL_FINGERPRINT, LABEL_SESSION, MANAGED_LABEL, MANAGED_LABEL_VALUE,
};

/// Fixed workspace mount point inside every container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Grace period for stopping a container before it is removed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Maintenance tick period.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Counts reported by [`PoolManager::snapshot`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub active: usize,
    pub warm: usize,
}

/// A warm-pool member and the session key its wrapper currently listens on.
#[derive(Debug, Clone)]
struct WarmEntry {
    name: String,
    boot_key: String,
}

#[derive(Debug, Default)]
struct PoolState {
    /// session key -> container name
    sessions: HashMap<String, String>,
    warm: VecDeque<WarmEntry>,
}

struct PoolInner {
    config: BerthConfig,
    fingerprint: String,
    runtime: Arc<dyn ContainerRuntimeApi>,
    broker: Arc<dyn SessionBroker>,
    registry: Registry,
    state: Mutex<PoolState>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

/// The central scheduler. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl PoolManager {
    pub fn new(
        config: BerthConfig,
        runtime: Arc<dyn ContainerRuntimeApi>,
        broker: Arc<dyn SessionBroker>,
        registry: Registry,
    ) -> Self {
        let fingerprint = config_fingerprint(&config);
        Self {
            inner: Arc::new(PoolInner {
                config,
                fingerprint,
                runtime,
                broker,
                registry,
                state: Mutex::new(PoolState::default()),
                tickers: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntimeApi> {
        self.inner.runtime.clone()
    }

    pub fn broker(&self) -> Arc<dyn SessionBroker> {
        self.inner.broker.clone()
    }

    /// Verify the runtime, reconcile registry and runtime both ways,
    /// rebuild the in-memory maps, start the background ticks and top up
    /// the warm pool. Idempotent.
    pub async fn start(&self) -> PoolResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.inner.runtime.available().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(PoolError::RuntimeUnavailable);
        }

        if let Err(err) = self.inner.runtime.ensure_image(&self.inner.config.image).await {
            warn!("could not ensure image {}: {err}", self.inner.config.image);
        }

        self.reconcile().await?;

        let health = {
            let mgr = self.clone();
            let period = self.inner.config.health_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                while mgr.is_running() {
                    ticker.tick().await;
                    mgr.health_tick().await;
                }
            })
        };
        let maintenance = {
            let mgr = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
                ticker.tick().await;
                while mgr.is_running() {
                    ticker.tick().await;
                    mgr.maintenance_tick().await;
                }
            })
        };
        self.inner.tickers.lock().await.extend([health, maintenance]);

        self.ensure_warm_pool().await;

        let snapshot = self.snapshot().await;
        info!(
            "container pool started (total={}, active={}, warm={})",
            snapshot.total, snapshot.active, snapshot.warm
        );
        Ok(())
    }

    /// Cancel the background ticks but preserve containers.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for task in self.inner.tickers.lock().await.drain(..) {
            task.abort();
        }
    }

    /// Cancel the background ticks and destroy every tracked container,
    /// best-effort.
    pub async fn shutdown(&self) {
        self.stop().await;
        for record in self.inner.registry.list().await {
            self.destroy_container(&record.name).await;
        }
        let mut state = self.inner.state.lock().await;
        state.sessions.clear();
        state.warm.clear();
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let total = self.inner.registry.list().await.len();
        let state = self.inner.state.lock().await;
        PoolSnapshot {
            total,
            active: state.sessions.len(),
            warm: state.warm.len(),
        }
    }

    /// Resolve a container for a session: reuse the mapped one, adopt from
    /// the registry, take a warm container, or create one, in that order.
    /// Cap checks happen before any creation.
    pub async fn get_container(
        &self,
        session_key: &str,
        agent_id: Option<&str>,
        workspace: &Path,
        agent_config: Option<&Value>,
    ) -> PoolResult<ContainerRecord> {
        // 1. Session already mapped in memory.
        let mapped = {
            let state = self.inner.state.lock().await;
            state.sessions.get(session_key).cloned()
        };
        if let Some(name) = mapped {
            let probe = self
                .inner
                .runtime
                .inspect_state(&name)
                .await
                .unwrap_or_default();
            if probe.running {
                if let Some(record) = self.inner.registry.get_by_name(&name).await {
                    return Ok(record);
                }
            }
            debug!("mapped container {name} for {session_key} is gone, cleaning up");
            self.destroy_container(&name).await;
        }

        // 2. Adopt a running container the registry still knows about.
        if let Some(record) = self.inner.registry.get_by_session(session_key).await {
            let probe = self
                .inner
                .runtime
                .inspect_state(&record.name)
                .await
                .unwrap_or_default();
            if probe.running {
                let mut state = self.inner.state.lock().await;
                state
                    .sessions
                    .insert(session_key.to_string(), record.name.clone());
                return Ok(record);
            }
            self.destroy_container(&record.name).await;
        }

        // 3. Caps. Assignment binds the agent id, so the per-agent cap
        // applies to warm reuse as well as creation.
        if let Some(agent) = agent_id {
            let owned = self.inner.registry.list_by_agent(agent).await.len();
            if owned >= self.inner.config.pool.max_per_agent {
                return Err(PoolError::Capacity(format!(
                    "agent {agent} already holds {owned} containers (maxPerAgent={})",
                    self.inner.config.pool.max_per_agent
                )));
            }
        }

        // 4. Take a warm container.
        let warm = {
            let mut state = self.inner.state.lock().await;
            state.warm.pop_front()
        };
        if let Some(entry) = warm {
            if let Err(err) = self
                .inner
                .registry
                .assign_to_session(&entry.name, session_key, agent_id)
                .await
            {
                let mut state = self.inner.state.lock().await;
                state.warm.push_front(entry);
                return Err(err.into());
            }

            // Re-verify the per-agent cap after the blocking assign; a
            // concurrent assignment may have raced past the pre-check.
            if let Some(agent) = agent_id {
                let mut owned = self.inner.registry.list_by_agent(agent).await;
                if !within_cap(&mut owned, &entry.name, self.inner.config.pool.max_per_agent) {
                    let _ = self.inner.registry.unassign(&entry.name).await;
                    let mut state = self.inner.state.lock().await;
                    state.warm.push_back(entry);
                    return Err(PoolError::Capacity(format!(
                        "agent {agent} reached maxPerAgent={} concurrently",
                        self.inner.config.pool.max_per_agent
                    )));
                }
            }

            // Re-key the wrapper's session channels onto the caller session.
            if let Err(err) = self
                .inner
                .broker
                .send_interrupt(
                    &entry.boot_key,
                    &Interrupt::Rebind {
                        session_key: session_key.to_string(),
                    },
                )
                .await
            {
                warn!(
                    "rebind for warm container {} failed: {err}; health tick will reap it",
                    entry.name
                );
            }

            {
                let mut state = self.inner.state.lock().await;
                state
                    .sessions
                    .insert(session_key.to_string(), entry.name.clone());
            }

            let mgr = self.clone();
            tokio::spawn(async move { mgr.ensure_warm_pool().await });

            info!(
                "assigned warm container {} to session {session_key}",
                entry.name
            );
            return self
                .inner
                .registry
                .get_by_name(&entry.name)
                .await
                .ok_or_else(|| {
                    PoolError::CreationFailed(format!(
                        "assigned container {} vanished from registry",
                        entry.name
                    ))
                });
        }

        // 5. Nothing warm; creating a container is subject to the total cap.
        let total = self.inner.registry.list().await.len();
        if total >= self.inner.config.pool.max_total {
            return Err(PoolError::Capacity(format!(
                "{total} containers already exist (maxTotal={})",
                self.inner.config.pool.max_total
            )));
        }

        let record = self
            .create_container(session_key, agent_id, workspace, agent_config, true)
            .await?;

        // Re-verify both caps now the record exists; concurrent creations
        // may have raced past the pre-checks. Ordering by creation time is
        // shared by every racer, so exactly one of them backs off.
        let mut all = self.inner.registry.list().await;
        let over_total = !within_cap(&mut all, &record.name, self.inner.config.pool.max_total);
        let over_agent = match agent_id {
            Some(agent) => {
                let mut owned = self.inner.registry.list_by_agent(agent).await;
                !within_cap(&mut owned, &record.name, self.inner.config.pool.max_per_agent)
            }
            None => false,
        };
        if over_total || over_agent {
            self.destroy_container(&record.name).await;
            return Err(PoolError::Capacity(
                "cap reached by a concurrent assignment".to_string(),
            ));
        }

        {
            let mut state = self.inner.state.lock().await;
            state
                .sessions
                .insert(session_key.to_string(), record.name.clone());
        }
        info!(
            "created container {} for session {session_key}",
            record.name
        );
        Ok(record)
    }

    /// Remove the session mapping; return the container to the warm pool
    /// when requested and the pool is below floor, destroy it otherwise.
    /// A container whose fingerprint has drifted is never reused.
    pub async fn release_container(
        &self,
        session_key: &str,
        return_to_pool: bool,
    ) -> PoolResult<()> {
        let (name, warm_len) = {
            let mut state = self.inner.state.lock().await;
            let name = state.sessions.remove(session_key);
            (name, state.warm.len())
        };
        let Some(name) = name else {
            debug!("release for unmapped session {session_key}");
            return Ok(());
        };

        let fingerprint_current = self
            .inner
            .registry
            .get_by_name(&name)
            .await
            .map(|r| r.config_fingerprint == self.inner.fingerprint)
            .unwrap_or(false);

        if return_to_pool && warm_len < self.inner.config.pool.min_warm && fingerprint_current {
            match self.inner.registry.unassign(&name).await {
                Ok(()) => {
                    let mut state = self.inner.state.lock().await;
                    state.warm.push_back(WarmEntry {
                        name: name.clone(),
                        boot_key: session_key.to_string(),
                    });
                    info!("returned container {name} to the warm pool");
                    Ok(())
                }
                Err(err) => {
                    // Registry write failed; roll the mapping back.
                    let mut state = self.inner.state.lock().await;
                    state.sessions.insert(session_key.to_string(), name);
                    Err(err.into())
                }
            }
        } else {
            self.destroy_container(&name).await;
            Ok(())
        }
    }

    /// Recent logs of the container serving a session.
    pub async fn container_logs(
        &self,
        session_key: &str,
        tail_lines: Option<u32>,
    ) -> PoolResult<Option<String>> {
        let Some(record) = self.inner.registry.get_by_session(session_key).await else {
            return Ok(None);
        };
        let logs = self
            .inner
            .runtime
            .logs(
                &record.name,
                &LogOptions {
                    tail_lines,
                    since: None,
                },
            )
            .await?;
        Ok(Some(logs))
    }

    /// Compare the registry with the runtime's actual containers and
    /// destroy on disagreement in either direction, then rebuild the
    /// in-memory maps from what survived.
    async fn reconcile(&self) -> PoolResult<()> {
        let listed = self
            .inner
            .runtime
            .list(&format!("{MANAGED_LABEL}={MANAGED_LABEL_VALUE}"))
            .await?;
        let existing: HashSet<String> = listed.iter().map(|c| c.name.clone()).collect();

        let removed = self.inner.registry.reconcile(&existing).await?;
        if !removed.is_empty() {
            info!("reconciliation dropped {} registry records", removed.len());
        }

        let mut sessions = HashMap::new();
        let mut warm = VecDeque::new();

        for listed_container in &listed {
            let name = &listed_container.name;
            match self.inner.registry.get_by_name(name).await {
                None => {
                    info!("destroying unrecorded managed container {name}");
                    let _ = self.inner.runtime.stop(name, STOP_GRACE).await;
                    let _ = self.inner.runtime.remove(name, true).await;
                }
                Some(record) if record.config_fingerprint != self.inner.fingerprint => {
                    info!("destroying container {name} with drifted configuration");
                    self.destroy_container(name).await;
                }
                Some(record) => match record.session_key.clone() {
                    Some(session) if listed_container.running => {
                        sessions.insert(session, record.name.clone());
                    }
                    Some(_) => {
                        self.destroy_container(name).await;
                    }
                    None => {
                        // Warm candidate: only adoptable when the wrapper's
                        // session key is recoverable from the creation label.
                        let boot_key = listed_container.labels.get(LABEL_SESSION).cloned();
                        match boot_key {
                            Some(key)
                                if listed_container.running
                                    && record.status == ContainerStatus::Idle
                                    && key.starts_with("warm-") =>
                            {
                                warm.push_back(WarmEntry {
                                    name: record.name.clone(),
                                    boot_key: key,
                                });
                            }
                            _ => {
                                self.destroy_container(name).await;
                            }
                        }
                    }
                },
            }
        }

        let mut state = self.inner.state.lock().await;
        state.sessions = sessions;
        state.warm = warm;
        Ok(())
    }

    /// Create and start a new container, wait for it to reach the running
    /// state, and record it. `assign` binds it to the session key;
    /// otherwise it is recorded unassigned for the warm pool.
    async fn create_container(
        &self,
        session_key: &str,
        agent_id: Option<&str>,
        workspace: &Path,
        agent_config: Option<&Value>,
        assign: bool,
    ) -> PoolResult<ContainerRecord> {
        let config = &self.inner.config;
        let name = format!(
            "{}{}",
            config.docker.container_prefix,
            derive_container_name(session_key)
        );

        let args = self.build_create_args(&name, session_key, agent_id, workspace, agent_config);

        let mut record = ContainerRecord::new("", &name, &self.inner.fingerprint);
        if assign {
            record.session_key = Some(session_key.to_string());
            record.agent_id = agent_id.map(str::to_string);
        }
        self.inner.registry.upsert(record.clone()).await?;

        let id = match self.inner.runtime.create(&args).await {
            Ok(id) => id,
            Err(err) => {
                let _ = self.inner.registry.remove_by_name(&name).await;
                return Err(PoolError::CreationFailed(err.to_string()));
            }
        };
        record.id = id;
        record.status = ContainerStatus::Starting;
        self.inner.registry.upsert(record.clone()).await?;

        if let Err(err) = self.inner.runtime.start(&name).await {
            let _ = self.inner.runtime.remove(&name, true).await;
            let _ = self.inner.registry.remove_by_name(&name).await;
            return Err(PoolError::CreationFailed(err.to_string()));
        }

        // Wait for the runtime to report the container running.
        let deadline = tokio::time::Instant::now() + config.startup_timeout();
        loop {
            let probe = self
                .inner
                .runtime
                .inspect_state(&name)
                .await
                .unwrap_or_default();
            if probe.running {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.inner.runtime.remove(&name, true).await;
                let _ = self.inner.registry.remove_by_name(&name).await;
                return Err(PoolError::CreationFailed(format!(
                    "container {name} did not reach running state within {}ms",
                    config.timeouts.startup_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        record.status = ContainerStatus::Idle;
        self.inner.registry.upsert(record.clone()).await?;
        Ok(record)
    }

    fn build_create_args(
        &self,
        name: &str,
        session_key: &str,
        agent_id: Option<&str>,
        workspace: &Path,
        agent_config: Option<&Value>,
    ) -> CreateContainerArgs {
        let config = &self.inner.config;

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string());
        labels.insert(LABEL_SESSION.to_string(), session_key.to_string());
        if let Some(agent) = agent_id {
            labels.insert(LABEL_AGENT.to_string(), agent.to_string());
        }
        labels.insert(
            LABEL_CREATED_MS.to_string(),
            Utc::now().timestamp_millis().to_string(),
        );
        labels.insert(
            LABEL_FINGERPRINT.to_string(),
            self.inner.fingerprint.clone(),
        );

        let mut env = config.docker.env.clone();
        env.insert("SESSION_ID".to_string(), session_key.to_string());
        env.insert(
            "REDIS_URL".to_string(),
            config
                .redis
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
        );
        env.insert(
            "WORKSPACE_PATH".to_string(),
            CONTAINER_WORKSPACE.to_string(),
        );
        env.insert(
            "BERTH_KEY_PREFIX".to_string(),
            config.redis.key_prefix.clone(),
        );
        if let Some(blob) = agent_config {
            env.insert("CLAUDE_CONFIG".to_string(), blob.to_string());
            for (blob_key, env_key) in [
                ("model", "CLAUDE_MODEL"),
                ("gateway_url", "GATEWAY_URL"),
                ("gateway_token", "GATEWAY_TOKEN"),
                ("parent_session_id", "PARENT_SESSION_ID"),
            ] {
                if let Some(value) = blob.get(blob_key).and_then(Value::as_str) {
                    env.insert(env_key.to_string(), value.to_string());
                }
            }
        }

        CreateContainerArgs {
            name: name.to_string(),
            image: config.image.clone(),
            labels,
            memory: config.resources.memory.clone(),
            cpus: config.resources.cpus.clone(),
            pids_limit: config.resources.pids_limit,
            network: config.docker.network.clone(),
            cap_drop: config.docker.cap_drop.clone(),
            security_opts: config.docker.security_opts.clone(),
            workspace_bind: Some((
                workspace.to_string_lossy().to_string(),
                CONTAINER_WORKSPACE.to_string(),
            )),
            extra_binds: config.docker.binds.clone(),
            env,
        }
    }

    /// Stop, remove, unregister and unmap a container, best-effort.
    async fn destroy_container(&self, name: &str) {
        let _ = self
            .inner
            .registry
            .set_status(name, ContainerStatus::Stopping)
            .await;
        if let Err(err) = self.inner.runtime.stop(name, STOP_GRACE).await {
            debug!("stopping container {name}: {err}");
        }
        if let Err(err) = self.inner.runtime.remove(name, true).await {
            debug!("removing container {name}: {err}");
        }
        if let Err(err) = self.inner.registry.remove_by_name(name).await {
            warn!("removing registry record for {name}: {err}");
        }
        let mut state = self.inner.state.lock().await;
        state.sessions.retain(|_, mapped| mapped != name);
        state.warm.retain(|entry| entry.name != name);
    }

    /// Create containers until the warm pool reaches its floor, clamped by
    /// the total cap. Failures are logged; the next tick retries.
    async fn ensure_warm_pool(&self) {
        loop {
            let warm_len = self.inner.state.lock().await.warm.len();
            let total = self.inner.registry.list().await.len();
            let floor = self.inner.config.pool.min_warm;
            let headroom = self.inner.config.pool.max_total.saturating_sub(total);
            let need = floor.saturating_sub(warm_len).min(headroom);
            if need == 0 {
                return;
            }

            let boot_key = format!(
                "warm-{}-{}",
                Utc::now().timestamp_millis(),
                warm_suffix()
            );
            let workspace = self.inner.config.warm_workspace();
            if let Err(err) = std::fs::create_dir_all(&workspace) {
                warn!("cannot prepare warm workspace {}: {err}", workspace.display());
                return;
            }

            match self
                .create_container(&boot_key, None, &workspace, None, false)
                .await
            {
                Ok(record) => {
                    let mut state = self.inner.state.lock().await;
                    state.warm.push_back(WarmEntry {
                        name: record.name,
                        boot_key,
                    });
                }
                Err(err) => {
                    warn!("warm pool top-up failed: {err}");
                    return;
                }
            }
        }
    }

    /// Mirror wrapper heartbeats into the registry, then reap or fail
    /// containers whose heartbeat went stale. Errors are logged and
    /// suppressed; the tick must not die.
    async fn health_tick(&self) {
        let stale_threshold = self.inner.config.stale_threshold();

        for record in self.inner.registry.list().await {
            let Some(key) = self.wrapper_key_for(&record).await else {
                continue;
            };
            match self.inner.broker.get_state(&key).await {
                Ok(Some(state)) => {
                    let fresh = state
                        .last_heartbeat
                        .map(|hb| {
                            Utc::now().signed_duration_since(hb).to_std().unwrap_or_default()
                                < stale_threshold
                        })
                        .unwrap_or(false);
                    if !fresh {
                        continue;
                    }
                    if let Err(err) = self
                        .inner
                        .registry
                        .touch_heartbeat(
                            &record.name,
                            state.agent_session_id.clone(),
                            Some(state.turn_count),
                        )
                        .await
                    {
                        warn!("heartbeat mirror for {} failed: {err}", record.name);
                    }
                    // Reflect the wrapper's idle/running transitions.
                    if matches!(
                        state.status,
                        ContainerStatus::Idle | ContainerStatus::Running
                    ) && state.status != record.status
                        && matches!(
                            record.status,
                            ContainerStatus::Idle | ContainerStatus::Running
                        )
                    {
                        let _ = self
                            .inner
                            .registry
                            .set_status(&record.name, state.status)
                            .await;
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("state read for {} failed: {err}", record.name),
            }
        }

        for record in self.inner.registry.list_stale(stale_threshold).await {
            // Inspection errors are treated as "not running".
            let probe = match self.inner.runtime.inspect_state(&record.name).await {
                Ok(probe) => probe,
                Err(err) => {
                    warn!("inspect during health check of {} failed: {err}", record.name);
                    StateProbe::default()
                }
            };
            if !probe.exists || !probe.running {
                info!("destroying stale container {}", record.name);
                self.destroy_container(&record.name).await;
            } else {
                warn!(
                    "container {} is running but its heartbeat is stale, marking failed",
                    record.name
                );
                let _ = self
                    .inner
                    .registry
                    .set_status(&record.name, ContainerStatus::Failed)
                    .await;
                let mut state = self.inner.state.lock().await;
                state.sessions.retain(|_, mapped| mapped != &record.name);
                state.warm.retain(|entry| entry.name != record.name);
            }
        }
    }

    /// Reap idle and over-age containers, keeping enough idle ones to fill
    /// the warm pool, then top the pool back up.
    async fn maintenance_tick(&self) {
        let mut idle = self
            .inner
            .registry
            .list_idle_exceeding(self.inner.config.idle_timeout())
            .await;
        idle.sort_by_key(|r| r.last_heartbeat);

        let deficit = {
            let state = self.inner.state.lock().await;
            self.inner
                .config
                .pool
                .min_warm
                .saturating_sub(state.warm.len())
        };

        let mut kept = 0usize;
        for record in idle {
            let already_warm = {
                let state = self.inner.state.lock().await;
                state.warm.iter().any(|entry| entry.name == record.name)
            };
            if !already_warm && kept < deficit {
                if let Some(session) = record.session_key.clone() {
                    if self.inner.registry.unassign(&record.name).await.is_ok() {
                        let mut state = self.inner.state.lock().await;
                        state.sessions.remove(&session);
                        state.warm.push_back(WarmEntry {
                            name: record.name.clone(),
                            boot_key: session,
                        });
                        kept += 1;
                        info!("kept idle container {} for the warm pool", record.name);
                        continue;
                    }
                }
            }
            info!("destroying idle container {}", record.name);
            self.destroy_container(&record.name).await;
        }

        for record in self
            .inner
            .registry
            .list_older_than(self.inner.config.max_age())
            .await
        {
            info!("destroying over-age container {}", record.name);
            self.destroy_container(&record.name).await;
        }

        self.ensure_warm_pool().await;
    }

    /// The broker session key the container's wrapper currently listens on.
    async fn wrapper_key_for(&self, record: &ContainerRecord) -> Option<String> {
        if let Some(session) = record.session_key.clone() {
            return Some(session);
        }
        let state = self.inner.state.lock().await;
        state
            .warm
            .iter()
            .find(|entry| entry.name == record.name)
            .map(|entry| entry.boot_key.clone())
    }
}

/// Whether `name` fits inside `cap` when `records` are ordered oldest
/// first (name as tiebreak). Every concurrent caller computes the same
/// order, so cap overflows resolve deterministically.
fn within_cap(records: &mut [ContainerRecord], name: &str, cap: usize) -> bool {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
    records
        .iter()
        .position(|r| r.name == name)
        .map(|rank| rank < cap)
        .unwrap_or(false)
}

fn warm_suffix() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBroker, FakeRuntime};
    use uuid::Uuid;

    fn test_config(min_warm: usize, max_total: usize, max_per_agent: usize) -> BerthConfig {
        let mut config = BerthConfig::default();
        config.pool.min_warm = min_warm;
        config.pool.max_total = max_total;
        config.pool.max_per_agent = max_per_agent;
        config.docker.default_workspace = Some(
            std::env::temp_dir()
                .join("berth-warm-test")
                .to_string_lossy()
                .to_string(),
        );
        config
    }

    fn temp_registry() -> Registry {
        let path = std::env::temp_dir()
            .join("berth-tests")
            .join(Uuid::new_v4().to_string())
            .join("registry.json");
        Registry::load(path).expect("load empty registry")
    }

    struct Harness {
        pool: PoolManager,
        runtime: Arc<FakeRuntime>,
        broker: Arc<FakeBroker>,
    }

    fn harness(config: BerthConfig) -> Harness {
        harness_with_registry(config, temp_registry())
    }

    fn harness_with_registry(config: BerthConfig, registry: Registry) -> Harness {
        let runtime = Arc::new(FakeRuntime::new());
        let broker = Arc::new(FakeBroker::new());
        let pool = PoolManager::new(config, runtime.clone(), broker.clone(), registry);
        Harness {
            pool,
            runtime,
            broker,
        }
    }

    async fn wait_for_warm(pool: &PoolManager, expected: usize) {
        for _ in 0..200 {
            if pool.snapshot().await.warm == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "warm pool never reached {expected}, snapshot: {:?}",
            pool.snapshot().await
        );
    }

    fn workspace() -> std::path::PathBuf {
        std::env::temp_dir().join("berth-ws-test")
    }

    fn managed_labels(session_key: &str, fingerprint: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string());
        labels.insert(LABEL_SESSION.to_string(), session_key.to_string());
        labels.insert(LABEL_FINGERPRINT.to_string(), fingerprint.to_string());
        labels
    }

    #[test]
    fn test_warm_suffix_shape() {
        let a = warm_suffix();
        assert_eq!(a.len(), 6);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_start_fills_warm_pool_from_empty() {
        let h = harness(test_config(1, 2, 2));
        h.pool.start().await.unwrap();

        let snapshot = h.pool.snapshot().await;
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.warm, 1);
        assert!(h.pool.is_running());

        // Idempotent.
        h.pool.start().await.unwrap();
        assert_eq!(h.pool.snapshot().await.total, 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_runtime_unavailable() {
        let h = harness(test_config(1, 2, 2));
        h.runtime
            .unavailable
            .store(true, std::sync::atomic::Ordering::SeqCst);

        match h.pool.start().await {
            Err(PoolError::RuntimeUnavailable) => {}
            other => panic!("expected RuntimeUnavailable, got {other:?}"),
        }
        assert!(!h.pool.is_running());
    }

    #[tokio::test]
    async fn test_warm_assignment_rebinds_and_replenishes() {
        let h = harness(test_config(1, 2, 2));
        h.pool.start().await.unwrap();

        let warm_name = h.runtime.container_names().pop().unwrap();
        let boot_key = h
            .runtime
            .container(&warm_name)
            .unwrap()
            .labels
            .get(LABEL_SESSION)
            .cloned()
            .unwrap();
        assert!(boot_key.starts_with("warm-"));

        let record = h
            .pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();
        assert_eq!(record.name, warm_name);
        assert_eq!(record.session_key.as_deref(), Some("s1"));

        // The wrapper was told to re-key onto the caller session.
        let interrupts = h.broker.sent_interrupts(&boot_key);
        assert!(interrupts.iter().any(|i| matches!(
            i,
            Interrupt::Rebind { session_key } if session_key == "s1"
        )));

        // Warm pool tops back up asynchronously.
        wait_for_warm(&h.pool, 1).await;
        let snapshot = h.pool.snapshot().await;
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.active, 1);
    }

    #[tokio::test]
    async fn test_repeat_request_reuses_mapped_container() {
        let h = harness(test_config(0, 2, 2));
        h.pool.start().await.unwrap();

        let first = h
            .pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();
        let second = h
            .pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();
        assert_eq!(first.name, second.name);
        assert_eq!(h.pool.snapshot().await.total, 1);
    }

    #[tokio::test]
    async fn test_capacity_boundary_min0_max1() {
        let h = harness(test_config(0, 1, 1));
        h.pool.start().await.unwrap();

        h.pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();
        match h.pool.get_container("s2", None, &workspace(), None).await {
            Err(PoolError::Capacity(_)) => {}
            other => panic!("expected Capacity, got {other:?}"),
        }

        h.pool.release_container("s1", false).await.unwrap();
        h.pool
            .get_container("s2", None, &workspace(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_per_agent_cap() {
        let h = harness(test_config(0, 4, 1));
        h.pool.start().await.unwrap();

        h.pool
            .get_container("s1", Some("agent-a"), &workspace(), None)
            .await
            .unwrap();
        match h
            .pool
            .get_container("s2", Some("agent-a"), &workspace(), None)
            .await
        {
            Err(PoolError::Capacity(_)) => {}
            other => panic!("expected Capacity, got {other:?}"),
        }
        // A different agent is unaffected.
        h.pool
            .get_container("s3", Some("agent-b"), &workspace(), None)
            .await
            .unwrap();
        assert_eq!(h.pool.snapshot().await.total, 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_per_agent_cap() {
        let h = harness(test_config(0, 4, 1));
        h.pool.start().await.unwrap();

        let ws = workspace();
        let (a, b) = tokio::join!(
            h.pool.get_container("s1", Some("agent-a"), &ws, None),
            h.pool.get_container("s2", Some("agent-a"), &ws, None),
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1, "exactly one concurrent request may win");
        let loser = if a.is_err() { a.err() } else { b.err() };
        assert!(matches!(loser, Some(PoolError::Capacity(_))));
        assert_eq!(h.pool.snapshot().await.total, 1);
    }

    #[test]
    fn test_within_cap_orders_by_creation_then_name() {
        let mut records: Vec<ContainerRecord> = ["b", "a", "c"]
            .iter()
            .map(|name| ContainerRecord::new(format!("id-{name}"), *name, "fp"))
            .collect();
        // Identical creation instants fall back to name ordering.
        let stamp = Utc::now();
        for record in &mut records {
            record.created_at = stamp;
        }

        assert!(within_cap(&mut records, "a", 1));
        assert!(!within_cap(&mut records, "b", 1));
        assert!(within_cap(&mut records, "b", 2));
        assert!(!within_cap(&mut records, "missing", 3));
    }

    #[tokio::test]
    async fn test_release_returns_to_pool_below_floor() {
        let h = harness(test_config(2, 2, 2));
        h.pool.start().await.unwrap();
        wait_for_warm(&h.pool, 2).await;

        let record = h
            .pool
            .get_container("s1", Some("agent-a"), &workspace(), None)
            .await
            .unwrap();
        // maxTotal is reached, so the warm pool cannot top up past 1.
        assert_eq!(h.pool.snapshot().await.warm, 1);

        h.pool.release_container("s1", true).await.unwrap();
        let snapshot = h.pool.snapshot().await;
        assert_eq!(snapshot.warm, 2);
        assert_eq!(snapshot.active, 0);

        // Registry entry is restored to the unassigned idle shape.
        let record = h.pool.inner.registry.get_by_name(&record.name).await.unwrap();
        assert_eq!(record.session_key, None);
        assert_eq!(record.status, ContainerStatus::Idle);
        assert_eq!(record.turn_count, 0);
        assert_eq!(record.agent_session_id, None);
    }

    #[tokio::test]
    async fn test_release_destroys_when_floor_satisfied() {
        let h = harness(test_config(0, 2, 2));
        h.pool.start().await.unwrap();

        let record = h
            .pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();
        h.pool.release_container("s1", true).await.unwrap();

        // minWarm is 0; the container is gone from every map.
        let snapshot = h.pool.snapshot().await;
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.warm, 0);
        assert!(h.runtime.container(&record.name).is_none());
    }

    #[tokio::test]
    async fn test_release_unknown_session_is_noop() {
        let h = harness(test_config(0, 2, 2));
        h.pool.start().await.unwrap();
        h.pool.release_container("nope", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_creation_failure_is_not_capacity() {
        let h = harness(test_config(0, 2, 2));
        h.pool.start().await.unwrap();
        h.runtime
            .fail_create
            .store(true, std::sync::atomic::Ordering::SeqCst);

        match h.pool.get_container("s1", None, &workspace(), None).await {
            Err(PoolError::CreationFailed(_)) => {}
            other => panic!("expected CreationFailed, got {other:?}"),
        }
        // No partial container or record is left behind.
        assert_eq!(h.pool.snapshot().await.total, 0);
        assert!(h.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_drops_registry_orphans() {
        let config = test_config(0, 4, 4);
        let registry = temp_registry();
        let mut ghost = ContainerRecord::new("ghost-id", "ghost", config_fingerprint(&config));
        ghost.status = ContainerStatus::Running;
        ghost.session_key = Some("s-ghost".to_string());
        registry.upsert(ghost).await.unwrap();

        let h = harness_with_registry(config, registry);
        h.pool.start().await.unwrap();

        assert!(h.pool.inner.registry.get_by_name("ghost").await.is_none());
        assert_eq!(h.pool.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn test_reconcile_destroys_unrecorded_containers() {
        let config = test_config(0, 4, 4);
        let h = harness(config.clone());
        h.runtime.insert_container(
            "rogue",
            managed_labels("s-rogue", &config_fingerprint(&config)),
            true,
        );

        h.pool.start().await.unwrap();
        assert!(h.runtime.container("rogue").is_none());
    }

    #[tokio::test]
    async fn test_reconcile_destroys_fingerprint_drift() {
        let config = test_config(0, 4, 4);
        let registry = temp_registry();
        let mut stale = ContainerRecord::new("drift-id", "drift", "stale-fingerprint");
        stale.status = ContainerStatus::Running;
        stale.session_key = Some("s1".to_string());
        registry.upsert(stale).await.unwrap();

        let h = harness_with_registry(config, registry);
        h.runtime
            .insert_container("drift", managed_labels("s1", "stale-fingerprint"), true);

        h.pool.start().await.unwrap();
        assert!(h.runtime.container("drift").is_none());
        assert!(h.pool.inner.registry.get_by_name("drift").await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_adopts_running_assigned_container() {
        let config = test_config(0, 4, 4);
        let fingerprint = config_fingerprint(&config);
        let registry = temp_registry();
        let mut existing = ContainerRecord::new("keep-id", "keep", &fingerprint);
        existing.status = ContainerStatus::Running;
        existing.session_key = Some("s1".to_string());
        registry.upsert(existing).await.unwrap();

        let h = harness_with_registry(config, registry);
        h.runtime
            .insert_container("keep", managed_labels("s1", &fingerprint), true);

        h.pool.start().await.unwrap();
        assert_eq!(h.pool.snapshot().await.active, 1);

        let record = h
            .pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();
        assert_eq!(record.name, "keep");
        assert_eq!(h.pool.snapshot().await.total, 1);
    }

    #[tokio::test]
    async fn test_health_tick_destroys_stale_gone_container() {
        let config = test_config(0, 4, 4);
        let fingerprint = config_fingerprint(&config);
        let registry = temp_registry();
        let mut dead = ContainerRecord::new("dead-id", "dead", &fingerprint);
        dead.status = ContainerStatus::Running;
        dead.session_key = Some("s1".to_string());
        dead.last_heartbeat = Utc::now() - chrono::Duration::hours(1);
        registry.upsert(dead).await.unwrap();

        // The runtime no longer knows the container at all.
        let h = harness_with_registry(config, registry);
        h.pool.health_tick().await;

        assert!(h.pool.inner.registry.get_by_name("dead").await.is_none());
    }

    #[tokio::test]
    async fn test_health_tick_fails_stale_but_running_container() {
        let config = test_config(0, 4, 4);
        let fingerprint = config_fingerprint(&config);
        let registry = temp_registry();
        let mut wedged = ContainerRecord::new("wedged-id", "wedged", &fingerprint);
        wedged.status = ContainerStatus::Running;
        wedged.session_key = Some("s1".to_string());
        wedged.last_heartbeat = Utc::now() - chrono::Duration::hours(1);
        registry.upsert(wedged).await.unwrap();

        let h = harness_with_registry(config, registry);
        h.runtime
            .insert_container("wedged", managed_labels("s1", &fingerprint), true);
        h.pool.start().await.unwrap();
        assert_eq!(h.pool.snapshot().await.active, 1);

        h.pool.health_tick().await;

        let record = h.pool.inner.registry.get_by_name("wedged").await.unwrap();
        assert_eq!(record.status, ContainerStatus::Failed);
        // Session mapping severed; the runner will time out or error.
        assert_eq!(h.pool.snapshot().await.active, 0);
        // The container itself is preserved for inspection.
        assert!(h.runtime.container("wedged").is_some());
    }

    #[tokio::test]
    async fn test_health_tick_mirrors_wrapper_heartbeats() {
        let h = harness(test_config(0, 4, 4));
        h.pool.start().await.unwrap();
        h.pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();

        let mut state = crate::broker::SessionState::idle();
        state.agent_session_id = Some("resume-1".to_string());
        state.turn_count = 7;
        state.status = ContainerStatus::Running;
        h.broker.set_state("s1", state);

        h.pool.health_tick().await;

        let record = h.pool.inner.registry.get_by_session("s1").await.unwrap();
        assert_eq!(record.agent_session_id.as_deref(), Some("resume-1"));
        assert_eq!(record.turn_count, 7);
        assert_eq!(record.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_maintenance_destroys_over_age_containers() {
        let mut config = test_config(0, 4, 4);
        config.timeouts.max_age_ms = 60 * 60 * 1000;
        let fingerprint = config_fingerprint(&config);
        let registry = temp_registry();
        let mut old = ContainerRecord::new("old-id", "old", &fingerprint);
        old.status = ContainerStatus::Running;
        old.session_key = Some("s1".to_string());
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        registry.upsert(old).await.unwrap();

        let h = harness_with_registry(config, registry);
        h.runtime
            .insert_container("old", managed_labels("s1", &fingerprint), true);
        h.pool.start().await.unwrap();

        h.pool.maintenance_tick().await;
        assert!(h.runtime.container("old").is_none());
        assert_eq!(h.pool.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn test_maintenance_keeps_idle_container_for_warm_pool() {
        let config = test_config(1, 1, 1);
        let fingerprint = config_fingerprint(&config);
        let registry = temp_registry();
        let mut idle = ContainerRecord::new("idle-id", "idle", &fingerprint);
        idle.status = ContainerStatus::Idle;
        idle.session_key = Some("s1".to_string());
        idle.last_heartbeat = Utc::now() - chrono::Duration::hours(1);
        registry.upsert(idle).await.unwrap();

        let h = harness_with_registry(config, registry);
        h.runtime
            .insert_container("idle", managed_labels("s1", &fingerprint), true);
        h.pool.start().await.unwrap();

        h.pool.maintenance_tick().await;

        let snapshot = h.pool.snapshot().await;
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.warm, 1);
        let record = h.pool.inner.registry.get_by_name("idle").await.unwrap();
        assert_eq!(record.session_key, None);
        assert_eq!(record.status, ContainerStatus::Idle);
    }

    #[tokio::test]
    async fn test_warm_pool_converges_after_release_cycle() {
        let h = harness(test_config(2, 3, 3));
        h.pool.start().await.unwrap();
        wait_for_warm(&h.pool, 2).await;

        h.pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();
        wait_for_warm(&h.pool, 2).await;

        h.pool.release_container("s1", true).await.unwrap();
        // Floor already satisfied; the released container is destroyed and
        // the pool settles at min(minWarm, maxTotal).
        wait_for_warm(&h.pool, 2).await;
        let snapshot = h.pool.snapshot().await;
        assert_eq!(snapshot.warm, 2);
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test]
    async fn test_stop_preserves_containers() {
        let h = harness(test_config(1, 2, 2));
        h.pool.start().await.unwrap();
        h.pool.stop().await;

        assert!(!h.pool.is_running());
        assert_eq!(h.runtime.container_names().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let h = harness(test_config(1, 3, 3));
        h.pool.start().await.unwrap();
        h.pool
            .get_container("s1", None, &workspace(), None)
            .await
            .unwrap();

        h.pool.shutdown().await;

        assert!(h.runtime.container_names().is_empty());
        let snapshot = h.pool.snapshot().await;
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.warm, 0);
    }

    #[tokio::test]
    async fn test_container_env_and_labels() {
        let h = harness(test_config(0, 2, 2));
        h.pool.start().await.unwrap();

        let agent_config = serde_json::json!({"model": "sonnet", "agent_command": "claude"});
        let record = h
            .pool
            .get_container("My Session!", Some("agent-a"), &workspace(), Some(&agent_config))
            .await
            .unwrap();

        let container = h.runtime.container(&record.name).unwrap();
        assert_eq!(container.labels.get(MANAGED_LABEL).unwrap(), "1");
        assert_eq!(container.labels.get(LABEL_SESSION).unwrap(), "My Session!");
        assert_eq!(container.labels.get(LABEL_AGENT).unwrap(), "agent-a");
        assert!(container.labels.contains_key(LABEL_FINGERPRINT));
        assert!(container.labels.contains_key(LABEL_CREATED_MS));

        assert_eq!(container.env.get("SESSION_ID").unwrap(), "My Session!");
        assert_eq!(container.env.get("WORKSPACE_PATH").unwrap(), "/workspace");
        assert_eq!(container.env.get("CLAUDE_MODEL").unwrap(), "sonnet");
        assert!(container.env.contains_key("REDIS_URL"));
        assert!(container.env.contains_key("BERTH_KEY_PREFIX"));
        assert!(container.env.contains_key("CLAUDE_CONFIG"));

        // Container name derives from the session key plus the prefix.
        assert!(record.name.starts_with("berth-cc-my-session"));
    }
}
