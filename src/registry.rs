//! Durable, single-writer record of every container known to this host.
//!
//! Backed by one versioned JSON document on local disk. All writers live in
//! the host process, so each mutation is a read-modify-write of the whole
//! document: the in-memory copy is cloned, mutated, persisted, and only then
//! committed, so a failed write never corrupts the in-memory view.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Current registry document schema version. Documents with any other
/// version load as empty so future migrations never crash older data.
const REGISTRY_VERSION: u32 = 1;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("container not found in registry: {0}")]
    NotFound(String),
}

/// Lifecycle state of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Starting,
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "starting" => Some(Self::Starting),
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The unit persisted per container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container runtime id; immutable post-creation.
    pub id: String,
    /// Container name; immutable post-creation.
    pub name: String,
    /// Owning session, or `None` for warm-pool members.
    pub session_key: Option<String>,
    /// Agent-instance identifier, set at assignment.
    pub agent_id: Option<String>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub turn_count: u32,
    /// Resumable agent-session identifier surfaced by the wrapper.
    pub agent_session_id: Option<String>,
    /// Hash of image + resource limits + runtime options at creation time.
    pub config_fingerprint: String,
}

impl ContainerRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        config_fingerprint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            session_key: None,
            agent_id: None,
            status: ContainerStatus::Creating,
            created_at: now,
            last_heartbeat: now,
            turn_count: 0,
            agent_session_id: None,
            config_fingerprint: config_fingerprint.into(),
        }
    }

    /// Warm-pool membership: unassigned and idle.
    pub fn is_warm(&self) -> bool {
        self.session_key.is_none() && self.status == ContainerStatus::Idle
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDoc {
    version: u32,
    containers: BTreeMap<String, ContainerRecord>,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            containers: BTreeMap::new(),
        }
    }
}

/// Durable store of [`ContainerRecord`]s, keyed by container name.
pub struct Registry {
    path: PathBuf,
    doc: Mutex<RegistryDoc>,
}

impl Registry {
    /// Open the registry document at `path`, creating parent directories.
    ///
    /// A missing, unreadable or unknown-version document yields an empty
    /// registry; it is never a startup failure.
    pub fn load(path: impl Into<PathBuf>) -> RegistryResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let doc = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<RegistryDoc>(&bytes) {
                Ok(doc) if doc.version == REGISTRY_VERSION => doc,
                Ok(doc) => {
                    warn!(
                        "registry document at {} has unknown version {}, starting empty",
                        path.display(),
                        doc.version
                    );
                    RegistryDoc::default()
                }
                Err(err) => {
                    warn!(
                        "registry document at {} is unreadable ({err}), starting empty",
                        path.display()
                    );
                    RegistryDoc::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RegistryDoc::default(),
            Err(err) => return Err(err.into()),
        };
        debug!(
            "loaded registry from {} ({} containers)",
            path.display(),
            doc.containers.len()
        );
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    async fn persist(&self, doc: &RegistryDoc) -> RegistryResult<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `mutate` to a clone of the document, persist it, then commit.
    async fn write<F, T>(&self, mutate: F) -> RegistryResult<T>
    where
        F: FnOnce(&mut RegistryDoc) -> RegistryResult<T>,
    {
        let mut guard = self.doc.lock().await;
        let mut next = guard.clone();
        let out = mutate(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }

    pub async fn upsert(&self, record: ContainerRecord) -> RegistryResult<()> {
        self.write(|doc| {
            doc.containers.insert(record.name.clone(), record);
            Ok(())
        })
        .await
    }

    pub async fn remove_by_name(&self, name: &str) -> RegistryResult<()> {
        self.write(|doc| {
            doc.containers.remove(name);
            Ok(())
        })
        .await
    }

    pub async fn get_by_name(&self, name: &str) -> Option<ContainerRecord> {
        self.doc.lock().await.containers.get(name).cloned()
    }

    pub async fn get_by_session(&self, session_key: &str) -> Option<ContainerRecord> {
        self.doc
            .lock()
            .await
            .containers
            .values()
            .find(|r| r.session_key.as_deref() == Some(session_key))
            .cloned()
    }

    pub async fn list(&self) -> Vec<ContainerRecord> {
        self.doc.lock().await.containers.values().cloned().collect()
    }

    pub async fn list_by_agent(&self, agent_id: &str) -> Vec<ContainerRecord> {
        self.doc
            .lock()
            .await
            .containers
            .values()
            .filter(|r| r.agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect()
    }

    /// Warm-pool members: unassigned and idle.
    pub async fn list_warm(&self) -> Vec<ContainerRecord> {
        self.doc
            .lock()
            .await
            .containers
            .values()
            .filter(|r| r.is_warm())
            .cloned()
            .collect()
    }

    pub async fn assign_to_session(
        &self,
        name: &str,
        session_key: &str,
        agent_id: Option<&str>,
    ) -> RegistryResult<()> {
        self.write(|doc| {
            let record = doc
                .containers
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            record.session_key = Some(session_key.to_string());
            record.agent_id = agent_id.map(str::to_string);
            record.last_heartbeat = Utc::now();
            Ok(())
        })
        .await
    }

    /// Return a container to the unassigned pool: clears the session, the
    /// resumable session id and the turn count, and sets status idle.
    pub async fn unassign(&self, name: &str) -> RegistryResult<()> {
        self.write(|doc| {
            let record = doc
                .containers
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            record.session_key = None;
            record.agent_id = None;
            record.agent_session_id = None;
            record.turn_count = 0;
            record.status = ContainerStatus::Idle;
            record.last_heartbeat = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn touch_heartbeat(
        &self,
        name: &str,
        agent_session_id: Option<String>,
        turn_count: Option<u32>,
    ) -> RegistryResult<()> {
        self.write(|doc| {
            let Some(record) = doc.containers.get_mut(name) else {
                debug!("heartbeat for unknown container {name}, ignoring");
                return Ok(());
            };
            record.last_heartbeat = Utc::now();
            if agent_session_id.is_some() {
                record.agent_session_id = agent_session_id;
            }
            if let Some(turns) = turn_count {
                record.turn_count = turns;
            }
            Ok(())
        })
        .await
    }

    /// Set the status, bumping the heartbeat.
    pub async fn set_status(&self, name: &str, status: ContainerStatus) -> RegistryResult<()> {
        self.write(|doc| {
            let Some(record) = doc.containers.get_mut(name) else {
                debug!("status update for unknown container {name}, ignoring");
                return Ok(());
            };
            record.status = status;
            record.last_heartbeat = Utc::now();
            Ok(())
        })
        .await
    }

    /// Idle containers whose last heartbeat is older than `idle_for`.
    pub async fn list_idle_exceeding(&self, idle_for: Duration) -> Vec<ContainerRecord> {
        let cutoff = Utc::now() - chrono::Duration::from_std(idle_for).unwrap_or_default();
        self.doc
            .lock()
            .await
            .containers
            .values()
            .filter(|r| r.status == ContainerStatus::Idle && r.last_heartbeat < cutoff)
            .cloned()
            .collect()
    }

    /// Containers created more than `age` ago.
    pub async fn list_older_than(&self, age: Duration) -> Vec<ContainerRecord> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
        self.doc
            .lock()
            .await
            .containers
            .values()
            .filter(|r| r.created_at < cutoff)
            .cloned()
            .collect()
    }

    /// Containers that should be heartbeating but whose heartbeat is older
    /// than `threshold`.
    pub async fn list_stale(&self, threshold: Duration) -> Vec<ContainerRecord> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_default();
        self.doc
            .lock()
            .await
            .containers
            .values()
            .filter(|r| {
                matches!(r.status, ContainerStatus::Idle | ContainerStatus::Running)
                    && r.last_heartbeat < cutoff
            })
            .cloned()
            .collect()
    }

    /// Drop every record whose name the runtime no longer knows. Returns the
    /// removed names.
    pub async fn reconcile(
        &self,
        existing_names: &std::collections::HashSet<String>,
    ) -> RegistryResult<Vec<String>> {
        self.write(|doc| {
            let removed: Vec<String> = doc
                .containers
                .keys()
                .filter(|name| !existing_names.contains(*name))
                .cloned()
                .collect();
            for name in &removed {
                doc.containers.remove(name);
            }
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn temp_registry() -> (Registry, PathBuf) {
        let path = std::env::temp_dir()
            .join("berth-tests")
            .join(Uuid::new_v4().to_string())
            .join("registry.json");
        let registry = Registry::load(&path).expect("load empty registry");
        (registry, path)
    }

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord::new(format!("id-{name}"), name, "fp0000")
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let (registry, _path) = temp_registry();
        registry.upsert(record("c1")).await.unwrap();

        let got = registry.get_by_name("c1").await.unwrap();
        assert_eq!(got.id, "id-c1");
        assert_eq!(got.status, ContainerStatus::Creating);
        assert!(registry.get_by_name("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_survives_reload() {
        let (registry, path) = temp_registry();
        registry.upsert(record("c1")).await.unwrap();
        registry
            .set_status("c1", ContainerStatus::Idle)
            .await
            .unwrap();
        drop(registry);

        let reloaded = Registry::load(&path).unwrap();
        let got = reloaded.get_by_name("c1").await.unwrap();
        assert_eq!(got.status, ContainerStatus::Idle);
    }

    #[tokio::test]
    async fn test_unknown_version_loads_empty() {
        let path = std::env::temp_dir()
            .join("berth-tests")
            .join(Uuid::new_v4().to_string())
            .join("registry.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"version": 99, "containers": {}}"#).unwrap();

        let registry = Registry::load(&path).unwrap();
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_loads_empty() {
        let path = std::env::temp_dir()
            .join("berth-tests")
            .join(Uuid::new_v4().to_string())
            .join("registry.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json at all").unwrap();

        let registry = Registry::load(&path).unwrap();
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_assign_then_unassign_round_trip() {
        let (registry, _path) = temp_registry();
        let mut rec = record("c1");
        rec.status = ContainerStatus::Idle;
        registry.upsert(rec).await.unwrap();

        registry
            .assign_to_session("c1", "session-1", Some("agent-a"))
            .await
            .unwrap();
        registry
            .touch_heartbeat("c1", Some("resume-xyz".to_string()), Some(4))
            .await
            .unwrap();

        let assigned = registry.get_by_name("c1").await.unwrap();
        assert_eq!(assigned.session_key.as_deref(), Some("session-1"));
        assert_eq!(assigned.agent_id.as_deref(), Some("agent-a"));
        assert_eq!(assigned.turn_count, 4);

        registry.unassign("c1").await.unwrap();
        let back = registry.get_by_name("c1").await.unwrap();
        assert_eq!(back.session_key, None);
        assert_eq!(back.status, ContainerStatus::Idle);
        assert_eq!(back.turn_count, 0);
        assert_eq!(back.agent_session_id, None);
    }

    #[tokio::test]
    async fn test_warm_listing() {
        let (registry, _path) = temp_registry();
        let mut warm = record("warm");
        warm.status = ContainerStatus::Idle;
        registry.upsert(warm).await.unwrap();

        let mut busy = record("busy");
        busy.status = ContainerStatus::Running;
        busy.session_key = Some("s1".to_string());
        registry.upsert(busy).await.unwrap();

        let warm_names: Vec<_> = registry
            .list_warm()
            .await
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(warm_names, vec!["warm"]);
    }

    #[tokio::test]
    async fn test_stale_filter_excludes_terminal_statuses() {
        let (registry, _path) = temp_registry();
        let old = Utc::now() - chrono::Duration::minutes(10);

        for (name, status) in [
            ("idle", ContainerStatus::Idle),
            ("running", ContainerStatus::Running),
            ("stopped", ContainerStatus::Stopped),
            ("failed", ContainerStatus::Failed),
        ] {
            let mut rec = record(name);
            rec.status = status;
            rec.last_heartbeat = old;
            registry.upsert(rec).await.unwrap();
        }

        let mut stale: Vec<_> = registry
            .list_stale(Duration::from_secs(60))
            .await
            .into_iter()
            .map(|r| r.name)
            .collect();
        stale.sort();
        assert_eq!(stale, vec!["idle", "running"]);
    }

    #[tokio::test]
    async fn test_reconcile_drops_unknown_names() {
        let (registry, _path) = temp_registry();
        registry.upsert(record("keep")).await.unwrap();
        registry.upsert(record("drop")).await.unwrap();

        let existing: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let removed = registry.reconcile(&existing).await.unwrap();
        assert_eq!(removed, vec!["drop"]);
        assert!(registry.get_by_name("drop").await.is_none());
        assert!(registry.get_by_name("keep").await.is_some());
    }

    #[tokio::test]
    async fn test_list_older_than() {
        let (registry, _path) = temp_registry();
        let mut old = record("old");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        registry.upsert(old).await.unwrap();
        registry.upsert(record("new")).await.unwrap();

        let aged: Vec<_> = registry
            .list_older_than(Duration::from_secs(3600))
            .await
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(aged, vec!["old"]);
    }
}
