//! Recognized configuration options and their validation.
//!
//! Options can be loaded from a config file layered with `BERTH_`-prefixed
//! environment variables, or constructed directly by the host application.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default broker URL when the container env does not override it.
pub const DEFAULT_REDIS_URL: &str = "redis://redis:6379";

/// Broker URL used host-side when none is configured.
pub const DEFAULT_HOST_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Warm-pool and cap limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolLimits {
    /// Containers kept pre-created and unassigned.
    pub min_warm: usize,
    /// Hard cap on containers managed by this host.
    pub max_total: usize,
    /// Hard cap on containers sharing one agent-instance id.
    pub max_per_agent: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_warm: 1,
            max_total: 10,
            max_per_agent: 3,
        }
    }
}

/// Per-container resource caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpus: "2".to_string(),
            pids_limit: 256,
        }
    }
}

/// Lifecycle timing, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Idle time after which a container becomes a reap candidate.
    pub idle_ms: u64,
    /// Absolute container age cap.
    pub max_age_ms: u64,
    /// Health-tick period; staleness thresholds derive from it.
    pub health_interval_ms: u64,
    /// Bound on container create + start reaching the running state.
    pub startup_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle_ms: 10 * 60 * 1000,
            max_age_ms: 24 * 60 * 60 * 1000,
            health_interval_ms: 30_000,
            startup_ms: 30_000,
        }
    }
}

/// Broker connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisOptions {
    /// Connection URL; host default when unset.
    pub url: Option<String>,
    /// Namespace prefix for every session key.
    pub key_prefix: String,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "berth:cc:".to_string(),
        }
    }
}

/// Container runtime options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerOptions {
    /// Prefix for every managed container name.
    pub container_prefix: String,
    pub network: String,
    pub cap_drop: Vec<String>,
    pub security_opts: Vec<String>,
    /// Additional bind mounts, `host:container` form.
    pub binds: Vec<String>,
    /// Additional environment injected into every container.
    pub env: HashMap<String, String>,
    /// Host workspace given to warm containers before assignment.
    pub default_workspace: Option<String>,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            container_prefix: "berth-cc-".to_string(),
            network: "bridge".to_string(),
            cap_drop: vec!["ALL".to_string()],
            security_opts: vec!["no-new-privileges".to_string()],
            binds: Vec::new(),
            env: HashMap::new(),
            default_workspace: None,
        }
    }
}

/// Full configuration for the container pool subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BerthConfig {
    pub enabled: bool,
    pub pool: PoolLimits,
    /// Image every managed container runs.
    pub image: String,
    pub resources: ResourceLimits,
    pub timeouts: Timeouts,
    pub redis: RedisOptions,
    pub docker: DockerOptions,
    /// Location of the durable registry document.
    pub registry_path: Option<String>,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool: PoolLimits::default(),
            image: "berth-agent:latest".to_string(),
            resources: ResourceLimits::default(),
            timeouts: Timeouts::default(),
            redis: RedisOptions::default(),
            docker: DockerOptions::default(),
            registry_path: None,
        }
    }
}

impl BerthConfig {
    /// Load configuration from an optional file layered with
    /// `BERTH_`-prefixed environment variables (`BERTH_POOL__MAXTOTAL=4`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("BERTH").separator("__"))
            .build()?;
        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the resource-cap and timing rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.min_warm > self.pool.max_total {
            return Err(ConfigError::Invalid(format!(
                "pool.minWarm ({}) exceeds pool.maxTotal ({})",
                self.pool.min_warm, self.pool.max_total
            )));
        }
        if self.pool.max_per_agent > self.pool.max_total {
            return Err(ConfigError::Invalid(format!(
                "pool.maxPerAgent ({}) exceeds pool.maxTotal ({})",
                self.pool.max_per_agent, self.pool.max_total
            )));
        }
        if self.resources.pids_limit < 10 {
            return Err(ConfigError::Invalid(format!(
                "resources.pidsLimit ({}) must be at least 10",
                self.resources.pids_limit
            )));
        }
        if self.timeouts.health_interval_ms < 1000 {
            return Err(ConfigError::Invalid(format!(
                "timeouts.healthIntervalMs ({}) must be at least 1000",
                self.timeouts.health_interval_ms
            )));
        }
        if self.timeouts.idle_ms < self.timeouts.health_interval_ms * 3 {
            return Err(ConfigError::Invalid(format!(
                "timeouts.idleMs ({}) must be at least 3x healthIntervalMs ({})",
                self.timeouts.idle_ms, self.timeouts.health_interval_ms
            )));
        }
        if self.timeouts.startup_ms < 5000 {
            return Err(ConfigError::Invalid(format!(
                "timeouts.startupMs ({}) must be at least 5000",
                self.timeouts.startup_ms
            )));
        }
        Ok(())
    }

    pub fn redis_url(&self) -> &str {
        self.redis.url.as_deref().unwrap_or(DEFAULT_HOST_REDIS_URL)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.health_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.idle_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.timeouts.max_age_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.startup_ms)
    }

    /// Heartbeats older than this mark a container stale.
    pub fn stale_threshold(&self) -> Duration {
        self.health_interval() * 6
    }

    pub fn registry_path(&self) -> PathBuf {
        if let Some(ref path) = self.registry_path {
            return PathBuf::from(path);
        }
        match std::env::var("HOME") {
            Ok(home) => Path::new(&home)
                .join(".local")
                .join("state")
                .join("berth")
                .join("registry.json"),
            Err(_) => PathBuf::from("berth-registry.json"),
        }
    }

    /// Host workspace bound into warm containers before assignment.
    pub fn warm_workspace(&self) -> PathBuf {
        match self.docker.default_workspace {
            Some(ref path) => PathBuf::from(path),
            None => std::env::temp_dir().join("berth-warm"),
        }
    }
}
