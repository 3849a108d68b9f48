//! Thin contract over the container runtime.
//!
//! Drives containers via the Docker or Podman CLI. The adapter is purely a
//! shell around runtime invocations; no pool state lives here.

mod error;

pub use error::{RuntimeError, RuntimeResult};

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Discriminator label carried by every container this subsystem manages.
pub const MANAGED_LABEL: &str = "berth.docker-cc";
/// Value of the discriminator label.
pub const MANAGED_LABEL_VALUE: &str = "1";
/// Session key the container was created for.
pub const LABEL_SESSION: &str = "berth.session";
/// Agent-instance id, when one was requested at creation.
pub const LABEL_AGENT: &str = "berth.agent";
/// Creation time in epoch milliseconds.
pub const LABEL_CREATED_MS: &str = "berth.created-ms";
/// Configuration fingerprint the container was created under.
pub const LABEL_FINGERPRINT: &str = "berth.fingerprint";

/// Container runtime flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }

    /// Whether bind mounts need SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeKind::Podman)
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Podman => write!(f, "podman"),
        }
    }
}

/// Parameters for creating one managed container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerArgs {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// Memory cap, runtime syntax (e.g. "2g").
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
    pub network: String,
    pub cap_drop: Vec<String>,
    pub security_opts: Vec<String>,
    /// Host workspace path bound to the fixed in-container path.
    pub workspace_bind: Option<(String, String)>,
    /// Additional binds, `host:container` form.
    pub extra_binds: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Result of probing a container's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateProbe {
    pub exists: bool,
    pub running: bool,
}

/// One row from a filtered container listing.
#[derive(Debug, Clone)]
pub struct ListedContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Captured output of an in-container exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Options for retrieving container logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub tail_lines: Option<u32>,
    /// RFC 3339 timestamp or relative duration the runtime accepts.
    pub since: Option<String>,
}

/// Narrow contract over the container runtime.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn available(&self) -> bool;
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;
    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;
    async fn create(&self, args: &CreateContainerArgs) -> RuntimeResult<String>;
    async fn start(&self, name: &str) -> RuntimeResult<()>;
    async fn stop(&self, name: &str, grace: Duration) -> RuntimeResult<()>;
    async fn remove(&self, name: &str, force: bool) -> RuntimeResult<()>;
    async fn inspect_state(&self, name: &str) -> RuntimeResult<StateProbe>;
    async fn inspect_labels(&self, name: &str) -> RuntimeResult<HashMap<String, String>>;
    /// List managed containers matching a `label=value` filter.
    async fn list(&self, label_filter: &str) -> RuntimeResult<Vec<ListedContainer>>;
    async fn exec(
        &self,
        name: &str,
        argv: &[&str],
        timeout: Duration,
    ) -> RuntimeResult<ExecOutput>;
    async fn logs(&self, name: &str, opts: &LogOptions) -> RuntimeResult<String>;

    /// Pull the image unless it is already present.
    async fn ensure_image(&self, image: &str) -> RuntimeResult<()> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        self.pull_image(image).await
    }
}

/// Validate a container ID or name before interpolating it into argv.
fn validate_container_ref(id: &str) -> RuntimeResult<()> {
    if id.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }
    if id.len() > 128 {
        return Err(RuntimeError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !id.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "container ID or name '{id}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate an image reference.
fn validate_image_ref(image: &str) -> RuntimeResult<()> {
    if image.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(RuntimeError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }
    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };
    if !image.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    if image.contains("..") {
        return Err(RuntimeError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }
    Ok(())
}

/// CLI-backed container runtime client.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    kind: RuntimeKind,
    binary: String,
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl CliRuntime {
    /// Auto-detect the available runtime, preferring Docker.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self {
                kind: RuntimeKind::Docker,
                binary: "docker".to_string(),
            }
        } else if Self::is_binary_available("podman") {
            Self {
                kind: RuntimeKind::Podman,
                binary: "podman".to_string(),
            }
        } else {
            // Will fail at runtime; available() reports it.
            Self {
                kind: RuntimeKind::Docker,
                binary: "docker".to_string(),
            }
        }
    }

    pub fn with_kind(kind: RuntimeKind) -> Self {
        Self {
            binary: kind.default_binary().to_string(),
            kind,
        }
    }

    pub fn with_binary(kind: RuntimeKind, binary: impl Into<String>) -> Self {
        Self {
            kind,
            binary: binary.into(),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(&self, command: &str, args: &[String]) -> RuntimeResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerRuntimeApi for CliRuntime {
    async fn available(&self) -> bool {
        self.run("version", &["version".to_string()]).await.is_ok()
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        validate_image_ref(image)?;
        let output = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| RuntimeError::CommandFailed {
                command: "image inspect".to_string(),
                message: e.to_string(),
            })?;
        Ok(output.success())
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        validate_image_ref(image)?;
        debug!("pulling image {image}");
        self.run("pull", &["pull".to_string(), image.to_string()])
            .await?;
        Ok(())
    }

    async fn create(&self, args: &CreateContainerArgs) -> RuntimeResult<String> {
        validate_container_ref(&args.name)?;
        validate_image_ref(&args.image)?;

        let mut argv: Vec<String> = vec![
            "create".to_string(),
            "--name".to_string(),
            args.name.clone(),
        ];

        for (key, value) in &args.labels {
            argv.push("--label".to_string());
            argv.push(format!("{key}={value}"));
        }

        if !args.memory.is_empty() {
            argv.push("--memory".to_string());
            argv.push(args.memory.clone());
        }
        if !args.cpus.is_empty() {
            argv.push("--cpus".to_string());
            argv.push(args.cpus.clone());
        }
        if args.pids_limit > 0 {
            argv.push("--pids-limit".to_string());
            argv.push(args.pids_limit.to_string());
        }
        if !args.network.is_empty() {
            argv.push("--network".to_string());
            argv.push(args.network.clone());
        }
        for cap in &args.cap_drop {
            argv.push("--cap-drop".to_string());
            argv.push(cap.clone());
        }
        for opt in &args.security_opts {
            argv.push("--security-opt".to_string());
            argv.push(opt.clone());
        }

        if let Some((host, container)) = &args.workspace_bind {
            argv.push("-v".to_string());
            if self.kind.needs_selinux_labels() {
                argv.push(format!("{host}:{container}:Z"));
            } else {
                argv.push(format!("{host}:{container}"));
            }
        }
        for bind in &args.extra_binds {
            argv.push("-v".to_string());
            if self.kind.needs_selinux_labels() {
                argv.push(format!("{bind}:Z"));
            } else {
                argv.push(bind.clone());
            }
        }

        for (key, value) in &args.env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }

        argv.push(args.image.clone());

        let stdout = self.run("create", &argv).await?;
        Ok(stdout.trim().to_string())
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        validate_container_ref(name)?;
        self.run("start", &["start".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> RuntimeResult<()> {
        validate_container_ref(name)?;
        self.run(
            "stop",
            &[
                "stop".to_string(),
                "-t".to_string(),
                grace.as_secs().to_string(),
                name.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> RuntimeResult<()> {
        validate_container_ref(name)?;
        let mut argv = vec!["rm".to_string()];
        if force {
            argv.push("-f".to_string());
        }
        argv.push(name.to_string());
        self.run("rm", &argv).await?;
        Ok(())
    }

    async fn inspect_state(&self, name: &str) -> RuntimeResult<StateProbe> {
        validate_container_ref(name)?;
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Running}}", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::CommandFailed {
                command: "inspect".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            // Missing containers are not an error.
            return Ok(StateProbe {
                exists: false,
                running: false,
            });
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(StateProbe {
            exists: true,
            running,
        })
    }

    async fn inspect_labels(&self, name: &str) -> RuntimeResult<HashMap<String, String>> {
        validate_container_ref(name)?;
        let stdout = self
            .run(
                "inspect",
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{json .Config.Labels}}".to_string(),
                    name.to_string(),
                ],
            )
            .await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| RuntimeError::ParseError(format!("labels for {name}: {e}")))
    }

    async fn list(&self, label_filter: &str) -> RuntimeResult<Vec<ListedContainer>> {
        let stdout = self
            .run(
                "ps",
                &[
                    "ps".to_string(),
                    "-a".to_string(),
                    "--filter".to_string(),
                    format!("label={label_filter}"),
                    "--format".to_string(),
                    "{{.Names}}\t{{.ID}}\t{{.State}}".to_string(),
                ],
            )
            .await?;

        let mut out = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.split('\t');
            let (Some(name), Some(id)) = (parts.next(), parts.next()) else {
                continue;
            };
            let state = parts.next().unwrap_or_default();
            let name = name.trim_start_matches('/').to_string();
            let labels = self.inspect_labels(&name).await.unwrap_or_default();
            out.push(ListedContainer {
                id: id.to_string(),
                name,
                labels,
                running: state == "running",
            });
        }
        Ok(out)
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[&str],
        timeout: Duration,
    ) -> RuntimeResult<ExecOutput> {
        validate_container_ref(name)?;
        let mut full: Vec<String> = vec!["exec".to_string(), name.to_string()];
        full.extend(argv.iter().map(|a| a.to_string()));

        let child = Command::new(&self.binary)
            .args(&full)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| RuntimeError::Timeout {
                command: "exec".to_string(),
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| RuntimeError::CommandFailed {
                command: "exec".to_string(),
                message: e.to_string(),
            })?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn logs(&self, name: &str, opts: &LogOptions) -> RuntimeResult<String> {
        validate_container_ref(name)?;
        let mut argv = vec!["logs".to_string()];
        if let Some(tail) = opts.tail_lines {
            argv.push("--tail".to_string());
            argv.push(tail.to_string());
        }
        if let Some(ref since) = opts.since {
            argv.push("--since".to_string());
            argv.push(since.clone());
        }
        argv.push(name.to_string());

        // Runtimes write container output to both streams; capture both.
        let output = Command::new(&self.binary)
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::CommandFailed {
                command: "logs".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed {
                command: "logs".to_string(),
                message: stderr.trim().to_string(),
            });
        }
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}
