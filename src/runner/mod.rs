//! Request orchestration façade.
//!
//! [`AgentRunner`] carries one prompt-execution request end-to-end: resolve
//! a container from the pool, subscribe to the session's output channel,
//! push the input record, await the terminal result, and release. A
//! process-wide shared instance is available for hosts that want one; its
//! lifetime is managed explicitly.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::broker::{OutputCallback, RedisBroker, SessionBroker, SessionState};
use crate::config::BerthConfig;
use crate::pool::PoolManager;
use crate::protocol::{AgentMessage, InputRecord, Interrupt, TokenUsage};
use crate::registry::Registry;
use crate::runtime::CliRuntime;

/// Default bound on one request, prompt push to terminal result.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(600);

/// Callback invoked with the translated result before `run` returns.
pub type ResultCallback = Arc<dyn Fn(&RunOutcome) + Send + Sync>;

/// One prompt-execution request.
#[derive(Clone)]
pub struct RunRequest {
    pub session_key: String,
    pub agent_id: Option<String>,
    pub prompt: String,
    pub attachments: Vec<String>,
    pub workspace: PathBuf,
    pub extra_system_prompt: Option<String>,
    pub model: Option<String>,
    /// Agent configuration blob injected into the container at creation.
    pub agent_config: Option<Value>,
    pub timeout: Option<Duration>,
    pub on_output: Option<OutputCallback>,
    pub on_result: Option<ResultCallback>,
}

impl RunRequest {
    pub fn new(session_key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            agent_id: None,
            prompt: prompt.into(),
            attachments: Vec::new(),
            workspace: PathBuf::from("."),
            extra_system_prompt: None,
            model: None,
            agent_config: None,
            timeout: None,
            on_output: None,
            on_result: None,
        }
    }
}

/// Public result value of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Final text; `None` on timeout or when the agent produced none.
    pub result: Option<String>,
    /// Always present; zero-filled when the agent reported none.
    pub usage: TokenUsage,
    pub duration_ms: u64,
    /// 0 on success, 1 when the terminal record's subtype is error.
    pub exit_code: i32,
    /// Resumable agent-session identifier for continuing this context.
    pub agent_session_id: Option<String>,
}

impl RunOutcome {
    fn timed_out() -> Self {
        Self {
            result: None,
            usage: TokenUsage::default(),
            duration_ms: 0,
            exit_code: 0,
            agent_session_id: None,
        }
    }
}

struct RunnerInner {
    pool: PoolManager,
    broker: Arc<dyn SessionBroker>,
}

/// Orchestrates requests against the pool and the broker.
#[derive(Clone)]
pub struct AgentRunner {
    inner: Arc<RunnerInner>,
}

static SHARED: Lazy<Mutex<Option<AgentRunner>>> = Lazy::new(|| Mutex::new(None));

impl AgentRunner {
    /// Build a runner from configuration: CLI runtime, Redis broker and the
    /// durable registry. The pool is not started yet; see [`Self::init`].
    pub async fn new(config: BerthConfig) -> Result<Self> {
        config.validate().context("resolving configuration")?;
        let broker: Arc<dyn SessionBroker> = Arc::new(
            RedisBroker::connect(config.redis_url(), config.redis.key_prefix.clone())
                .await
                .context("connecting to broker")?,
        );
        let runtime = Arc::new(CliRuntime::new());
        let registry = Registry::load(config.registry_path()).context("loading registry")?;
        let pool = PoolManager::new(config, runtime, broker.clone(), registry);
        Ok(Self::from_parts(pool, broker))
    }

    /// Assemble a runner from prebuilt components.
    pub fn from_parts(pool: PoolManager, broker: Arc<dyn SessionBroker>) -> Self {
        Self {
            inner: Arc::new(RunnerInner { pool, broker }),
        }
    }

    /// Start the pool manager. Safe to call more than once.
    pub async fn init(&self) -> Result<()> {
        self.inner.pool.start().await?;
        Ok(())
    }

    pub fn pool(&self) -> &PoolManager {
        &self.inner.pool
    }

    /// The process-wide shared runner, constructed and started lazily.
    pub async fn shared(config: BerthConfig) -> Result<AgentRunner> {
        let mut slot = SHARED.lock().await;
        if let Some(runner) = slot.as_ref() {
            return Ok(runner.clone());
        }
        let runner = AgentRunner::new(config).await?;
        runner.init().await?;
        *slot = Some(runner.clone());
        Ok(runner)
    }

    /// Tear down the shared runner, destroying its containers.
    pub async fn shutdown_shared() {
        let runner = SHARED.lock().await.take();
        if let Some(runner) = runner {
            runner.shutdown().await;
        }
    }

    /// Execute one request end-to-end.
    ///
    /// The subscription is completed before the input is pushed so no early
    /// output records are lost; it is dropped on every exit path. On
    /// timeout a null result with zero usage is returned and the container
    /// is left as-is for the maintenance tick to deal with.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let session = request.session_key.clone();
        let timeout = request.timeout.unwrap_or(DEFAULT_RUN_TIMEOUT);

        let assignment = self
            .inner
            .pool
            .get_container(
                &session,
                request.agent_id.as_deref(),
                &request.workspace,
                request.agent_config.as_ref(),
            )
            .await?;
        debug!(
            "session {session} assigned container {} for run",
            assignment.name
        );

        // Subscribe before pushing input; the subscription aborts on drop,
        // so cleanup also happens on the error paths below.
        let _subscription = match request.on_output.clone() {
            Some(callback) => {
                let forward: OutputCallback = Arc::new(move |message: AgentMessage| {
                    callback(message);
                });
                Some(
                    self.inner
                        .broker
                        .subscribe_output(&session, forward)
                        .await
                        .context("subscribing to output")?,
                )
            }
            None => None,
        };

        let mut input = InputRecord::new(request.prompt.clone());
        input.attachments = request.attachments.clone();
        input.extra_system_prompt = request.extra_system_prompt.clone();
        input.model = request.model.clone();
        self.inner
            .broker
            .send_input(&session, &input)
            .await
            .context("pushing input record")?;

        let outcome = match self
            .inner
            .broker
            .wait_for_result(&session, timeout)
            .await
            .context("waiting for result")?
        {
            Some(result) => {
                let state = self.inner.broker.get_state(&session).await.ok().flatten();
                RunOutcome {
                    exit_code: if result.is_error() { 1 } else { 0 },
                    usage: result.usage,
                    duration_ms: result.duration_ms.unwrap_or(0),
                    agent_session_id: state
                        .and_then(|s| s.agent_session_id)
                        .or(result.session_id),
                    result: result.result,
                }
            }
            None => {
                info!("session {session} run timed out after {timeout:?}");
                RunOutcome::timed_out()
            }
        };

        if let Some(callback) = request.on_result {
            callback(&outcome);
        }
        Ok(outcome)
    }

    /// Interrupt the session's current turn and release its container back
    /// to the pool.
    pub async fn stop(&self, session_key: &str) -> Result<()> {
        if let Err(err) = self
            .inner
            .broker
            .send_interrupt(session_key, &Interrupt::Stop)
            .await
        {
            warn!("stop interrupt for {session_key} failed: {err}");
        }
        self.inner.pool.release_container(session_key, true).await?;
        Ok(())
    }

    /// The session's state record, when its wrapper has published one.
    pub async fn get_status(&self, session_key: &str) -> Result<Option<SessionState>> {
        Ok(self.inner.broker.get_state(session_key).await?)
    }

    pub async fn send_interrupt(&self, session_key: &str, interrupt: Interrupt) -> Result<()> {
        self.inner
            .broker
            .send_interrupt(session_key, &interrupt)
            .await?;
        Ok(())
    }

    /// Stop background work but preserve containers.
    pub async fn close(&self) {
        self.inner.pool.stop().await;
    }

    /// Tear down: stop background work and destroy every container.
    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
    }
}

/// Collect output messages into a shared vector; convenience for callers
/// that want the full transcript alongside the result.
pub fn collecting_callback() -> (OutputCallback, Arc<StdMutex<Vec<AgentMessage>>>) {
    let collected = Arc::new(StdMutex::new(Vec::new()));
    let sink = collected.clone();
    let callback: OutputCallback = Arc::new(move |message| {
        if let Ok(mut collected) = sink.lock() {
            collected.push(message);
        }
    });
    (callback, collected)
}
