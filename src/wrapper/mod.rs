//! In-container wrapper: the container-side half of the session protocol.
//!
//! The wrapper is the container's main process. It heartbeats the session
//! state record, blocks on the input queue, spawns the agent process for
//! each input, parses its output stream, publishes every parsed record and
//! the terminal result, and obeys control-channel interrupts. It exits
//! cleanly on SIGTERM/SIGINT.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::{OutputSubscription, RedisBroker, SessionBroker, SessionState};
use crate::config::{DEFAULT_REDIS_URL, RedisOptions};
use crate::protocol::{
    AgentMessage, InputRecord, Interrupt, RedirectPriority, ResultSubtype, TokenUsage, TurnResult,
};
use crate::registry::ContainerStatus;
use crate::stream::StreamParser;

/// Heartbeat period; the state record's TTL is refreshed on each beat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Blocking-pop granularity; bounds shutdown latency while idle.
const INPUT_POLL: Duration = Duration::from_secs(1);

/// Default agent binary when the configuration blob names none.
const DEFAULT_AGENT_COMMAND: &str = "claude";

/// Wrapper configuration, read from the container environment.
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub session_key: String,
    pub redis_url: String,
    pub key_prefix: String,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub parent_session_id: Option<String>,
    pub workspace: PathBuf,
    pub model: Option<String>,
    pub agent_config: Option<Value>,
}

impl WrapperConfig {
    /// Read the fixed environment variable set.
    pub fn from_env() -> Result<Self> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let agent_config = match env("CLAUDE_CONFIG") {
            Some(blob) => match serde_json::from_str(&blob) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!("ignoring undecodable CLAUDE_CONFIG: {err}");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            session_key: env("SESSION_ID").context("SESSION_ID is required")?,
            redis_url: env("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            key_prefix: env("BERTH_KEY_PREFIX")
                .unwrap_or_else(|| RedisOptions::default().key_prefix),
            gateway_url: env("GATEWAY_URL"),
            gateway_token: env("GATEWAY_TOKEN"),
            parent_session_id: env("PARENT_SESSION_ID"),
            workspace: PathBuf::from(env("WORKSPACE_PATH").unwrap_or_else(|| "/workspace".into())),
            model: env("CLAUDE_MODEL"),
            agent_config,
        })
    }

    fn agent_program(&self) -> String {
        self.agent_config
            .as_ref()
            .and_then(|c| c.get("agent_command"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_AGENT_COMMAND)
            .to_string()
    }
}

/// Prompt text injected for a redirect interrupt.
fn redirect_prompt(message: &str, priority: RedirectPriority) -> String {
    format!("[interrupt:{priority}] {message}")
}

/// Build the agent invocation for one input.
fn build_agent_argv(
    config: &WrapperConfig,
    input: &InputRecord,
    resume_session: Option<&str>,
) -> (String, Vec<String>) {
    let mut prompt = input.prompt.clone();
    if !input.attachments.is_empty() {
        prompt.push_str("\n\nAttached files:");
        for attachment in &input.attachments {
            prompt.push_str("\n- ");
            prompt.push_str(attachment);
        }
    }

    let mut args = vec![
        "-p".to_string(),
        prompt,
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if let Some(model) = input.model.as_deref().or(config.model.as_deref()) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(resume) = resume_session {
        args.push("--resume".to_string());
        args.push(resume.to_string());
    }
    if let Some(extra) = &input.extra_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(extra.clone());
    }

    (config.agent_program(), args)
}

fn signal_child(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, signal);
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The wrapper process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Wrapper {
    config: WrapperConfig,
    broker: Arc<dyn SessionBroker>,
    /// Current session key; changes on rebind.
    session: Arc<RwLock<String>>,
    status: Arc<RwLock<ContainerStatus>>,
    agent_session_id: Arc<RwLock<Option<String>>>,
    turn_count: Arc<AtomicU32>,
}

impl Wrapper {
    pub async fn connect(config: WrapperConfig) -> Result<Self> {
        let broker = RedisBroker::connect(&config.redis_url, config.key_prefix.clone())
            .await
            .context("connecting to broker")?;
        Ok(Self::with_broker(config, Arc::new(broker)))
    }

    pub fn with_broker(config: WrapperConfig, broker: Arc<dyn SessionBroker>) -> Self {
        let session = config.session_key.clone();
        Self {
            config,
            broker,
            session: Arc::new(RwLock::new(session)),
            status: Arc::new(RwLock::new(ContainerStatus::Idle)),
            agent_session_id: Arc::new(RwLock::new(None)),
            turn_count: Arc::new(AtomicU32::new(0)),
        }
    }

    fn session_key(&self) -> String {
        self.session.read().expect("session lock").clone()
    }

    fn set_status(&self, status: ContainerStatus) {
        *self.status.write().expect("status lock") = status;
    }

    fn current_state(&self) -> SessionState {
        SessionState {
            status: *self.status.read().expect("status lock"),
            last_heartbeat: Some(chrono::Utc::now()),
            agent_session_id: self.agent_session_id.read().expect("id lock").clone(),
            turn_count: self.turn_count.load(Ordering::SeqCst),
        }
    }

    async fn publish_state(&self) {
        let state = self.current_state();
        if let Err(err) = self.broker.update_state(&self.session_key(), &state).await {
            warn!("state publish failed: {err}");
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let wrapper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                wrapper.publish_state().await;
            }
        })
    }

    async fn subscribe_control(
        &self,
        tx: mpsc::UnboundedSender<Interrupt>,
    ) -> Result<OutputSubscription> {
        let subscription = self
            .broker
            .subscribe_control(
                &self.session_key(),
                Arc::new(move |interrupt| {
                    let _ = tx.send(interrupt);
                }),
            )
            .await
            .context("subscribing to control channel")?;
        Ok(subscription)
    }

    /// Main loop: heartbeat, drain missed interrupts, then block on input.
    pub async fn run(&self) -> Result<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_signal_listener(shutdown.clone());

        info!(
            "wrapper serving session {} (workspace {})",
            self.session_key(),
            self.config.workspace.display()
        );
        self.publish_state().await;
        let heartbeat = self.spawn_heartbeat();

        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();
        let mut control_sub = self.subscribe_control(ctrl_tx.clone()).await?;

        // Absorb interrupts missed while no subscriber listened.
        match self.broker.drain_interrupts(&self.session_key()).await {
            Ok(missed) => {
                for interrupt in missed {
                    let _ = ctrl_tx.send(interrupt);
                }
            }
            Err(err) => warn!("interrupt drain failed: {err}"),
        }

        let mut parser = StreamParser::new();
        'main: while !shutdown.load(Ordering::SeqCst) {
            while let Ok(interrupt) = ctrl_rx.try_recv() {
                match self
                    .handle_idle_interrupt(interrupt, &ctrl_tx, &mut control_sub)
                    .await
                {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break 'main,
                    Err(err) => warn!("interrupt handling failed: {err:#}"),
                }
            }

            match self
                .broker
                .pop_input(&self.session_key(), INPUT_POLL)
                .await
            {
                Ok(Some(input)) => {
                    if let Err(err) = self
                        .run_turn(input, &mut parser, &mut ctrl_rx, &ctrl_tx, &mut control_sub, &shutdown)
                        .await
                    {
                        error!("turn failed: {err:#}");
                        self.set_status(ContainerStatus::Idle);
                        self.publish_state().await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("input pop failed: {err}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        heartbeat.abort();
        control_sub.unsubscribe();
        self.set_status(ContainerStatus::Stopped);
        self.publish_state().await;
        info!("wrapper for session {} exiting", self.session_key());
        Ok(())
    }

    /// Interrupts arriving between turns.
    async fn handle_idle_interrupt(
        &self,
        interrupt: Interrupt,
        ctrl_tx: &mpsc::UnboundedSender<Interrupt>,
        control_sub: &mut OutputSubscription,
    ) -> Result<Flow> {
        match interrupt {
            Interrupt::Stop => {
                info!("stop interrupt received while idle, shutting down");
                Ok(Flow::Stop)
            }
            Interrupt::Redirect { message, priority } => {
                self.queue_redirect(&message, priority).await;
                Ok(Flow::Continue)
            }
            Interrupt::Pause | Interrupt::Resume => {
                debug!("pause/resume interrupt while idle, nothing to do");
                Ok(Flow::Continue)
            }
            Interrupt::Rebind { session_key } => {
                self.rebind(session_key, ctrl_tx, control_sub).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Inject a priority-prefixed message at the head of the input queue.
    async fn queue_redirect(&self, message: &str, priority: RedirectPriority) {
        let input = InputRecord::new(redirect_prompt(message, priority));
        if let Err(err) = self
            .broker
            .push_input_front(&self.session_key(), &input)
            .await
        {
            warn!("redirect enqueue failed: {err}");
        }
    }

    /// Re-key the session channels after a warm-pool assignment: move the
    /// control subscription, absorb interrupts already queued for the new
    /// key, and start heartbeating under it.
    async fn rebind(
        &self,
        new_session: String,
        ctrl_tx: &mpsc::UnboundedSender<Interrupt>,
        control_sub: &mut OutputSubscription,
    ) -> Result<()> {
        info!(
            "rebinding from session {} to {}",
            self.session_key(),
            new_session
        );
        *self.session.write().expect("session lock") = new_session.clone();

        let new_sub = self.subscribe_control(ctrl_tx.clone()).await?;
        let old = std::mem::replace(control_sub, new_sub);
        old.unsubscribe();

        match self.broker.drain_interrupts(&new_session).await {
            Ok(missed) => {
                for interrupt in missed {
                    let _ = ctrl_tx.send(interrupt);
                }
            }
            Err(err) => warn!("interrupt drain after rebind failed: {err}"),
        }

        self.publish_state().await;
        Ok(())
    }

    /// One input: spawn the agent, stream its output through the parser,
    /// publish records, capture and publish the terminal result.
    async fn run_turn(
        &self,
        input: InputRecord,
        parser: &mut StreamParser,
        ctrl_rx: &mut mpsc::UnboundedReceiver<Interrupt>,
        ctrl_tx: &mpsc::UnboundedSender<Interrupt>,
        control_sub: &mut OutputSubscription,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<()> {
        parser.reset();
        self.set_status(ContainerStatus::Running);
        self.publish_state().await;
        let started = Instant::now();

        let resume = self.agent_session_id.read().expect("id lock").clone();
        let (program, args) = build_agent_argv(&self.config, &input, resume.as_deref());
        debug!("spawning agent: {program} {args:?}");

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&self.config.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning agent process {program}"))?;

        let mut stdout = child.stdout.take().context("agent stdout missing")?;
        let stderr_tail = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut collected = String::new();
                let _ = stderr.read_to_string(&mut collected).await;
                collected
            })
        });

        let mut terminal: Option<TurnResult> = None;
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        for message in parser.feed(&chunk) {
                            self.dispatch_message(message, &mut terminal).await;
                        }
                    }
                    Err(err) => {
                        warn!("agent stdout read failed: {err}");
                        break;
                    }
                },
                Some(interrupt) = ctrl_rx.recv() => match interrupt {
                    Interrupt::Stop => {
                        info!("stop interrupt received mid-turn, killing agent");
                        let _ = child.start_kill();
                    }
                    Interrupt::Redirect { message, priority } => {
                        self.queue_redirect(&message, priority).await;
                    }
                    Interrupt::Pause => signal_child(&child, libc::SIGSTOP),
                    Interrupt::Resume => signal_child(&child, libc::SIGCONT),
                    Interrupt::Rebind { session_key } => {
                        self.rebind(session_key, ctrl_tx, control_sub).await?;
                    }
                },
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if shutdown.load(Ordering::SeqCst) {
                        let _ = child.start_kill();
                    }
                }
            }
        }

        let status = child.wait().await.context("awaiting agent process")?;
        let stderr_output = match stderr_tail {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !stderr_output.trim().is_empty() {
            debug!("agent stderr: {}", stderr_output.trim());
        }

        if terminal.is_none() {
            // The agent died without a terminal record; surface an error
            // result so waiters do not run into their timeout.
            let detail = if stderr_output.trim().is_empty() {
                format!("agent exited with {status} without a result")
            } else {
                format!(
                    "agent exited with {status} without a result: {}",
                    truncated_tail(&stderr_output, 500)
                )
            };
            let result = TurnResult {
                subtype: ResultSubtype::Error,
                result: Some(detail),
                usage: TokenUsage::default(),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                session_id: resume,
            };
            if let Err(err) = self
                .broker
                .publish_result(&self.session_key(), &result)
                .await
            {
                warn!("synthesized result publish failed: {err}");
            }
            terminal = Some(result);
        }

        if let Some(result) = &terminal {
            if let Some(id) = &result.session_id {
                *self.agent_session_id.write().expect("id lock") = Some(id.clone());
            }
        }
        self.turn_count.fetch_add(1, Ordering::SeqCst);
        self.set_status(ContainerStatus::Idle);
        self.publish_state().await;
        Ok(())
    }

    async fn dispatch_message(&self, message: AgentMessage, terminal: &mut Option<TurnResult>) {
        let session = self.session_key();
        match message {
            AgentMessage::Result(result) => {
                if let Err(err) = self.broker.publish_result(&session, &result).await {
                    warn!("result publish failed: {err}");
                }
                *terminal = Some(result);
            }
            other => {
                if let Err(err) = self.broker.publish_output(&session, &other).await {
                    warn!("output publish failed: {err}");
                }
            }
        }
    }
}

fn truncated_tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim();
    match trimmed.char_indices().nth_back(max.saturating_sub(1)) {
        Some((idx, _)) => &trimmed[idx..],
        None => trimmed,
    }
}

fn spawn_signal_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        flag.store(true, Ordering::SeqCst);
    });
}
