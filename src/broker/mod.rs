//! Session-scoped communication over the Redis broker.
//!
//! Per session the broker carries an input queue (host to container), an
//! output publication with a bounded replay buffer (container to host), a
//! state record refreshed by wrapper heartbeats, a terminal result value,
//! and a control channel backed by a persisted interrupt queue for
//! at-least-once delivery. All keys share a configurable namespace prefix.

mod error;

pub use error::{BrokerError, BrokerResult};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::{debug, warn};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tokio::task::JoinHandle;

use crate::protocol::{AgentMessage, InputRecord, Interrupt, TurnResult};
use crate::registry::ContainerStatus;

/// Replay buffer length per session.
const OUTPUT_BUFFER_MAX: isize = 1000;
/// TTL of the replay buffer and the terminal result, seconds.
const OUTPUT_TTL_SECS: u64 = 3600;
/// TTL of the state record; refreshed on every heartbeat.
const STATE_TTL_SECS: i64 = 60;
/// Poll period of [`SessionBroker::wait_for_result`].
const RESULT_POLL_MS: u64 = 500;

/// Callback invoked for each record on a session's output channel.
pub type OutputCallback = Arc<dyn Fn(AgentMessage) + Send + Sync>;
/// Callback invoked for each record on a session's control channel.
pub type ControlCallback = Arc<dyn Fn(Interrupt) + Send + Sync>;

/// Session key set under one namespace prefix.
#[derive(Debug, Clone)]
struct SessionKeys {
    base: String,
}

impl SessionKeys {
    fn new(prefix: &str, session_key: &str) -> Self {
        Self {
            base: format!("{prefix}{session_key}"),
        }
    }

    fn input(&self) -> String {
        format!("{}:input", self.base)
    }
    fn output(&self) -> String {
        format!("{}:output", self.base)
    }
    fn output_buffer(&self) -> String {
        format!("{}:output_buffer", self.base)
    }
    fn state(&self) -> String {
        format!("{}:state", self.base)
    }
    fn result(&self) -> String {
        format!("{}:result", self.base)
    }
    fn control(&self) -> String {
        format!("{}:control", self.base)
    }
    fn interrupt_queue(&self) -> String {
        format!("{}:interrupt_queue", self.base)
    }

    fn all(&self) -> Vec<String> {
        vec![
            self.input(),
            self.output(),
            self.output_buffer(),
            self.state(),
            self.result(),
            self.control(),
            self.interrupt_queue(),
        ]
    }
}

/// Session state record mirrored from wrapper heartbeats.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub status: ContainerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Resumable agent-session identifier, once the wrapper reports one.
    pub agent_session_id: Option<String>,
    pub turn_count: u32,
}

impl SessionState {
    pub fn idle() -> Self {
        Self {
            status: ContainerStatus::Idle,
            last_heartbeat: Some(Utc::now()),
            agent_session_id: None,
            turn_count: 0,
        }
    }

    pub fn with_status(mut self, status: ContainerStatus) -> Self {
        self.status = status;
        self
    }

    fn from_hash(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            status: fields
                .get("status")
                .and_then(|s| ContainerStatus::parse(s))
                .unwrap_or(ContainerStatus::Idle),
            last_heartbeat: fields.get("last_heartbeat").and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }),
            agent_session_id: fields.get("agent_session_id").cloned(),
            turn_count: fields
                .get("turn_count")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }

    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("status".to_string(), self.status.as_str().to_string()),
            (
                "last_heartbeat".to_string(),
                self.last_heartbeat.unwrap_or_else(Utc::now).to_rfc3339(),
            ),
            ("turn_count".to_string(), self.turn_count.to_string()),
        ];
        if let Some(ref id) = self.agent_session_id {
            pairs.push(("agent_session_id".to_string(), id.clone()));
        }
        pairs
    }
}

/// Live subscription to a session channel. Dropping it (or calling
/// [`OutputSubscription::unsubscribe`]) tears the listener down, so cleanup
/// happens on every exit path.
pub struct OutputSubscription {
    task: Option<JoinHandle<()>>,
}

impl OutputSubscription {
    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Subscription with nothing to tear down.
    pub(crate) fn noop() -> Self {
        Self { task: None }
    }
}

impl Drop for OutputSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Session-scoped queues, publications and records over the broker.
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Push one input record onto the session's input queue.
    async fn send_input(&self, session_key: &str, input: &InputRecord) -> BrokerResult<()>;

    /// Push an input record at the head of the queue (redirects).
    async fn push_input_front(&self, session_key: &str, input: &InputRecord) -> BrokerResult<()>;

    /// Blocking-pop the next input; `None` when `timeout` elapses first.
    async fn pop_input(
        &self,
        session_key: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<InputRecord>>;

    /// Publish an interrupt on the control channel and persist it on the
    /// interrupt queue for at-least-once delivery.
    async fn send_interrupt(&self, session_key: &str, interrupt: &Interrupt) -> BrokerResult<()>;

    /// Drain interrupts that were enqueued while no subscriber listened.
    async fn drain_interrupts(&self, session_key: &str) -> BrokerResult<Vec<Interrupt>>;

    async fn subscribe_output(
        &self,
        session_key: &str,
        callback: OutputCallback,
    ) -> BrokerResult<OutputSubscription>;

    async fn subscribe_control(
        &self,
        session_key: &str,
        callback: ControlCallback,
    ) -> BrokerResult<OutputSubscription>;

    /// Publish one parsed record and append it to the replay buffer.
    async fn publish_output(&self, session_key: &str, message: &AgentMessage) -> BrokerResult<()>;

    /// Store the terminal result and publish it on the output channel.
    async fn publish_result(&self, session_key: &str, result: &TurnResult) -> BrokerResult<()>;

    /// Replay buffer for subscribers that joined after emission.
    async fn get_buffered_output(&self, session_key: &str) -> BrokerResult<Vec<AgentMessage>>;

    async fn get_state(&self, session_key: &str) -> BrokerResult<Option<SessionState>>;

    /// Write the state record, refreshing its TTL.
    async fn update_state(&self, session_key: &str, state: &SessionState) -> BrokerResult<()>;

    async fn get_result(&self, session_key: &str) -> BrokerResult<Option<TurnResult>>;

    /// Poll result and state every 500 ms until a terminal result appears,
    /// the state turns terminal, or `timeout` elapses.
    async fn wait_for_result(
        &self,
        session_key: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<TurnResult>>;

    /// Delete every key of the session.
    async fn clear_session(&self, session_key: &str) -> BrokerResult<()>;

    /// Round-trip latency to the broker.
    async fn ping(&self) -> BrokerResult<Duration>;
}

/// Redis-backed [`SessionBroker`].
///
/// Holds one multiplexed connection for commands and one reserved for
/// blocking pops; each subscription gets its own pub-sub connection.
/// Reconnection is bounded-retry with exponential backoff capped at a few
/// seconds, handled by the connection manager.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    cmd: ConnectionManager,
    blocking: ConnectionManager,
    prefix: String,
}

impl RedisBroker {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> BrokerResult<Self> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(5)
            .set_factor(200)
            .set_exponent_base(2)
            .set_max_delay(3000);
        let cmd = ConnectionManager::new_with_config(client.clone(), config.clone()).await?;
        let blocking = ConnectionManager::new_with_config(client.clone(), config).await?;
        Ok(Self {
            client,
            cmd,
            blocking,
            prefix: prefix.into(),
        })
    }

    fn keys(&self, session_key: &str) -> SessionKeys {
        SessionKeys::new(&self.prefix, session_key)
    }
}

#[async_trait]
impl SessionBroker for RedisBroker {
    async fn send_input(&self, session_key: &str, input: &InputRecord) -> BrokerResult<()> {
        let payload = serde_json::to_string(input)?;
        let mut conn = self.cmd.clone();
        let _: i64 = conn.rpush(self.keys(session_key).input(), payload).await?;
        Ok(())
    }

    async fn push_input_front(&self, session_key: &str, input: &InputRecord) -> BrokerResult<()> {
        let payload = serde_json::to_string(input)?;
        let mut conn = self.cmd.clone();
        let _: i64 = conn.lpush(self.keys(session_key).input(), payload).await?;
        Ok(())
    }

    async fn pop_input(
        &self,
        session_key: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<InputRecord>> {
        let mut conn = self.blocking.clone();
        let popped: Option<(String, String)> = conn
            .blpop(
                self.keys(session_key).input(),
                timeout.as_secs_f64().max(0.1),
            )
            .await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn send_interrupt(&self, session_key: &str, interrupt: &Interrupt) -> BrokerResult<()> {
        let payload = serde_json::to_string(interrupt)?;
        let keys = self.keys(session_key);
        let mut conn = self.cmd.clone();
        let _: i64 = conn.publish(keys.control(), &payload).await?;
        let _: i64 = conn.rpush(keys.interrupt_queue(), &payload).await?;
        Ok(())
    }

    async fn drain_interrupts(&self, session_key: &str) -> BrokerResult<Vec<Interrupt>> {
        let key = self.keys(session_key).interrupt_queue();
        let mut conn = self.cmd.clone();
        let mut out = Vec::new();
        loop {
            let popped: Option<String> = conn.lpop(&key, None).await?;
            let Some(payload) = popped else { break };
            match serde_json::from_str(&payload) {
                Ok(interrupt) => out.push(interrupt),
                Err(err) => warn!("dropping undecodable interrupt for {session_key}: {err}"),
            }
        }
        Ok(out)
    }

    async fn subscribe_output(
        &self,
        session_key: &str,
        callback: OutputCallback,
    ) -> BrokerResult<OutputSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys(session_key).output()).await?;
        let session = session_key.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<serde_json::Value>(&payload) {
                    Ok(value) => {
                        if let Some(message) = AgentMessage::classify(value) {
                            callback(message);
                        }
                    }
                    Err(err) => debug!("dropping undecodable output for {session}: {err}"),
                }
            }
        });
        Ok(OutputSubscription { task: Some(task) })
    }

    async fn subscribe_control(
        &self,
        session_key: &str,
        callback: ControlCallback,
    ) -> BrokerResult<OutputSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys(session_key).control()).await?;
        let session = session_key.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<Interrupt>(&payload) {
                    Ok(interrupt) => callback(interrupt),
                    Err(err) => warn!("ignoring unknown interrupt for {session}: {err}"),
                }
            }
        });
        Ok(OutputSubscription { task: Some(task) })
    }

    async fn publish_output(&self, session_key: &str, message: &AgentMessage) -> BrokerResult<()> {
        let payload = serde_json::to_string(&message.to_value())?;
        let keys = self.keys(session_key);
        let mut conn = self.cmd.clone();
        let _: i64 = conn.publish(keys.output(), &payload).await?;
        let _: i64 = conn.rpush(keys.output_buffer(), &payload).await?;
        let _: () = conn
            .ltrim(keys.output_buffer(), -OUTPUT_BUFFER_MAX, -1)
            .await?;
        let _: bool = conn
            .expire(keys.output_buffer(), OUTPUT_TTL_SECS as i64)
            .await?;
        Ok(())
    }

    async fn publish_result(&self, session_key: &str, result: &TurnResult) -> BrokerResult<()> {
        let keys = self.keys(session_key);
        let payload = serde_json::to_string(result)?;
        let mut conn = self.cmd.clone();
        let _: () = conn.set_ex(keys.result(), payload, OUTPUT_TTL_SECS).await?;
        self.publish_output(session_key, &AgentMessage::Result(result.clone()))
            .await
    }

    async fn get_buffered_output(&self, session_key: &str) -> BrokerResult<Vec<AgentMessage>> {
        let mut conn = self.cmd.clone();
        let items: Vec<String> = conn
            .lrange(self.keys(session_key).output_buffer(), 0, -1)
            .await?;
        Ok(items
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .filter_map(AgentMessage::classify)
            .collect())
    }

    async fn get_state(&self, session_key: &str) -> BrokerResult<Option<SessionState>> {
        let mut conn = self.cmd.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.keys(session_key).state()).await?;
        Ok(SessionState::from_hash(&fields))
    }

    async fn update_state(&self, session_key: &str, state: &SessionState) -> BrokerResult<()> {
        let key = self.keys(session_key).state();
        let mut conn = self.cmd.clone();
        let _: () = conn.hset_multiple(&key, &state.to_pairs()).await?;
        let _: bool = conn.expire(&key, STATE_TTL_SECS).await?;
        Ok(())
    }

    async fn get_result(&self, session_key: &str) -> BrokerResult<Option<TurnResult>> {
        let mut conn = self.cmd.clone();
        let payload: Option<String> = conn.get(self.keys(session_key).result()).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn wait_for_result(
        &self,
        session_key: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<TurnResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.get_result(session_key).await? {
                return Ok(Some(result));
            }
            if let Some(state) = self.get_state(session_key).await? {
                if matches!(
                    state.status,
                    ContainerStatus::Stopped | ContainerStatus::Failed
                ) {
                    debug!(
                        "session {session_key} reached terminal status {} without a result",
                        state.status
                    );
                    return Ok(None);
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(RESULT_POLL_MS)).await;
        }
    }

    async fn clear_session(&self, session_key: &str) -> BrokerResult<()> {
        let mut conn = self.cmd.clone();
        let _: i64 = conn.del(self.keys(session_key).all()).await?;
        Ok(())
    }

    async fn ping(&self) -> BrokerResult<Duration> {
        let started = Instant::now();
        let mut conn = self.cmd.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(started.elapsed())
    }
}
