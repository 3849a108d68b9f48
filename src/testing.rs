//! In-memory fakes of the runtime and broker seams for scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::broker::{
    BrokerResult, ControlCallback, OutputCallback, OutputSubscription, SessionBroker, SessionState,
};
use crate::protocol::{AgentMessage, InputRecord, Interrupt, TurnResult};
use crate::registry::ContainerStatus;
use crate::runtime::{
    ContainerRuntimeApi, CreateContainerArgs, ExecOutput, ListedContainer, LogOptions,
    RuntimeError, RuntimeResult, StateProbe,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub running: bool,
}

/// In-memory container runtime.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    pub unavailable: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn insert_container(&self, name: &str, labels: HashMap<String, String>, running: bool) {
        let id = format!("fid-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                id,
                labels,
                env: HashMap::new(),
                running,
            },
        );
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn image_exists(&self, _image: &str) -> RuntimeResult<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> RuntimeResult<()> {
        Ok(())
    }

    async fn create(&self, args: &CreateContainerArgs) -> RuntimeResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: "create".to_string(),
                message: "injected create failure".to_string(),
            });
        }
        let id = format!("fid-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            args.name.clone(),
            FakeContainer {
                id: id.clone(),
                labels: args.labels.clone(),
                env: args.env.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> RuntimeResult<()> {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> RuntimeResult<()> {
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn inspect_state(&self, name: &str) -> RuntimeResult<StateProbe> {
        Ok(match self.containers.lock().unwrap().get(name) {
            Some(container) => StateProbe {
                exists: true,
                running: container.running,
            },
            None => StateProbe::default(),
        })
    }

    async fn inspect_labels(&self, name: &str) -> RuntimeResult<HashMap<String, String>> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.labels.clone())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn list(&self, label_filter: &str) -> RuntimeResult<Vec<ListedContainer>> {
        let (key, value) = label_filter.split_once('=').unwrap_or((label_filter, ""));
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|(name, c)| ListedContainer {
                id: c.id.clone(),
                name: name.clone(),
                labels: c.labels.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn exec(
        &self,
        _name: &str,
        _argv: &[&str],
        _timeout: Duration,
    ) -> RuntimeResult<ExecOutput> {
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn logs(&self, _name: &str, _opts: &LogOptions) -> RuntimeResult<String> {
        Ok(String::new())
    }
}

#[derive(Default)]
struct FakeSession {
    input: VecDeque<InputRecord>,
    /// Order inputs were handed to pop callers.
    pop_log: Vec<String>,
    interrupts: VecDeque<Interrupt>,
    sent_interrupts: Vec<Interrupt>,
    buffer: Vec<AgentMessage>,
    state: Option<SessionState>,
    result: Option<TurnResult>,
    output_subs: Vec<OutputCallback>,
    control_subs: Vec<ControlCallback>,
}

/// In-memory session broker.
#[derive(Default)]
pub struct FakeBroker {
    sessions: Mutex<HashMap<String, FakeSession>>,
    pub ping_fails: AtomicBool,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(&self, session_key: &str, f: impl FnOnce(&mut FakeSession) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap();
        f(sessions.entry(session_key.to_string()).or_default())
    }

    pub fn pop_log(&self, session_key: &str) -> Vec<String> {
        self.with_session(session_key, |s| s.pop_log.clone())
    }

    pub fn sent_interrupts(&self, session_key: &str) -> Vec<Interrupt> {
        self.with_session(session_key, |s| s.sent_interrupts.clone())
    }

    pub fn set_state(&self, session_key: &str, state: SessionState) {
        self.with_session(session_key, |s| s.state = Some(state));
    }

    pub fn set_state_status(&self, session_key: &str, status: ContainerStatus) {
        self.set_state(
            session_key,
            SessionState::idle().with_status(status),
        );
    }

    /// Wait until an input record is queued, as a wrapper stub would.
    pub async fn await_input(&self, session_key: &str, timeout: Duration) -> Option<InputRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let popped = self.with_session(session_key, |s| s.input.pop_front());
            if let Some(input) = popped {
                return Some(input);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl SessionBroker for FakeBroker {
    async fn send_input(&self, session_key: &str, input: &InputRecord) -> BrokerResult<()> {
        self.with_session(session_key, |s| s.input.push_back(input.clone()));
        Ok(())
    }

    async fn push_input_front(&self, session_key: &str, input: &InputRecord) -> BrokerResult<()> {
        self.with_session(session_key, |s| s.input.push_front(input.clone()));
        Ok(())
    }

    async fn pop_input(
        &self,
        session_key: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<InputRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            let popped = self.with_session(session_key, |s| {
                let popped = s.input.pop_front();
                if let Some(ref input) = popped {
                    s.pop_log.push(input.prompt.clone());
                }
                popped
            });
            if popped.is_some() {
                return Ok(popped);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn send_interrupt(&self, session_key: &str, interrupt: &Interrupt) -> BrokerResult<()> {
        let subs = self.with_session(session_key, |s| {
            s.sent_interrupts.push(interrupt.clone());
            s.interrupts.push_back(interrupt.clone());
            s.control_subs.clone()
        });
        for sub in subs {
            sub(interrupt.clone());
        }
        Ok(())
    }

    async fn drain_interrupts(&self, session_key: &str) -> BrokerResult<Vec<Interrupt>> {
        Ok(self.with_session(session_key, |s| s.interrupts.drain(..).collect()))
    }

    async fn subscribe_output(
        &self,
        session_key: &str,
        callback: OutputCallback,
    ) -> BrokerResult<OutputSubscription> {
        self.with_session(session_key, |s| s.output_subs.push(callback));
        Ok(OutputSubscription::noop())
    }

    async fn subscribe_control(
        &self,
        session_key: &str,
        callback: ControlCallback,
    ) -> BrokerResult<OutputSubscription> {
        self.with_session(session_key, |s| s.control_subs.push(callback));
        Ok(OutputSubscription::noop())
    }

    async fn publish_output(&self, session_key: &str, message: &AgentMessage) -> BrokerResult<()> {
        let subs = self.with_session(session_key, |s| {
            s.buffer.push(message.clone());
            s.output_subs.clone()
        });
        for sub in subs {
            sub(message.clone());
        }
        Ok(())
    }

    async fn publish_result(&self, session_key: &str, result: &TurnResult) -> BrokerResult<()> {
        self.with_session(session_key, |s| s.result = Some(result.clone()));
        self.publish_output(session_key, &AgentMessage::Result(result.clone()))
            .await
    }

    async fn get_buffered_output(&self, session_key: &str) -> BrokerResult<Vec<AgentMessage>> {
        Ok(self.with_session(session_key, |s| s.buffer.clone()))
    }

    async fn get_state(&self, session_key: &str) -> BrokerResult<Option<SessionState>> {
        Ok(self.with_session(session_key, |s| s.state.clone()))
    }

    async fn update_state(&self, session_key: &str, state: &SessionState) -> BrokerResult<()> {
        self.with_session(session_key, |s| s.state = Some(state.clone()));
        Ok(())
    }

    async fn get_result(&self, session_key: &str) -> BrokerResult<Option<TurnResult>> {
        Ok(self.with_session(session_key, |s| s.result.clone()))
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
                    return Ok(None);
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn clear_session(&self, session_key: &str) -> BrokerResult<()> {
        self.sessions.lock().unwrap().remove(session_key);
        Ok(())
    }

    async fn ping(&self) -> BrokerResult<Duration> {
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(redis::RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "injected ping failure",
            ))
            .into());
        }
        Ok(Duration::from_millis(1))
    }
}
