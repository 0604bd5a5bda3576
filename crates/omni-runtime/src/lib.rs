//! The per-session action runtime.
//!
//! A [`Runtime`] subscribes to one session's [`EventStream`], turns every
//! action it sees into exactly one observation by dispatching it onto a
//! [`SandboxBackend`], and appends that observation back with `cause` set to
//! the action's id. Bootstrap (environment, plugins, repository checkout,
//! microagents) runs once per runtime inside [`Runtime::connect`].

pub mod bootstrap;
pub mod config;
pub mod handlers;
pub mod plugins;
pub mod shutdown;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use omni_events::{EventHandler, EventStream, StreamError};
use omni_protocol::{
    Action, ActionType, Catalog, ConfirmationState, Event, EventSource, Observation,
    ObservationKind, SessionId, SubscriberId,
};
use omni_sandbox::{BackendKind, SandboxBackend, SandboxConfig, SandboxError, create_backend};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use bootstrap::{Microagent, MicroagentKind, RepositorySpec};
pub use config::{AppConfig, ConfigError, FileStoreKind, RuntimeConfig, ServerConfig, load_config};
pub use handlers::{ActionHandler, HandlerTable};
pub use plugins::{PluginSpec, Readiness, ReadinessPolicy};
pub use shutdown::{CleanupHook, ShutdownCoordinator};

pub const STATUS_STARTING_RUNTIME: &str = "STATUS$STARTING_RUNTIME";
pub const STATUS_READY: &str = "STATUS$READY";
pub const STATUS_ERROR_RUNTIME_DISCONNECTED: &str = "STATUS$ERROR_RUNTIME_DISCONNECTED";
pub const TIMEOUT_ERROR_ID: &str = "TIMEOUT";

pub const REJECTED_MESSAGE: &str =
    "Action has been rejected by the user! Waiting for further user input.";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("the {backend} backend has no handler for required action `{action}`")]
    MissingHandler { action: ActionType, backend: BackendKind },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to inject environment variables: {0}")]
    EnvInjection(String),
    #[error("plugin {name} was not ready after {waited_secs}s")]
    PluginNotReady { name: String, waited_secs: u64 },
    #[error("plugin {name} failed to start: {message}")]
    PluginFailed { name: String, message: String },
    #[error("runtime bootstrap cancelled")]
    Cancelled,
    #[error("invalid repository `{0}`, expected owner/name")]
    InvalidRepository(String),
    #[error("runtime for session {0} is closed")]
    Closed(SessionId),
}

// ─── Status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Created,
    Starting,
    Ready,
    /// The backend became unreachable. Actions fail until a reconnect.
    Disconnected,
    /// Released by its last client. Actions queue until a reconnect.
    Detached,
    Closed,
}

impl RuntimeStatus {
    /// Status message id surfaced to clients, where one exists.
    pub fn status_id(&self) -> Option<&'static str> {
        match self {
            Self::Starting => Some(STATUS_STARTING_RUNTIME),
            Self::Ready => Some(STATUS_READY),
            Self::Disconnected => Some(STATUS_ERROR_RUNTIME_DISCONNECTED),
            Self::Created | Self::Detached | Self::Closed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Detached => "detached",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Backend selection ─────────────────────────────────────────────

/// Produces the sandbox backend for a session.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        session_id: &SessionId,
        attach: bool,
    ) -> Result<Arc<dyn SandboxBackend>, RuntimeError>;
}

/// Selects the backend named by [`SandboxConfig::backend`].
pub struct ConfiguredBackendFactory {
    config: SandboxConfig,
    catalog: Arc<Catalog>,
}

impl ConfiguredBackendFactory {
    pub fn new(config: SandboxConfig, catalog: Arc<Catalog>) -> Self {
        Self { config, catalog }
    }
}

impl BackendFactory for ConfiguredBackendFactory {
    fn create(
        &self,
        session_id: &SessionId,
        attach: bool,
    ) -> Result<Arc<dyn SandboxBackend>, RuntimeError> {
        Ok(create_backend(&self.config, session_id, self.catalog.clone(), attach)?)
    }
}

// ─── Runtime ───────────────────────────────────────────────────────

pub struct RuntimeBuilder {
    stream: EventStream,
    backend: Arc<dyn SandboxBackend>,
    sandbox: SandboxConfig,
    runtime: RuntimeConfig,
    attach: bool,
    env_vars: BTreeMap<String, String>,
    repository: Option<RepositorySpec>,
    host_env: Option<BTreeMap<String, String>>,
    cancel: CancellationToken,
}

impl RuntimeBuilder {
    pub fn sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox = config;
        self
    }

    pub fn runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime = config;
        self
    }

    /// Reattach to a sandbox that was bootstrapped by an earlier runtime.
    pub fn attach(mut self, attach: bool) -> Self {
        self.attach = attach;
        self
    }

    /// Variables exported into the sandbox on top of the configured ones.
    pub fn env_vars(mut self, env_vars: BTreeMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn repository(mut self, repository: Option<RepositorySpec>) -> Self {
        self.repository = repository;
        self
    }

    /// Replaces the process environment as the source of prefixed variables.
    pub fn host_env(mut self, host_env: BTreeMap<String, String>) -> Self {
        self.host_env = Some(host_env);
        self
    }

    /// Parent cancellation, normally the process shutdown token.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validates the backend's handlers and subscribes the runtime to the stream.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let handlers = HandlerTable::for_backend(self.backend.as_ref())?;
        let host_env = self.host_env.unwrap_or_else(|| std::env::vars().collect());
        let (status, _) = watch::channel(RuntimeStatus::Created);
        let inner = Arc::new(RuntimeInner {
            session_id: self.stream.session_id().clone(),
            catalog: self.stream.catalog().clone(),
            stream: self.stream,
            backend: self.backend,
            handlers,
            sandbox: self.sandbox,
            runtime: self.runtime,
            attach: self.attach,
            env_vars: self.env_vars,
            repository: self.repository,
            host_env,
            status,
            cancel: self.cancel.child_token(),
            bootstrapped: tokio::sync::Mutex::new(false),
            microagents: Mutex::new(Vec::new()),
        });
        inner
            .stream
            .subscribe(
                SubscriberId::runtime(),
                Arc::new(RuntimeSubscriber(Arc::downgrade(&inner))),
            );
        debug!(
            session_id = %inner.session_id,
            backend = %inner.backend.kind(),
            "runtime subscribed"
        );
        Ok(Runtime { inner })
    }
}

struct RuntimeInner {
    session_id: SessionId,
    catalog: Arc<Catalog>,
    stream: EventStream,
    backend: Arc<dyn SandboxBackend>,
    handlers: HandlerTable,
    sandbox: SandboxConfig,
    runtime: RuntimeConfig,
    attach: bool,
    env_vars: BTreeMap<String, String>,
    repository: Option<RepositorySpec>,
    host_env: BTreeMap<String, String>,
    status: watch::Sender<RuntimeStatus>,
    cancel: CancellationToken,
    bootstrapped: tokio::sync::Mutex<bool>,
    microagents: Mutex<Vec<Microagent>>,
}

/// Owns one session's sandbox and executes the actions appended to its stream.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("session_id", &self.inner.session_id)
            .field("backend", &self.inner.backend.kind())
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl Runtime {
    pub fn builder(stream: EventStream, backend: Arc<dyn SandboxBackend>) -> RuntimeBuilder {
        RuntimeBuilder {
            stream,
            backend,
            sandbox: SandboxConfig::default(),
            runtime: RuntimeConfig::default(),
            attach: false,
            env_vars: BTreeMap::new(),
            repository: None,
            host_env: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn stream(&self) -> &EventStream {
        &self.inner.stream
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RuntimeStatus> {
        self.inner.status.subscribe()
    }

    /// Microagents found during bootstrap.
    pub fn microagents(&self) -> Vec<Microagent> {
        self.inner.microagents.lock().clone()
    }

    /// Connects the backend and, on first success, runs bootstrap. Also the
    /// way back from `Detached` or `Disconnected`.
    #[instrument(
        skip(self),
        fields(session_id = %self.inner.session_id, backend = %self.inner.backend.kind())
    )]
    pub async fn connect(&self) -> Result<(), RuntimeError> {
        let inner = &self.inner;
        if self.status() == RuntimeStatus::Closed {
            return Err(RuntimeError::Closed(inner.session_id.clone()));
        }
        inner.set_status(RuntimeStatus::Starting);

        if let Err(err) = inner.backend.connect(&inner.cancel).await {
            inner.set_status(RuntimeStatus::Disconnected);
            return Err(match err {
                SandboxError::Cancelled => RuntimeError::Cancelled,
                other => other.into(),
            });
        }

        let mut bootstrapped = inner.bootstrapped.lock().await;
        if !*bootstrapped {
            if let Err(err) = inner.bootstrap().await {
                warn!(error = %err, "runtime bootstrap failed");
                inner.set_status(RuntimeStatus::Disconnected);
                return Err(err);
            }
            *bootstrapped = true;
        }
        drop(bootstrapped);

        inner.set_status(RuntimeStatus::Ready);
        info!("runtime ready");
        Ok(())
    }

    /// Executes `action` against the backend without touching the stream.
    pub async fn run_action(&self, action: &Action) -> Observation {
        self.inner.run_action(action).await
    }

    /// Releases the backend connection and leaves the sandbox running.
    #[instrument(skip(self), fields(session_id = %self.inner.session_id))]
    pub async fn detach(&self) -> Result<(), RuntimeError> {
        let previous = self.inner.status.send_replace(RuntimeStatus::Detached);
        if previous == RuntimeStatus::Closed {
            self.inner.set_status(RuntimeStatus::Closed);
            return Ok(());
        }
        self.inner.backend.detach().await?;
        debug!("runtime detached");
        Ok(())
    }

    /// Unsubscribes from the stream and tears the sandbox down. Idempotent.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        self.inner.close().await
    }

    pub async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> Result<(), RuntimeError> {
        Ok(self.inner.backend.copy_to(host_src, sandbox_dest, recursive).await?)
    }

    pub async fn copy_from(&self, sandbox_path: &str) -> Result<PathBuf, RuntimeError> {
        Ok(self.inner.backend.copy_from(sandbox_path).await?)
    }

    pub async fn list_files(&self, path: Option<&str>) -> Result<Vec<String>, RuntimeError> {
        Ok(self.inner.backend.list_files(path).await?)
    }

    /// Hook closing this runtime at process exit. Registered weakly, so it
    /// does not keep the runtime alive.
    pub fn cleanup_hook(&self) -> Arc<dyn CleanupHook> {
        self.inner.clone()
    }
}

impl RuntimeInner {
    fn set_status(&self, status: RuntimeStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(
                session_id = %self.session_id,
                from = %previous,
                to = %status,
                "runtime status changed"
            );
        }
    }

    /// Waits out `Created`, `Starting` and `Detached`.
    async fn usable_status(&self) -> RuntimeStatus {
        let mut receiver = self.status.subscribe();
        loop {
            let status = *receiver.borrow_and_update();
            if matches!(
                status,
                RuntimeStatus::Ready | RuntimeStatus::Disconnected | RuntimeStatus::Closed
            ) {
                return status;
            }
            if receiver.changed().await.is_err() {
                return RuntimeStatus::Closed;
            }
        }
    }

    async fn bootstrap(&self) -> Result<(), RuntimeError> {
        let timeout = self.sandbox.default_timeout();
        if !self.attach {
            let mut vars = bootstrap::prefixed_env(&self.runtime.env_prefix, self.host_env.clone());
            vars.extend(self.sandbox.runtime_startup_env_vars.clone());
            vars.extend(self.env_vars.clone());
            let code_cells =
                self.wants_plugin("jupyter") && self.backend.supports(ActionType::RunIpython);
            bootstrap::inject_env(self.backend.as_ref(), &vars, code_cells, timeout).await?;

            let policy = ReadinessPolicy {
                timeout: Duration::from_secs(self.runtime.plugin_ready_timeout_secs),
                interval: Duration::from_millis(self.runtime.plugin_poll_interval_ms.max(10)),
            };
            for name in &self.runtime.plugins {
                let Some(plugin) = PluginSpec::builtin(name, self.session_id.as_str()) else {
                    warn!(plugin = %name, "unknown plugin skipped");
                    continue;
                };
                plugins::start_plugin(self.backend.as_ref(), &plugin, policy, &self.cancel).await?;
            }

            if let Some(repository) = &self.repository {
                let command = repository.clone_command(&bootstrap::workspace_branch_name())?;
                let observation = self.run_action(&Action::run(command)).await;
                match &observation.kind {
                    ObservationKind::CommandOutput(output) if output.exit_code == 0 => {
                        info!(repository = %repository.selected_repository, "repository cloned");
                    }
                    _ => warn!(
                        repository = %repository.selected_repository,
                        output = %observation.content,
                        "repository clone did not succeed"
                    ),
                }
            }
        }

        let repo_dir = self.repository.as_ref().and_then(|repository| repository.directory().ok());
        let prefix = &self.runtime.microagent_prefix;
        let found = bootstrap::discover_microagents(self.backend.as_ref(), prefix, repo_dir).await;
        *self.microagents.lock() = found;
        Ok(())
    }

    fn wants_plugin(&self, name: &str) -> bool {
        self.runtime.plugins.iter().any(|plugin| plugin.eq_ignore_ascii_case(name))
    }

    /// The per-action state machine. Never fails: every outcome is an
    /// observation.
    async fn run_action(&self, action: &Action) -> Observation {
        let action_type = action.action_type();
        if !action.runnable() {
            return Observation::null();
        }
        match action.confirmation_state {
            ConfirmationState::AwaitingConfirmation => return Observation::null(),
            ConfirmationState::Rejected => return Observation::user_reject(REJECTED_MESSAGE),
            ConfirmationState::Confirmed => {}
        }
        if !self.catalog.contains_action(action_type) {
            return Observation::error(format!("Action {action_type} does not exist."));
        }
        let Some(handler) = self.handlers.get(action_type) else {
            return Observation::error(format!(
                "Action {action_type} is not supported in the current runtime."
            ));
        };

        let timeout = action
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.sandbox.default_timeout());
        let pending = handler(self.backend.as_ref(), action, timeout);
        let outcome = match tokio::time::timeout(timeout, pending).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SandboxError::Timeout(timeout)),
        };
        match outcome {
            Ok(observation) => observation,
            Err(err @ SandboxError::Timeout(_)) => {
                Observation::error_with_id(err.to_string(), TIMEOUT_ERROR_ID)
            }
            Err(err @ SandboxError::Disconnected(_)) => {
                warn!(session_id = %self.session_id, error = %err, "sandbox disconnected");
                self.set_status(RuntimeStatus::Disconnected);
                Observation::error_with_id(err.to_string(), STATUS_ERROR_RUNTIME_DISCONNECTED)
            }
            Err(err) => {
                debug!(action = %action_type, error = %err, "action handler failed");
                Observation::error(err.to_string())
            }
        }
    }

    #[instrument(skip(self, event), fields(session_id = %self.session_id, event_id = ?event.id))]
    async fn handle_event(&self, event: &Event) {
        let Some(action) = event.as_action() else {
            return;
        };
        let observation = match self.usable_status().await {
            RuntimeStatus::Ready => self.run_action(action).await,
            RuntimeStatus::Disconnected if action.runnable() => Observation::error_with_id(
                format!("Runtime for session {} is disconnected.", self.session_id),
                STATUS_ERROR_RUNTIME_DISCONNECTED,
            ),
            RuntimeStatus::Disconnected => Observation::null(),
            _ => {
                debug!("runtime closed, action not executed");
                return;
            }
        };

        let mut reply = Event::observation(observation)
            .with_tool_call_metadata(event.tool_call_metadata.clone());
        if let Some(id) = event.id {
            reply = reply.with_cause(id);
        }
        let source = event.source.unwrap_or(EventSource::Agent);
        if let Err(err) = self.stream.append(reply, source).await {
            warn!(error = %err, "failed to append observation");
        }
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        if self.status.send_replace(RuntimeStatus::Closed) == RuntimeStatus::Closed {
            return Ok(());
        }
        self.cancel.cancel();
        self.stream.unsubscribe(&SubscriberId::runtime());
        self.backend.close().await?;
        info!(session_id = %self.session_id, "runtime closed");
        Ok(())
    }
}

#[async_trait]
impl CleanupHook for RuntimeInner {
    fn name(&self) -> String {
        format!("runtime:{}", self.session_id)
    }

    async fn cleanup(&self) {
        if let Err(err) = self.close().await {
            warn!(session_id = %self.session_id, error = %err, "runtime cleanup failed");
        }
    }
}

struct RuntimeSubscriber(Weak<RuntimeInner>);

#[async_trait]
impl EventHandler for RuntimeSubscriber {
    async fn on_event(&self, event: Arc<Event>) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_event(&event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use anyhow::Result;
    use futures_util::StreamExt;
    use omni_events::InMemoryFileStore;
    use omni_protocol::{ConfirmationState, EventId, ToolCallMetadata};
    use omni_sandbox::LocalBackend;

    use super::*;
    use crate::testing::MemoryBackend;

    async fn open_stream(session: &str, catalog: Catalog) -> Result<EventStream> {
        Ok(EventStream::open(
            SessionId::from_string(session),
            Arc::new(InMemoryFileStore::new()),
            Arc::new(catalog),
        )
        .await?)
    }

    async fn ready_runtime(
        stream: &EventStream,
        backend: Arc<dyn SandboxBackend>,
    ) -> Result<Runtime> {
        let runtime = Runtime::builder(stream.clone(), backend)
            .host_env(BTreeMap::new())
            .build()?;
        runtime.connect().await?;
        Ok(runtime)
    }

    /// Polls until the stream holds `count` events.
    async fn wait_for_events(stream: &EventStream, count: u64) -> Result<Vec<Event>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while stream.latest_event_id().await.map_or(0, |id| id + 1) < count {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} events"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events: Vec<Event> = stream
            .read_from(0)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;
        Ok(events)
    }

    fn observation_for(events: &[Event], cause: EventId) -> Option<&Event> {
        events.iter().find(|event| event.cause == Some(cause))
    }

    fn unique_test_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("omni-runtime-{name}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn shell_command_round_trip_through_the_stream() -> Result<()> {
        let stream = open_stream("echo", Catalog::standard()).await?;
        let config = SandboxConfig {
            workspace_dir: unique_test_root("echo"),
            ..SandboxConfig::default()
        };
        let backend = Arc::new(LocalBackend::new(&config, stream.session_id()));
        let runtime = Runtime::builder(stream.clone(), backend)
            .sandbox_config(config)
            .host_env(BTreeMap::new())
            .build()?;
        runtime.connect().await?;
        assert_eq!(runtime.status(), RuntimeStatus::Ready);

        let metadata = ToolCallMetadata {
            function_name: "execute_bash".into(),
            tool_call_id: "call-1".into(),
            total_calls_in_response: 1,
        };
        let action_id = stream
            .append(
                Event::action(Action::run("echo hi"))
                    .with_tool_call_metadata(Some(metadata.clone())),
                EventSource::Agent,
            )
            .await?;
        let events = wait_for_events(&stream, 2).await?;
        let reply = observation_for(&events, action_id).expect("observation appended");
        assert_eq!(reply.id, Some(action_id + 1));
        assert_eq!(reply.source, Some(EventSource::Agent));
        assert_eq!(reply.tool_call_metadata.as_ref(), Some(&metadata));
        let observation = reply.as_observation().expect("an observation");
        let ObservationKind::CommandOutput(output) = &observation.kind else {
            panic!("expected command output, got {observation:?}");
        };
        assert_eq!(output.exit_code, 0);
        assert_eq!(observation.content.trim(), "hi");
        runtime.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn shell_exit_and_binary_output_keep_the_local_runtime_ready() -> Result<()> {
        let stream = open_stream("shell-exit", Catalog::standard()).await?;
        let config = SandboxConfig {
            workspace_dir: unique_test_root("shell-exit"),
            ..SandboxConfig::default()
        };
        let backend = Arc::new(LocalBackend::new(&config, stream.session_id()));
        let runtime = ready_runtime(&stream, backend).await?;

        let exited = runtime.run_action(&Action::run("exit 3")).await;
        let ObservationKind::CommandOutput(output) = &exited.kind else {
            panic!("expected command output, got {exited:?}");
        };
        assert_eq!(output.exit_code, 3);
        assert_eq!(runtime.status(), RuntimeStatus::Ready);

        let binary = runtime.run_action(&Action::run("printf '\\377\\376\\n'")).await;
        assert!(matches!(binary.kind, ObservationKind::CommandOutput(_)));
        assert!(binary.content.contains('\u{FFFD}'));
        assert_eq!(runtime.status(), RuntimeStatus::Ready);

        let after = runtime.run_action(&Action::run("echo ok")).await;
        assert_eq!(after.content.trim(), "ok");

        let cell = runtime.run_action(&Action::run_code("print(1)")).await;
        assert!(cell.is_error());
        assert_eq!(cell.content, "Action run_ipython is not supported in the current runtime.");
        runtime.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_sessions_stay_isolated_and_ordered() -> Result<()> {
        let mut tasks = Vec::new();
        for session in ["alpha", "beta"] {
            tasks.push(tokio::spawn(async move {
                let stream = open_stream(session, Catalog::standard()).await?;
                let runtime = ready_runtime(&stream, Arc::new(MemoryBackend::new())).await?;
                for i in 0..100 {
                    stream
                        .append(
                            Event::action(Action::run(format!("echo {session}-{i}"))),
                            EventSource::Agent,
                        )
                        .await?;
                }
                let events = wait_for_events(&stream, 200).await?;
                runtime.close().await?;
                anyhow::Ok((session, events))
            }));
        }

        for task in tasks {
            let (session, events) = task.await??;
            assert_eq!(events.len(), 200);
            let ids: Vec<_> = events.iter().filter_map(|event| event.id).collect();
            assert_eq!(ids, (0..200).collect::<Vec<_>>());

            let causes: Vec<EventId> = events.iter().filter_map(|event| event.cause).collect();
            assert_eq!(causes.len(), 100);
            assert!(causes.windows(2).all(|pair| pair[0] < pair[1]));
            for event in &events {
                if let Some(action) = event.as_action() {
                    assert!(action.message_text().contains(session));
                    let reply = observation_for(&events, event.id.unwrap_or_default())
                        .expect("one reply per action");
                    assert!(reply.id > event.id);
                    let content = reply.as_observation().map(|obs| obs.content.as_str());
                    assert!(content.is_some_and(|content| content.starts_with(session)));
                }
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn confirmation_gate_parks_then_executes_on_resubmit() -> Result<()> {
        let stream = open_stream("confirm", Catalog::standard()).await?;
        let backend = Arc::new(MemoryBackend::new());
        let runtime = ready_runtime(&stream, backend.clone()).await?;

        let parked = Action::run("echo parked")
            .with_confirmation_state(ConfirmationState::AwaitingConfirmation);
        let parked_id = stream.append(Event::action(parked.clone()), EventSource::Agent).await?;
        let rejected = Action::run("echo no").with_confirmation_state(ConfirmationState::Rejected);
        let rejected_id = stream.append(Event::action(rejected), EventSource::Agent).await?;
        let events = wait_for_events(&stream, 4).await?;

        assert!(observation_for(&events, parked_id).is_some_and(Event::is_null));
        let reject = observation_for(&events, rejected_id)
            .and_then(Event::as_observation)
            .expect("reject observation");
        assert_eq!(reject.kind, ObservationKind::UserReject);
        assert_eq!(reject.content, REJECTED_MESSAGE);
        assert!(backend.commands().is_empty());

        let resubmitted = stream
            .append(Event::action(parked.confirmed()), EventSource::User)
            .await?;
        let events = wait_for_events(&stream, 6).await?;
        let reply = observation_for(&events, resubmitted).expect("executed");
        assert_eq!(reply.source, Some(EventSource::User));
        assert_eq!(reply.as_observation().map(|obs| obs.content.as_str()), Some("parked"));
        assert_eq!(backend.commands(), vec!["echo parked".to_owned()]);
        runtime.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_unsupported_actions_become_errors() -> Result<()> {
        let catalog = Catalog::standard().without_action(ActionType::Read);
        let stream = open_stream("unknown", catalog).await?;
        let runtime = ready_runtime(&stream, Arc::new(MemoryBackend::new())).await?;

        let unknown = runtime.run_action(&Action::read("a.txt")).await;
        assert!(unknown.is_error());
        assert_eq!(unknown.content, "Action read does not exist.");

        let unsupported = runtime
            .run_action(&Action::new(omni_protocol::ActionKind::BrowseUrl(omni_protocol::BrowseUrl {
                url: "https://example.com".into(),
            })))
            .await;
        assert!(unsupported.is_error());
        assert_eq!(unsupported.content, "Action browse is not supported in the current runtime.");

        let message = runtime.run_action(&Action::message("hello")).await;
        assert_eq!(message.kind, ObservationKind::Null);

        runtime.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn handler_failures_are_isolated_and_disconnect_is_surfaced() -> Result<()> {
        let stream = open_stream("failures", Catalog::standard()).await?;
        let runtime = ready_runtime(&stream, Arc::new(MemoryBackend::new())).await?;
        let mut status = runtime.watch_status();

        let missing = runtime.run_action(&Action::read("nope.txt")).await;
        assert_eq!(missing.content, "File not found: nope.txt");

        let slow = runtime.run_action(&Action::run("hang").with_timeout(1)).await;
        assert!(
            matches!(&slow.kind, ObservationKind::Error(err) if err.error_id == TIMEOUT_ERROR_ID)
        );
        assert_eq!(runtime.status(), RuntimeStatus::Ready);

        let action_id = stream
            .append(Event::action(Action::run("disconnect")), EventSource::Agent)
            .await?;
        let events = wait_for_events(&stream, 2).await?;
        let reply = observation_for(&events, action_id)
            .and_then(Event::as_observation)
            .expect("disconnect observation");
        assert!(
            matches!(
                &reply.kind,
                ObservationKind::Error(err) if err.error_id == STATUS_ERROR_RUNTIME_DISCONNECTED
            )
        );
        status.wait_for(|status| *status == RuntimeStatus::Disconnected).await?;

        let next = stream
            .append(Event::action(Action::run("echo later")), EventSource::Agent)
            .await?;
        let events = wait_for_events(&stream, 4).await?;
        let refused = observation_for(&events, next)
            .and_then(Event::as_observation)
            .expect("refused");
        assert!(refused.is_error());

        runtime.connect().await?;
        assert_eq!(runtime.status(), RuntimeStatus::Ready);
        runtime.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn actions_queue_until_the_runtime_is_ready() -> Result<()> {
        let stream = open_stream("queued", Catalog::standard()).await?;
        let backend = Arc::new(MemoryBackend::new());
        let runtime = Runtime::builder(stream.clone(), backend.clone())
            .host_env(BTreeMap::new())
            .build()?;
        let action_id = stream
            .append(Event::action(Action::run("echo early")), EventSource::Agent)
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.latest_event_id().await, Some(action_id));

        runtime.connect().await?;
        let events = wait_for_events(&stream, 2).await?;
        assert!(observation_for(&events, action_id).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn bootstrap_exports_env_and_runs_once() -> Result<()> {
        let stream = open_stream("bootstrap", Catalog::standard()).await?;
        let backend = Arc::new(MemoryBackend::new());
        backend.put(".omninexus/microagents/repo.md", "be careful");
        let runtime = Runtime::builder(stream.clone(), backend.clone())
            .host_env(BTreeMap::from([
                ("SANDBOX_ENV_TOKEN".to_owned(), "abc".to_owned()),
                ("PATH".to_owned(), "/bin".to_owned()),
            ]))
            .env_vars(BTreeMap::from([("EXTRA".to_owned(), "1".to_owned())]))
            .build()?;
        runtime.connect().await?;
        runtime.detach().await?;
        assert_eq!(runtime.status(), RuntimeStatus::Detached);
        runtime.connect().await?;

        assert_eq!(backend.commands(), vec!["export EXTRA='1'; export TOKEN='abc';".to_owned()]);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
        let agents = runtime.microagents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].kind, MicroagentKind::Repo);

        runtime.close().await?;
        runtime.close().await?;
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(runtime.connect().await, Err(RuntimeError::Closed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_hook_closes_the_runtime() -> Result<()> {
        let stream = open_stream("hook", Catalog::standard()).await?;
        let backend = Arc::new(MemoryBackend::new());
        let runtime = ready_runtime(&stream, backend.clone()).await?;
        let coordinator = ShutdownCoordinator::new();
        coordinator.register(&runtime.cleanup_hook());
        coordinator.shutdown().await;
        assert_eq!(runtime.status(), RuntimeStatus::Closed);
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
        assert!(!stream.subscriber_ids().contains(&SubscriberId::runtime()));
        Ok(())
    }
}
