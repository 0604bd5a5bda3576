//! Session management: which sessions exist, who may attach to them, and
//! the live runtime each attached session runs.
//!
//! A session is one event stream plus one sandbox. The [`SessionManager`]
//! keeps the live ones in memory; the stream's persisted log is the source of
//! truth, so a session can always be re-attached after a restart.

mod conversation;
mod settings;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use omni_events::{EventFilter, EventStream, StreamError, session_dir, session_exists};
use omni_protocol::{
    Action, AgentState, Catalog, ConnectionId, Event, EventId, EventSource, FileStore, Observation,
    ProtocolError, SessionId, StoreError,
};
use omni_runtime::{
    BackendFactory, ConfiguredBackendFactory, RepositorySpec, Runtime, RuntimeConfig, RuntimeError,
    RuntimeStatus, ShutdownCoordinator,
};
use omni_sandbox::SandboxConfig;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub use conversation::Conversation;
pub use settings::{SessionMetadata, SettingsStore, UserSettings, settings_filename};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no settings stored for user {0}")]
    SettingsNotFound(String),
    #[error("user {user} may not access session {session_id}")]
    Unauthorized { session_id: SessionId, user: String },
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("not an action: {0}")]
    NotAnAction(String),
    #[error("invalid stored record: {0}")]
    Serialization(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionInit {
    pub user_id: Option<String>,
    /// `owner/name` to clone into the sandbox.
    pub selected_repository: Option<String>,
    pub github_token: Option<String>,
    pub env_vars: BTreeMap<String, String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub session_id: SessionId,
    pub user_id: Option<String>,
}

impl AttachRequest {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            user_id: None,
        }
    }

    pub fn as_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

// ─── Live sessions ─────────────────────────────────────────────────

pub(crate) struct SessionEntry {
    pub(crate) stream: EventStream,
    pub(crate) runtime: Runtime,
    connections: Mutex<usize>,
}

impl SessionEntry {
    async fn acquire(&self) {
        *self.connections.lock().await += 1;
    }

    /// Drops one connection; the last one detaches the runtime off the
    /// caller's task.
    pub(crate) fn release(self: &Arc<Self>, connection_id: &ConnectionId) {
        let entry = self.clone();
        let connection_id = connection_id.clone();
        tokio::spawn(async move {
            let mut connections = entry.connections.lock().await;
            *connections = connections.saturating_sub(1);
            debug!(connection = %connection_id, remaining = *connections, "connection released");
            if *connections == 0 && entry.runtime.status() != RuntimeStatus::Closed {
                if let Err(err) = entry.runtime.detach().await {
                    warn!(
                        session_id = %entry.runtime.session_id(),
                        error = %err,
                        "runtime detach failed"
                    );
                }
            }
        });
    }

    async fn connection_count(&self) -> usize {
        *self.connections.lock().await
    }
}

// ─── Manager ───────────────────────────────────────────────────────

pub struct SessionManagerBuilder {
    store: Arc<dyn FileStore>,
    catalog: Arc<Catalog>,
    sandbox: SandboxConfig,
    runtime: RuntimeConfig,
    backends: Option<Arc<dyn BackendFactory>>,
    require_settings: bool,
    shutdown: ShutdownCoordinator,
}

impl SessionManagerBuilder {
    pub fn catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox = config;
        self
    }

    pub fn runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime = config;
        self
    }

    /// Overrides backend selection, which otherwise follows the sandbox config.
    pub fn backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.backends = Some(factory);
        self
    }

    pub fn require_settings(mut self, require: bool) -> Self {
        self.require_settings = require;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> SessionManager {
        let backends = self.backends.unwrap_or_else(|| {
            Arc::new(ConfiguredBackendFactory::new(self.sandbox.clone(), self.catalog.clone()))
        });
        SessionManager {
            inner: Arc::new(ManagerInner {
                settings: SettingsStore::new(self.store.clone()),
                store: self.store,
                catalog: self.catalog,
                sandbox: self.sandbox,
                runtime: self.runtime,
                backends,
                require_settings: self.require_settings,
                shutdown: self.shutdown,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct ManagerInner {
    store: Arc<dyn FileStore>,
    catalog: Arc<Catalog>,
    sandbox: SandboxConfig,
    runtime: RuntimeConfig,
    backends: Arc<dyn BackendFactory>,
    require_settings: bool,
    shutdown: ShutdownCoordinator,
    settings: SettingsStore,
    sessions: Mutex<HashMap<SessionId, Arc<SessionEntry>>>,
}

/// Process-wide map of session id to live session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn builder(store: Arc<dyn FileStore>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            store,
            catalog: Arc::new(Catalog::standard()),
            sandbox: SandboxConfig::default(),
            runtime: RuntimeConfig::default(),
            backends: None,
            require_settings: false,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    async fn check_settings(
        &self,
        user_id: Option<&str>,
    ) -> Result<Option<UserSettings>, SessionError> {
        let Some(user_id) = user_id else {
            if self.inner.require_settings {
                return Err(SessionError::SettingsNotFound("anonymous".to_owned()));
            }
            return Ok(None);
        };
        let settings = self.inner.settings.load(user_id).await?;
        if settings.is_none() && self.inner.require_settings {
            return Err(SessionError::SettingsNotFound(user_id.to_owned()));
        }
        Ok(settings)
    }

    fn build_runtime(
        &self,
        stream: &EventStream,
        attach: bool,
        env_vars: BTreeMap<String, String>,
        repository: Option<RepositorySpec>,
    ) -> Result<Runtime, SessionError> {
        let backend = self.inner.backends.create(stream.session_id(), attach)?;
        let runtime = Runtime::builder(stream.clone(), backend)
            .sandbox_config(self.inner.sandbox.clone())
            .runtime_config(self.inner.runtime.clone())
            .attach(attach)
            .env_vars(env_vars)
            .repository(repository)
            .cancel_token(self.inner.shutdown.token())
            .build()?;
        self.inner.shutdown.register(&runtime.cleanup_hook());
        Ok(runtime)
    }

    async fn open_stream(&self, session_id: &SessionId) -> Result<EventStream, SessionError> {
        let inner = &self.inner;
        Ok(EventStream::open(session_id.clone(), inner.store.clone(), inner.catalog.clone()).await?)
    }

    /// Starts a new session: metadata, stream, sandbox bootstrap, and the
    /// initial `init` state event. The caller holds the first connection.
    #[instrument(skip(self, init), fields(user = ?init.user_id))]
    pub async fn create_session(&self, init: SessionInit) -> Result<Conversation, SessionError> {
        let settings = self.check_settings(init.user_id.as_deref()).await?;
        let session_id = SessionId::new_uuid();

        let mut metadata = SessionMetadata::new(session_id.clone(), init.user_id.clone());
        metadata.selected_repository = init.selected_repository.clone();
        metadata.title = init.title.clone();
        metadata.save(self.inner.store.as_ref()).await?;

        let stream = self.open_stream(&session_id).await?;
        let mut env_vars = settings.map(|s| s.sandbox_env_vars).unwrap_or_default();
        env_vars.extend(init.env_vars);
        let repository = init.selected_repository.map(|selected_repository| RepositorySpec {
            selected_repository,
            github_token: init.github_token,
        });
        let runtime = self.build_runtime(&stream, false, env_vars, repository)?;
        if let Err(err) = runtime.connect().await {
            let _ = runtime.close().await;
            stream.close();
            return Err(err.into());
        }
        stream
            .append(
                Event::observation(Observation::agent_state_changed(AgentState::Init)),
                EventSource::Environment,
            )
            .await?;

        let entry = Arc::new(SessionEntry {
            stream,
            runtime,
            connections: Mutex::new(1),
        });
        self.inner.sessions.lock().await.insert(session_id.clone(), entry.clone());
        info!(session_id = %session_id, "session created");
        Ok(Conversation::new(entry, init.user_id))
    }

    /// Attaches to an existing session, reconnecting its runtime. `None` when
    /// no history exists for the id.
    #[instrument(
        skip(self, request),
        fields(session_id = %request.session_id, user = ?request.user_id)
    )]
    pub async fn attach(
        &self,
        request: AttachRequest,
    ) -> Result<Option<Conversation>, SessionError> {
        let AttachRequest { session_id, user_id } = request;
        let settings = self.check_settings(user_id.as_deref()).await?;
        if !session_exists(self.inner.store.as_ref(), &session_id).await? {
            return Ok(None);
        }
        self.authorize(&session_id, user_id.as_deref()).await?;

        let entry = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get(&session_id) {
                Some(entry) => entry.clone(),
                None => {
                    let stream = self.open_stream(&session_id).await?;
                    let env_vars = settings.map(|s| s.sandbox_env_vars).unwrap_or_default();
                    let runtime = self.build_runtime(&stream, true, env_vars, None)?;
                    let entry = Arc::new(SessionEntry {
                        stream,
                        runtime,
                        connections: Mutex::new(0),
                    });
                    sessions.insert(session_id.clone(), entry.clone());
                    entry
                }
            }
        };

        entry.acquire().await;
        if entry.runtime.status() != RuntimeStatus::Ready
            && let Err(err) = entry.runtime.connect().await
        {
            entry.release(&ConnectionId::from_string("failed-attach"));
            return Err(err.into());
        }
        debug!("conversation attached");
        Ok(Some(Conversation::new(entry, user_id)))
    }

    /// Releases `conversation`. Never blocks on the runtime.
    pub fn detach(&self, conversation: &Conversation) {
        conversation.detach();
    }

    /// Closes the runtime and stream and removes all persisted data.
    /// Returns whether the session existed.
    #[instrument(skip(self))]
    pub async fn delete_session(
        &self,
        session_id: &SessionId,
        user_id: Option<&str>,
    ) -> Result<bool, SessionError> {
        self.authorize(session_id, user_id).await?;
        let live = self.inner.sessions.lock().await.remove(session_id);
        if let Some(entry) = &live {
            if let Err(err) = entry.runtime.close().await {
                warn!(error = %err, "runtime close failed during delete");
            }
            entry.stream.close();
        }
        let existed = session_exists(self.inner.store.as_ref(), session_id).await?;
        self.inner.store.delete(&session_dir(session_id)).await?;
        info!(existed = existed || live.is_some(), "session deleted");
        Ok(existed || live.is_some())
    }

    /// Stored sessions, newest first, optionally only those `user_id` owns.
    pub async fn list_sessions(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<SessionMetadata>, SessionError> {
        let entries = match self.inner.store.list("sessions/").await {
            Ok(entries) => entries,
            Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut sessions = Vec::new();
        for entry in entries {
            let id = entry.trim_end_matches('/').rsplit('/').next();
            let Some(id) = id.filter(|id| !id.is_empty()) else {
                continue;
            };
            let session_id = SessionId::from_string(id);
            match SessionMetadata::load(self.inner.store.as_ref(), &session_id).await {
                Ok(Some(metadata)) if user_id.is_none() || metadata.owner.as_deref() == user_id => {
                    sessions.push(metadata);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        error = %err,
                        "skipping unreadable session metadata"
                    );
                }
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Fails unless `user_id` may access the session. Sessions without an
    /// owner are open to everyone.
    async fn authorize(
        &self,
        session_id: &SessionId,
        user_id: Option<&str>,
    ) -> Result<(), SessionError> {
        if let Some(metadata) = SessionMetadata::load(self.inner.store.as_ref(), session_id).await?
            && !metadata.allows(user_id)
        {
            return Err(SessionError::Unauthorized {
                session_id: session_id.clone(),
                user: user_id.unwrap_or("anonymous").to_owned(),
            });
        }
        Ok(())
    }

    async fn live(&self, session_id: &SessionId) -> Result<Arc<SessionEntry>, SessionError> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    /// Appends `action` to a live session as a user event.
    pub async fn send_action(
        &self,
        session_id: &SessionId,
        action: Action,
    ) -> Result<EventId, SessionError> {
        let entry = self.live(session_id).await?;
        Ok(entry.stream.append(Event::action(action), EventSource::User).await?)
    }

    /// Records an agent state transition on a live session.
    pub async fn set_agent_state(
        &self,
        session_id: &SessionId,
        state: AgentState,
    ) -> Result<EventId, SessionError> {
        let entry = self.live(session_id).await?;
        Ok(entry
            .stream
            .append(
                Event::observation(Observation::agent_state_changed(state)),
                EventSource::Environment,
            )
            .await?)
    }

    /// Number of attached connections, or `None` if the session is not live.
    pub async fn connection_count(&self, session_id: &SessionId) -> Option<usize> {
        let entry = self.inner.sessions.lock().await.get(session_id).cloned()?;
        Some(entry.connection_count().await)
    }

    pub async fn runtime_status(&self, session_id: &SessionId) -> Option<RuntimeStatus> {
        self.inner.sessions.lock().await.get(session_id).map(|entry| entry.runtime.status())
    }

    /// Persisted events in `start..end` (to the latest when `end` is `None`)
    /// as seen by `user_id`. `None` when the session does not exist.
    pub async fn events(
        &self,
        session_id: &SessionId,
        user_id: Option<&str>,
        start: EventId,
        end: Option<EventId>,
    ) -> Result<Option<Vec<Event>>, SessionError> {
        self.authorize(session_id, user_id).await?;
        let Some(stream) = self.history(session_id).await? else {
            return Ok(None);
        };
        let mut events = Vec::new();
        let mut reader = stream.read_from(start);
        while let Some(event) = futures_util::StreamExt::next(&mut reader).await {
            let event = event?;
            if end.is_some_and(|end| event.id.is_some_and(|id| id >= end)) {
                break;
            }
            events.push(event);
        }
        Ok(Some(events))
    }

    pub async fn search(
        &self,
        session_id: &SessionId,
        user_id: Option<&str>,
        filter: &EventFilter,
        start: EventId,
        limit: usize,
    ) -> Result<Option<Vec<Event>>, SessionError> {
        self.authorize(session_id, user_id).await?;
        let Some(stream) = self.history(session_id).await? else {
            return Ok(None);
        };
        Ok(Some(stream.search(filter, start, limit).await?))
    }

    /// The live stream, or a read-only view of a stored one.
    async fn history(&self, session_id: &SessionId) -> Result<Option<EventStream>, SessionError> {
        if let Some(entry) = self.inner.sessions.lock().await.get(session_id) {
            return Ok(Some(entry.stream.clone()));
        }
        if !session_exists(self.inner.store.as_ref(), session_id).await? {
            return Ok(None);
        }
        let stream = self.open_stream(session_id).await?;
        stream.close();
        Ok(Some(stream))
    }

    /// Closes every live runtime and stream. Persisted history is kept.
    pub async fn shutdown(&self) {
        let live: Vec<_> = self.inner.sessions.lock().await.drain().collect();
        for (session_id, entry) in live {
            if let Err(err) = entry.runtime.close().await {
                warn!(
                    session_id = %session_id,
                    error = %err,
                    "runtime close failed during shutdown"
                );
            }
            entry.stream.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use futures_util::StreamExt;
    use futures_util::stream::BoxStream;
    use omni_events::InMemoryFileStore;
    use omni_protocol::ObservationKind;

    use super::*;

    fn unique_test_root(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("omni-session-{name}-{}", uuid::Uuid::new_v4()))
    }

    fn manager(name: &str) -> (SessionManager, Arc<InMemoryFileStore>) {
        let store = Arc::new(InMemoryFileStore::new());
        let sandbox = SandboxConfig {
            workspace_dir: unique_test_root(name),
            ..SandboxConfig::default()
        };
        let manager = SessionManager::builder(store.clone()).sandbox_config(sandbox).build();
        (manager, store)
    }

    async fn next_event(
        events: &mut BoxStream<'static, Result<Arc<Event>, SessionError>>,
    ) -> Result<Arc<Event>> {
        let item = tokio::time::timeout(Duration::from_secs(10), events.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("feed ended"))?;
        Ok(item?)
    }

    #[tokio::test]
    async fn attach_to_unknown_session_is_none() -> Result<()> {
        let (manager, _) = manager("unknown");
        let attached = manager.attach(AttachRequest::new(SessionId::from_string("nope"))).await?;
        assert!(attached.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn create_run_detach_and_resume() -> Result<()> {
        let (manager, _) = manager("resume");
        let conversation = manager.create_session(SessionInit::default()).await?;
        let session_id = conversation.session_id().clone();

        let mut events = conversation.events(None).await?;
        let init = next_event(&mut events).await?;
        assert_eq!(init.id, Some(0));
        let state = init.as_observation().and_then(Observation::agent_state);
        assert_eq!(state, Some(AgentState::Init));

        let action_id = conversation
            .send(&serde_json::json!({"action": "run", "args": {"command": "echo resumed"}}))
            .await?;
        let echoed = next_event(&mut events).await?;
        assert_eq!(echoed.id, Some(action_id));
        let reply = next_event(&mut events).await?;
        assert_eq!(reply.cause, Some(action_id));
        assert_eq!(
            reply.as_observation().map(|obs| obs.content.trim().to_owned()).as_deref(),
            Some("resumed")
        );
        drop(events);

        conversation.detach();
        conversation.detach();
        let mut status = conversation.runtime().watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|status| *status == RuntimeStatus::Detached),
        )
        .await??;
        assert_eq!(manager.connection_count(&session_id).await, Some(0));

        let resumed = manager
            .attach(AttachRequest::new(session_id.clone()))
            .await?
            .expect("session exists");
        assert_eq!(resumed.runtime().status(), RuntimeStatus::Ready);
        let mut replay = resumed.events(Some(action_id)).await?;
        let first = next_event(&mut replay).await?;
        assert_eq!(first.cause, Some(action_id));

        assert!(manager.delete_session(&session_id, None).await?);
        assert!(manager.attach(AttachRequest::new(session_id)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn short_lived_connection_sees_its_action_answered() -> Result<()> {
        let (manager, _) = manager("short-lived");
        let creator = manager.create_session(SessionInit::default()).await?;
        let session_id = creator.session_id().clone();
        creator.detach();

        let conversation = manager
            .attach(AttachRequest::new(session_id.clone()))
            .await?
            .expect("session exists");
        let action_id = conversation
            .send(&serde_json::json!({"action": "run", "args": {"command": "echo answered"}}))
            .await?;
        let reply = conversation
            .wait_for_observation(action_id, Duration::from_secs(10))
            .await?
            .expect("observation before detach");
        conversation.detach();
        assert_eq!(reply.cause, Some(action_id));
        assert_eq!(
            reply.as_observation().map(|obs| obs.content.trim().to_owned()).as_deref(),
            Some("answered")
        );

        let events = manager.events(&session_id, None, action_id, None).await?.expect("stored");
        assert!(events.iter().any(|event| event.cause == Some(action_id)));

        let again = manager
            .attach(AttachRequest::new(session_id.clone()))
            .await?
            .expect("session exists");
        let replayed = again.wait_for_observation(action_id, Duration::from_secs(1)).await?;
        assert_eq!(replayed.map(|event| event.id), Some(reply.id));
        let unanswered = again
            .wait_for_observation(action_id + 100, Duration::from_millis(50))
            .await?;
        assert!(unanswered.is_none());
        again.detach();
        manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_and_non_action_records_are_rejected() -> Result<()> {
        let (manager, _) = manager("malformed");
        let conversation = manager.create_session(SessionInit::default()).await?;

        let missing = conversation.send(&serde_json::json!({"args": {}})).await.unwrap_err();
        assert!(matches!(missing, SessionError::Protocol(ProtocolError::MalformedEvent(_))));
        let unknown = conversation
            .send(&serde_json::json!({"action": "teleport"}))
            .await
            .unwrap_err();
        assert!(matches!(unknown, SessionError::Protocol(_)));
        let observation = conversation
            .send(&serde_json::json!({"observation": "null", "content": ""}))
            .await
            .unwrap_err();
        assert!(matches!(observation, SessionError::NotAnAction(kind) if kind == "null"));

        conversation.detach();
        manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn replay_defers_state_changes_behind_an_init_marker() -> Result<()> {
        let (manager, _) = manager("replay");
        let conversation = manager.create_session(SessionInit::default()).await?;
        let session_id = conversation.session_id().clone();

        manager.set_agent_state(&session_id, AgentState::Running).await?;
        let action_id = conversation.send_action(Action::message("hello")).await?;
        // Message actions get a null observation; wait for it before the next append.
        let mut live = conversation.events(Some(action_id)).await?;
        let null = next_event(&mut live).await?;
        assert_eq!(null.cause, Some(action_id));
        drop(live);
        let finished = manager.set_agent_state(&session_id, AgentState::Finished).await?;

        let mut replay = conversation.events(Some(0)).await?;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(next_event(&mut replay).await?);
        }
        let states: Vec<_> = seen
            .iter()
            .map(|event| event.as_observation().and_then(Observation::agent_state))
            .collect();
        assert_eq!(seen[0].id, Some(2));
        assert!(seen[1].is_null());
        assert_eq!(states[2], Some(AgentState::Init));
        assert_eq!(seen[2].id, None);
        assert_eq!(states[3], Some(AgentState::Running));
        assert_eq!(states[4], Some(AgentState::Finished));
        assert_eq!(seen[4].id, Some(finished));

        let mut full = conversation.events(None).await?;
        let first = next_event(&mut full).await?;
        assert_eq!(first.id, Some(0));
        let mut ids = vec![first.id];
        for _ in 0..4 {
            ids.push(next_event(&mut full).await?.id);
        }
        assert!(!ids.contains(&None));
        assert_eq!(ids.last().copied().flatten(), Some(finished));
        conversation.detach();
        Ok(())
    }

    #[tokio::test]
    async fn ownership_and_settings_gate_attach() -> Result<()> {
        let store = Arc::new(InMemoryFileStore::new());
        let manager = SessionManager::builder(store.clone())
            .sandbox_config(SandboxConfig {
                workspace_dir: unique_test_root("owner"),
                ..SandboxConfig::default()
            })
            .require_settings(true)
            .build();

        let err = manager
            .create_session(SessionInit {
                user_id: Some("ada".into()),
                ..SessionInit::default()
            })
            .await
            .err()
            .expect("settings are required");
        assert!(matches!(err, SessionError::SettingsNotFound(user) if user == "ada"));

        manager.settings().save("ada", &UserSettings::default()).await?;
        manager.settings().save("bob", &UserSettings::default()).await?;
        let conversation = manager
            .create_session(SessionInit {
                user_id: Some("ada".into()),
                ..SessionInit::default()
            })
            .await?;
        let session_id = conversation.session_id().clone();

        let denied = manager
            .attach(AttachRequest::new(session_id.clone()).as_user("bob"))
            .await
            .err()
            .expect("bob does not own the session");
        assert!(matches!(denied, SessionError::Unauthorized { .. }));

        let second = manager
            .attach(AttachRequest::new(session_id.clone()).as_user("ada"))
            .await?
            .expect("owner may attach");
        assert_eq!(manager.connection_count(&session_id).await, Some(2));

        let listed = manager.list_sessions(Some("ada")).await?;
        assert_eq!(listed.len(), 1);
        assert!(manager.list_sessions(Some("bob")).await?.is_empty());

        for user in [Some("bob"), None] {
            let err = manager
                .events(&session_id, user, 0, None)
                .await
                .err()
                .expect("history is owned");
            assert!(matches!(err, SessionError::Unauthorized { .. }));
            let err = manager
                .search(&session_id, user, &EventFilter::default(), 0, 10)
                .await
                .err()
                .expect("search is owned");
            assert!(matches!(err, SessionError::Unauthorized { .. }));
        }
        let history = manager.events(&session_id, Some("ada"), 0, None).await?.expect("stored");
        assert!(!history.is_empty());
        let err = manager
            .delete_session(&session_id, Some("bob"))
            .await
            .err()
            .expect("bob may not delete");
        assert!(matches!(err, SessionError::Unauthorized { .. }));

        second.detach();
        conversation.detach();
        manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn history_queries_work_without_attaching() -> Result<()> {
        let (manager, store) = manager("history");
        let conversation = manager.create_session(SessionInit::default()).await?;
        let session_id = conversation.session_id().clone();
        let action_id = conversation.send_action(Action::run("echo findme")).await?;
        let mut live = conversation.events(Some(action_id)).await?;
        next_event(&mut live).await?;
        drop(live);
        manager.shutdown().await;

        let restarted = SessionManager::builder(store).build();
        let events = restarted.events(&session_id, None, 0, None).await?.expect("stored");
        assert_eq!(events.len(), 3);
        let filter = EventFilter {
            query: Some("FINDME".into()),
            ..EventFilter::default()
        };
        let found = restarted.search(&session_id, None, &filter, 0, 10).await?.expect("stored");
        assert!(!found.is_empty());
        assert!(found.iter().all(|event| !matches!(
            event.as_observation().map(|obs| &obs.kind),
            Some(ObservationKind::AgentStateChanged(_))
        )));
        let missing = SessionId::from_string("missing");
        assert!(restarted.events(&missing, None, 0, None).await?.is_none());
        Ok(())
    }
}
