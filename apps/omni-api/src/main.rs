use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use clap::Parser;
use futures_util::{Stream, StreamExt};
use omni_events::{EventFilter, InMemoryFileStore, LocalFileStore, MAX_SEARCH_LIMIT};
use omni_protocol::{Catalog, Event, EventId, EventSource, FileStore, SessionId};
use omni_runtime::{AppConfig, FileStoreKind, ShutdownCoordinator, load_config};
use omni_session::{
    AttachRequest, Conversation, SessionError, SessionInit, SessionManager, SessionMetadata,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USER_HEADER: &str = "x-user-id";
/// Slack on top of the sandbox timeout while a POST waits for its observation.
const ACTION_WAIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "omni-api")]
#[command(about = "HTTP and SSE transport for OmniNexus sessions")]
struct Cli {
    /// Configuration file; defaults to ./omninexus.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `[server] listen`.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    log_json: bool,
}

#[derive(Clone)]
struct AppState {
    manager: SessionManager,
    catalog: Arc<Catalog>,
    /// How long `POST /actions` holds its connection for the observation.
    action_wait: Duration,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(session_id: &SessionId) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("session {session_id} not found"),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        let status = match &error {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            SessionError::SettingsNotFound(_) => StatusCode::UNAUTHORIZED,
            SessionError::NotAnAction(_) | SessionError::Protocol(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateSessionRequest {
    selected_repository: Option<String>,
    github_token: Option<String>,
    env_vars: BTreeMap<String, String>,
    title: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: SessionId,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ActionAccepted {
    session_id: SessionId,
    event_id: EventId,
    /// The resulting observation, absent when it did not arrive in time.
    #[serde(skip_serializing_if = "Option::is_none")]
    observation: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    start_id: EventId,
    end_id: Option<EventId>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    query: Option<String>,
    event_type: Option<String>,
    source: Option<EventSource>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    start_id: EventId,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    latest_event_id: Option<EventId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    let shutdown = ShutdownCoordinator::new();
    let catalog = Arc::new(Catalog::standard());
    let manager = SessionManager::builder(open_store(&config))
        .catalog(catalog.clone())
        .sandbox_config(config.sandbox.clone())
        .runtime_config(config.runtime.clone())
        .require_settings(config.server.require_settings)
        .shutdown(shutdown.clone())
        .build();

    let state = AppState {
        manager: manager.clone(),
        catalog,
        action_wait: config.sandbox.default_timeout() + ACTION_WAIT_GRACE,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    info!(
        listen = %config.server.listen,
        backend = %config.sandbox.backend,
        "omni-api listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(ShutdownCoordinator::wait_for_signal())
        .await
        .context("server error")?;

    info!("shutting down sessions");
    shutdown.shutdown().await;
    manager.shutdown().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn open_store(config: &AppConfig) -> Arc<dyn FileStore> {
    match config.file_store {
        FileStoreKind::Local => Arc::new(LocalFileStore::new(config.file_store_path.clone())),
        FileStoreKind::Memory => Arc::new(InMemoryFileStore::new()),
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{session_id}", delete(delete_session))
        .route("/sessions/{session_id}/actions", post(post_action))
        .route("/sessions/{session_id}/events", get(list_events))
        .route("/sessions/{session_id}/events/search", get(search_events))
        .route("/sessions/{session_id}/events/stream", get(stream_events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "omni-api" }))
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<(StatusCode, Json<CreateSessionResponse>)> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let conversation = state
        .manager
        .create_session(SessionInit {
            user_id: user_id(&headers),
            selected_repository: request.selected_repository,
            github_token: request.github_token,
            env_vars: request.env_vars,
            title: request.title,
        })
        .await?;
    let session_id = conversation.session_id().clone();
    let status = conversation.runtime().status().as_str();
    // The creating request holds no feed; clients attach through the stream route.
    conversation.detach();
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session_id, status })))
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<SessionMetadata>>> {
    let user = user_id(&headers);
    Ok(Json(state.manager.list_sessions(user.as_deref()).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let session_id = SessionId::from_string(session_id);
    let user = user_id(&headers);
    if state.manager.delete_session(&session_id, user.as_deref()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(&session_id))
    }
}

async fn post_action(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(record): Json<Value>,
) -> ApiResult<(StatusCode, Json<ActionAccepted>)> {
    let session_id = SessionId::from_string(session_id);
    let conversation = attach(&state, &session_id, &headers).await?;
    // The connection stays open until the action is answered, so the runtime
    // is not detached with the action still queued.
    let answered = match conversation.send(&record).await {
        Ok(event_id) => conversation
            .wait_for_observation(event_id, state.action_wait)
            .await
            .map(|reply| (event_id, reply)),
        Err(error) => Err(error),
    };
    conversation.detach();
    let (event_id, reply) = answered?;
    let observation = reply
        .map(|event| state.catalog.encode(&event))
        .transpose()
        .map_err(|error| ApiError::internal(format!("failed to encode event: {error}")))?;
    let status = if observation.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(ActionAccepted {
            session_id,
            event_id,
            observation,
        }),
    ))
}

async fn list_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    let session_id = SessionId::from_string(session_id);
    let user = user_id(&headers);
    let events = state
        .manager
        .events(&session_id, user.as_deref(), query.start_id, query.end_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&session_id))?;
    encode_all(&state.catalog, &events).map(Json)
}

async fn search_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SearchQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    if !(1..=MAX_SEARCH_LIMIT).contains(&query.limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_SEARCH_LIMIT}"
        )));
    }
    let session_id = SessionId::from_string(session_id);
    let filter = EventFilter {
        query: query.query,
        event_type: query.event_type,
        source: query.source,
        start_date: query.start_date,
        end_date: query.end_date,
    };
    let user = user_id(&headers);
    let events = state
        .manager
        .search(&session_id, user.as_deref(), &filter, query.start_id, query.limit)
        .await?
        .ok_or_else(|| ApiError::not_found(&session_id))?;
    encode_all(&state.catalog, &events).map(Json)
}

async fn stream_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let session_id = SessionId::from_string(session_id);
    let conversation = attach(&state, &session_id, &headers).await?;
    let feed = match conversation.events(query.latest_event_id).await {
        Ok(feed) => feed,
        Err(error) => {
            conversation.detach();
            return Err(error.into());
        }
    };
    info!(
        session_id = %session_id,
        connection = %conversation.connection_id(),
        latest_event_id = ?query.latest_event_id,
        "sse client attached"
    );

    let catalog = state.catalog.clone();
    let guard = DetachOnDrop(conversation);
    let stream = async_stream::stream! {
        let _guard = guard;
        let mut feed = feed;
        while let Some(item) = feed.next().await {
            match item {
                Ok(event) => yield Ok(as_sse_event(&catalog, &event)),
                Err(error) => {
                    warn!(error = %error, "event feed failed");
                    yield Ok(SseEvent::default()
                        .event("error")
                        .data(json!({ "error": error.to_string() }).to_string()));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

async fn attach(
    state: &AppState,
    session_id: &SessionId,
    headers: &HeaderMap,
) -> ApiResult<Conversation> {
    let mut request = AttachRequest::new(session_id.clone());
    if let Some(user) = user_id(headers) {
        request = request.as_user(user);
    }
    state
        .manager
        .attach(request)
        .await?
        .ok_or_else(|| ApiError::not_found(session_id))
}

/// Releases the connection when the SSE client goes away.
struct DetachOnDrop(Conversation);

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.0.detach();
    }
}

fn encode_all(catalog: &Catalog, events: &[Event]) -> ApiResult<Vec<Value>> {
    events
        .iter()
        .map(|event| {
            catalog
                .encode(event)
                .map_err(|error| ApiError::internal(format!("failed to encode event: {error}")))
        })
        .collect()
}

fn as_sse_event(catalog: &Catalog, event: &Event) -> SseEvent {
    let payload = catalog
        .encode(event)
        .map(|value| value.to_string())
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    let sse = SseEvent::default().event(event.kind_name()).data(payload);
    match event.id {
        Some(id) => sse.id(id.to_string()),
        None => sse,
    }
}
