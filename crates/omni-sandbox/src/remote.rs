use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omni_protocol::{
    Action, ActionKind, ActionType, BrowseInteractive, BrowseUrl, Catalog, EditFile, Observation,
    ReadFile, RunCodeCell, RunCommand, SessionId, WriteFile,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::http::{ActionExecutionClient, server_supports};
use crate::{BackendKind, SandboxBackend, SandboxConfig, SandboxError, SandboxResult};

const ALIVE_INTERVAL: Duration = Duration::from_secs(2);
const API_TIMEOUT: Duration = Duration::from_secs(60);

/// Sandbox handle returned by the remote runtime service.
#[derive(Debug, Clone, Deserialize)]
struct RemoteRuntime {
    runtime_id: String,
    url: String,
    #[serde(default)]
    session_api_key: Option<String>,
}

/// A sandbox provisioned by a remote runtime service, reached through its
/// action execution server.
pub struct RemoteBackend {
    config: SandboxConfig,
    session_id: SessionId,
    catalog: Arc<Catalog>,
    api_url: String,
    http: reqwest::Client,
    runtime: Mutex<Option<RemoteRuntime>>,
    client: Mutex<Option<ActionExecutionClient>>,
}

fn api_error(err: reqwest::Error) -> SandboxError {
    if err.is_connect() {
        SandboxError::Disconnected(format!("runtime service: {err}"))
    } else if err.is_timeout() {
        SandboxError::Timeout(API_TIMEOUT)
    } else {
        SandboxError::Failed(format!("runtime service: {err}"))
    }
}

impl RemoteBackend {
    pub fn new(
        config: SandboxConfig,
        session_id: SessionId,
        catalog: Arc<Catalog>,
    ) -> SandboxResult<Self> {
        let api_url = config.remote.api_url.trim().trim_end_matches('/').to_owned();
        if api_url.is_empty() {
            return Err(SandboxError::Failed("sandbox.remote.api_url must be set".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|err| SandboxError::Failed(format!("http client: {err}")))?;
        Ok(Self {
            config,
            session_id,
            catalog,
            api_url,
            http,
            runtime: Mutex::new(None),
            client: Mutex::new(None),
        })
    }

    fn api(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.api_url));
        match &self.config.remote.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    async fn lookup(&self) -> SandboxResult<Option<RemoteRuntime>> {
        let response = self
            .api(reqwest::Method::GET, &format!("/sessions/{}", self.session_id))
            .send()
            .await
            .map_err(api_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SandboxError::Failed(format!("session lookup: {}", response.status())));
        }
        response.json().await.map(Some).map_err(api_error)
    }

    async fn start(&self) -> SandboxResult<RemoteRuntime> {
        let response = self
            .api(reqwest::Method::POST, "/start")
            .json(&json!({
                "session_id": self.session_id,
                "image": self.config.remote.image,
                "environment": self.config.runtime_startup_env_vars,
                "working_dir": self.config.docker.sandbox_workspace_dir,
            }))
            .send()
            .await
            .map_err(api_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Failed(format!("runtime start: {status} {}", body.trim())));
        }
        response.json().await.map_err(api_error)
    }

    fn client(&self) -> SandboxResult<ActionExecutionClient> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| SandboxError::Disconnected("remote sandbox is not connected".into()))
    }

    async fn forward(&self, kind: ActionKind, timeout: Duration) -> SandboxResult<Observation> {
        self.client()?.execute(&Action::new(kind), timeout).await
    }
}

#[async_trait]
impl SandboxBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn supports(&self, action: ActionType) -> bool {
        server_supports(action)
    }

    #[instrument(
        skip(self, cancel),
        fields(session_id = %self.session_id, api_url = %self.api_url)
    )]
    async fn connect(&self, cancel: &CancellationToken) -> SandboxResult<()> {
        let runtime = match self.lookup().await? {
            Some(runtime) => {
                debug!(runtime_id = %runtime.runtime_id, "reusing remote runtime");
                runtime
            }
            None => self.start().await?,
        };
        let client = ActionExecutionClient::new(
            &runtime.url,
            runtime.session_api_key.clone(),
            self.catalog.clone(),
        )?;
        let limit = self.config.default_timeout();
        client
            .wait_until_alive(cancel, limit, ALIVE_INTERVAL, || async { Ok(()) })
            .await?;
        info!(runtime_id = %runtime.runtime_id, url = %runtime.url, "remote runtime is alive");
        *self.runtime.lock() = Some(runtime);
        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn run(&self, action: &RunCommand, timeout: Duration) -> SandboxResult<Observation> {
        self.forward(ActionKind::RunCommand(action.clone()), timeout).await
    }

    async fn run_code_cell(
        &self,
        action: &RunCodeCell,
        timeout: Duration,
    ) -> SandboxResult<Observation> {
        self.forward(ActionKind::RunCodeCell(action.clone()), timeout).await
    }

    async fn read(&self, action: &ReadFile) -> SandboxResult<Observation> {
        self.forward(ActionKind::ReadFile(action.clone()), self.config.default_timeout())
            .await
    }

    async fn write(&self, action: &WriteFile) -> SandboxResult<Observation> {
        self.forward(ActionKind::WriteFile(action.clone()), self.config.default_timeout())
            .await
    }

    async fn edit(&self, action: &EditFile) -> SandboxResult<Observation> {
        self.forward(ActionKind::EditFile(action.clone()), self.config.default_timeout())
            .await
    }

    async fn browse(&self, action: &BrowseUrl, timeout: Duration) -> SandboxResult<Observation> {
        self.forward(ActionKind::BrowseUrl(action.clone()), timeout).await
    }

    async fn browse_interactive(
        &self,
        action: &BrowseInteractive,
        timeout: Duration,
    ) -> SandboxResult<Observation> {
        self.forward(ActionKind::BrowseInteractive(action.clone()), timeout)
            .await
    }

    async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> SandboxResult<()> {
        self.client()?.upload(host_src, sandbox_dest, recursive).await
    }

    async fn copy_from(&self, sandbox_path: &str) -> SandboxResult<PathBuf> {
        self.client()?.download(sandbox_path).await
    }

    async fn list_files(&self, path: Option<&str>) -> SandboxResult<Vec<String>> {
        self.client()?.list_files(path).await
    }

    async fn detach(&self) -> SandboxResult<()> {
        *self.client.lock() = None;
        Ok(())
    }

    async fn close(&self) -> SandboxResult<()> {
        *self.client.lock() = None;
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return Ok(());
        };
        if self.config.keep_runtime_alive {
            return Ok(());
        }
        let response = self
            .api(reqwest::Method::POST, "/stop")
            .json(&json!({ "runtime_id": runtime.runtime_id }))
            .send()
            .await
            .map_err(api_error)?;
        if !response.status().is_success() {
            return Err(SandboxError::Failed(format!("runtime stop: {}", response.status())));
        }
        info!(runtime_id = %runtime.runtime_id, "remote runtime stopped");
        Ok(())
    }
}
