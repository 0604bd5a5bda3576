use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use omni_protocol::{
    ActionType, Observation, ReadFile, RunCodeCell, RunCommand, SessionId, WriteFile,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::lines::{slice_lines, splice_lines};
use crate::process::truncate_output;
use crate::{BackendKind, SandboxBackend, SandboxConfig, SandboxError, SandboxResult};

const API_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct SandboxHandle {
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
struct CommandResult {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    #[serde(default)]
    is_dir: bool,
}

fn cloud_error(err: reqwest::Error, timeout: Duration) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Timeout(timeout)
    } else if err.is_connect() {
        SandboxError::Disconnected(format!("cloud sandbox: {err}"))
    } else {
        SandboxError::Failed(format!("cloud sandbox: {err}"))
    }
}

async fn checked(response: reqwest::Response, what: &str) -> SandboxResult<reqwest::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(SandboxError::NotFound(what.to_owned())),
        StatusCode::GONE => Err(SandboxError::Disconnected(format!("{what}: sandbox expired"))),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(SandboxError::Failed(format!("{what}: {status} {}", body.trim())))
        }
    }
}

/// An ephemeral sandbox leased from a cloud sandbox provider. Each command
/// runs in a fresh process; there is no long-lived shell.
pub struct CloudSandboxBackend {
    config: SandboxConfig,
    session_id: SessionId,
    api_url: String,
    http: reqwest::Client,
    sandbox_id: Mutex<Option<String>>,
}

impl CloudSandboxBackend {
    pub fn new(config: SandboxConfig, session_id: SessionId) -> SandboxResult<Self> {
        let api_url = config.cloud.api_url.trim().trim_end_matches('/').to_owned();
        if api_url.is_empty() {
            return Err(SandboxError::Failed("sandbox.cloud.api_url must be set".into()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| SandboxError::Failed(format!("http client: {err}")))?;
        Ok(Self {
            config,
            session_id,
            api_url,
            http,
            sandbox_id: Mutex::new(None),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.api_url));
        match &self.config.cloud.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    fn sandbox(&self) -> SandboxResult<String> {
        self.sandbox_id
            .lock()
            .clone()
            .ok_or_else(|| SandboxError::Disconnected("cloud sandbox is not connected".into()))
    }

    async fn find_existing(&self) -> SandboxResult<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, "/sandboxes")
            .timeout(API_TIMEOUT)
            .query(&[("session_id", self.session_id.as_str())])
            .send()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        let handles: Vec<SandboxHandle> = checked(response, "/sandboxes")
            .await?
            .json()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        Ok(handles.into_iter().next().map(|handle| handle.sandbox_id))
    }

    async fn create(&self) -> SandboxResult<String> {
        let response = self
            .request(reqwest::Method::POST, "/sandboxes")
            .timeout(API_TIMEOUT)
            .json(&json!({
                "template": self.config.cloud.template,
                "timeout": self.config.cloud.lifetime_secs,
                "metadata": { "session_id": self.session_id },
                "env_vars": self.config.runtime_startup_env_vars,
            }))
            .send()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        let handle: SandboxHandle = checked(response, "/sandboxes")
            .await?
            .json()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        Ok(handle.sandbox_id)
    }

    async fn exec(&self, command: &str, timeout: Duration) -> SandboxResult<CommandResult> {
        let id = self.sandbox()?;
        let response = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{id}/commands"))
            .timeout(timeout + Duration::from_secs(5))
            .json(&json!({ "command": command, "timeout": timeout.as_secs() }))
            .send()
            .await
            .map_err(|err| cloud_error(err, timeout))?;
        checked(response, "command")
            .await?
            .json()
            .await
            .map_err(|err| cloud_error(err, timeout))
    }

    async fn download(&self, path: &str) -> SandboxResult<Vec<u8>> {
        let id = self.sandbox()?;
        let response = self
            .request(reqwest::Method::GET, &format!("/sandboxes/{id}/files"))
            .timeout(API_TIMEOUT)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        let bytes = checked(response, path)
            .await?
            .bytes()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, path: &str, content: Vec<u8>) -> SandboxResult<()> {
        let id = self.sandbox()?;
        let response = self
            .request(reqwest::Method::PUT, &format!("/sandboxes/{id}/files"))
            .timeout(API_TIMEOUT)
            .query(&[("path", path)])
            .body(content)
            .send()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        checked(response, path).await.map(|_| ())
    }

    async fn read_text(&self, path: &str) -> SandboxResult<Option<String>> {
        match self.download(path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(SandboxError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl SandboxBackend for CloudSandboxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn supports(&self, action: ActionType) -> bool {
        matches!(
            action,
            ActionType::Run | ActionType::RunIpython | ActionType::Read | ActionType::Write
        )
    }

    #[instrument(skip(self, cancel), fields(session_id = %self.session_id))]
    async fn connect(&self, cancel: &CancellationToken) -> SandboxResult<()> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        let sandbox_id = match self.find_existing().await? {
            Some(id) => {
                debug!(sandbox_id = %id, "reusing cloud sandbox");
                id
            }
            None => self.create().await?,
        };
        info!(
            sandbox_id = %sandbox_id,
            template = %self.config.cloud.template,
            "cloud sandbox ready"
        );
        *self.sandbox_id.lock() = Some(sandbox_id);
        Ok(())
    }

    async fn run(&self, action: &RunCommand, timeout: Duration) -> SandboxResult<Observation> {
        let result = self.exec(&action.command, timeout).await?;
        let mut output = result.stdout;
        output.push_str(&result.stderr);
        Ok(Observation::command_output(
            truncate_output(output, self.config.max_output_bytes),
            &action.command,
            result.exit_code,
        ))
    }

    async fn run_code_cell(
        &self,
        action: &RunCodeCell,
        timeout: Duration,
    ) -> SandboxResult<Observation> {
        let script = format!("python3 - <<'OMNI_PY'\n{}\nOMNI_PY", action.code);
        let result = self.exec(&script, timeout).await?;
        let mut output = result.stdout;
        output.push_str(&result.stderr);
        Ok(Observation::code_cell_output(
            truncate_output(output, self.config.max_output_bytes),
            &action.code,
        ))
    }

    async fn read(&self, action: &ReadFile) -> SandboxResult<Observation> {
        let text = self
            .read_text(&action.path)
            .await?
            .ok_or_else(|| SandboxError::NotFound(action.path.clone()))?;
        Ok(Observation::file_read(
            slice_lines(&text, action.start, action.end),
            &action.path,
        ))
    }

    async fn write(&self, action: &WriteFile) -> SandboxResult<Observation> {
        let whole = action.start <= 0 && action.end < 0;
        let updated = if whole {
            action.content.clone()
        } else {
            match self.read_text(&action.path).await? {
                Some(existing) => {
                    splice_lines(&existing, action.start, action.end, &action.content)
                }
                None => action.content.clone(),
            }
        };
        self.upload(&action.path, updated.into_bytes()).await?;
        Ok(Observation::file_write(&action.path))
    }

    async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> SandboxResult<()> {
        let meta = fs::metadata(host_src)
            .await
            .map_err(|_| SandboxError::NotFound(host_src.display().to_string()))?;
        if meta.is_dir() && !recursive {
            return Err(SandboxError::Failed(format!(
                "{} is a directory; pass recursive to copy it",
                host_src.display()
            )));
        }
        let root = host_src
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut pending = vec![(host_src.to_path_buf(), root)];
        while let Some((path, relative)) = pending.pop() {
            if fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
                let mut entries = fs::read_dir(&path)
                    .await
                    .map_err(|err| SandboxError::Failed(err.to_string()))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|err| SandboxError::Failed(err.to_string()))?
                {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    pending.push((entry.path(), format!("{relative}/{name}")));
                }
            } else {
                let bytes = fs::read(&path)
                    .await
                    .map_err(|err| SandboxError::Failed(err.to_string()))?;
                let target = format!("{}/{relative}", sandbox_dest.trim_end_matches('/'));
                self.upload(&target, bytes).await?;
            }
        }
        Ok(())
    }

    async fn copy_from(&self, sandbox_path: &str) -> SandboxResult<PathBuf> {
        let bytes = self.download(sandbox_path).await?;
        let name = Path::new(sandbox_path)
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "download".into());
        let dir = std::env::temp_dir()
            .join(format!("omninexus-copy-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| SandboxError::Failed(err.to_string()))?;
        let dest = dir.join(name);
        fs::write(&dest, bytes)
            .await
            .map_err(|err| SandboxError::Failed(err.to_string()))?;
        Ok(dest)
    }

    async fn list_files(&self, path: Option<&str>) -> SandboxResult<Vec<String>> {
        let id = self.sandbox()?;
        let response = self
            .request(reqwest::Method::GET, &format!("/sandboxes/{id}/files/list"))
            .timeout(API_TIMEOUT)
            .query(&[("path", path.unwrap_or("."))])
            .send()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        let entries: Vec<FileEntry> = checked(response, "files/list")
            .await?
            .json()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        let mut names: Vec<String> = entries
            .into_iter()
            .map(|entry| if entry.is_dir { format!("{}/", entry.name) } else { entry.name })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn detach(&self) -> SandboxResult<()> {
        Ok(())
    }

    async fn close(&self) -> SandboxResult<()> {
        let sandbox_id = self.sandbox_id.lock().take();
        let Some(id) = sandbox_id else {
            return Ok(());
        };
        if self.config.keep_runtime_alive {
            return Ok(());
        }
        let response = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{id}"))
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|err| cloud_error(err, API_TIMEOUT))?;
        match checked(response, &id).await {
            Ok(_) | Err(SandboxError::NotFound(_)) => {
                info!(sandbox_id = %id, "cloud sandbox deleted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
