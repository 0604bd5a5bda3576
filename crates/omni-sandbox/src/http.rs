//! Client for the action execution server that runs inside container and
//! remote sandboxes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use omni_protocol::{Action, ActionType, Catalog, Observation};
use reqwest::StatusCode;
use serde_json::json;
use tokio::fs;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{SandboxError, SandboxResult};

/// Slack added on top of an action's own timeout for the HTTP round trip.
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

/// Action types the execution server handles natively.
pub(crate) fn server_supports(action: ActionType) -> bool {
    action.is_runnable()
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Timeout(timeout)
    } else if err.is_connect() {
        SandboxError::Disconnected(err.to_string())
    } else {
        SandboxError::Failed(err.to_string())
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> SandboxResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => SandboxError::NotFound(what.to_owned()),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            SandboxError::Disconnected(format!("{what}: {status}"))
        }
        _ => SandboxError::Failed(format!("{what}: {status} {}", body.trim())),
    })
}

#[derive(Clone)]
pub struct ActionExecutionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    catalog: Arc<Catalog>,
}

impl ActionExecutionClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        catalog: Arc<Catalog>,
    ) -> SandboxResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| SandboxError::Failed(format!("http client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
            catalog,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.header("X-Session-API-Key", key),
            None => builder,
        }
    }

    /// Checks `GET /alive`.
    pub async fn alive(&self) -> SandboxResult<()> {
        let timeout = Duration::from_secs(10);
        let response = self
            .request(reqwest::Method::GET, "/alive")
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        check_status(response, "/alive").await.map(|_| ())
    }

    /// Polls [`alive`](Self::alive) every `interval` until it succeeds, `limit`
    /// elapses or `cancel` fires. `precheck` runs before every check and aborts
    /// the wait when it fails.
    pub async fn wait_until_alive<F, Fut>(
        &self,
        cancel: &CancellationToken,
        limit: Duration,
        interval: Duration,
        mut precheck: F,
    ) -> SandboxResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SandboxResult<()>>,
    {
        let deadline = Instant::now() + limit;
        loop {
            if cancel.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            precheck().await?;
            match self.alive().await {
                Ok(()) => return Ok(()),
                Err(
                    SandboxError::Disconnected(_)
                    | SandboxError::Timeout(_)
                    | SandboxError::NotFound(_),
                ) => {}
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(SandboxError::Disconnected(format!(
                    "execution server at {} not alive after {}s",
                    self.base_url,
                    limit.as_secs()
                )));
            }
            debug!(base_url = %self.base_url, "waiting for execution server");
            tokio::select! {
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Executes `action` remotely and decodes the observation it produced.
    #[instrument(
        skip(self, action),
        fields(base_url = %self.base_url, action = %action.action_type())
    )]
    pub async fn execute(&self, action: &Action, timeout: Duration) -> SandboxResult<Observation> {
        let mut action = action.clone();
        action.timeout = Some(timeout.as_secs().max(1));
        let record = self
            .catalog
            .encode_action(&action)
            .map_err(|err| SandboxError::Failed(err.to_string()))?;
        let response = self
            .request(reqwest::Method::POST, "/execute_action")
            .timeout(timeout + TRANSPORT_GRACE)
            .json(&json!({ "action": record }))
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        let body: serde_json::Value = check_status(response, "/execute_action")
            .await?
            .json()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        self.catalog
            .decode_observation(&body)
            .map_err(|err| SandboxError::Failed(format!("execution server replied with {err}")))
    }

    pub async fn list_files(&self, path: Option<&str>) -> SandboxResult<Vec<String>> {
        let timeout = Duration::from_secs(30);
        let response = self
            .request(reqwest::Method::POST, "/list_files")
            .timeout(timeout)
            .json(&json!({ "path": path }))
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        check_status(response, "/list_files")
            .await?
            .json()
            .await
            .map_err(|err| transport_error(err, timeout))
    }

    /// Uploads a host file or directory tree below `destination`.
    pub async fn upload(
        &self,
        host_src: &Path,
        destination: &str,
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
        let root_name = host_src
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut pending = vec![(host_src.to_path_buf(), root_name)];
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
                let target = format!("{}/{relative}", destination.trim_end_matches('/'));
                self.upload_file(&path, &target).await?;
            }
        }
        Ok(())
    }

    async fn upload_file(&self, host_path: &Path, target: &str) -> SandboxResult<()> {
        let bytes = fs::read(host_path)
            .await
            .map_err(|err| SandboxError::Failed(format!("{}: {err}", host_path.display())))?;
        let timeout = Duration::from_secs(120);
        let response = self
            .request(reqwest::Method::POST, "/upload_file")
            .timeout(timeout)
            .query(&[("destination", target)])
            .body(bytes)
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        check_status(response, "/upload_file").await?;
        debug!(target, "file uploaded to sandbox");
        Ok(())
    }

    /// Downloads `sandbox_path` into a fresh temporary host file.
    pub async fn download(&self, sandbox_path: &str) -> SandboxResult<PathBuf> {
        let timeout = Duration::from_secs(120);
        let response = self
            .request(reqwest::Method::GET, "/download_files")
            .timeout(timeout)
            .query(&[("path", sandbox_path)])
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        let bytes = check_status(response, sandbox_path)
            .await?
            .bytes()
            .await
            .map_err(|err| transport_error(err, timeout))?;
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
        fs::write(&dest, &bytes)
            .await
            .map_err(|err| SandboxError::Failed(err.to_string()))?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Bytes;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode as Status};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use omni_protocol::{Action, Event};
    use serde_json::Value;

    use super::*;
    use crate::testing::{Recorder, bind, serve};

    fn client(url: &str, key: Option<&str>) -> ActionExecutionClient {
        ActionExecutionClient::new(url, key.map(str::to_owned), Arc::new(Catalog::standard()))
            .expect("client builds")
    }

    #[tokio::test]
    async fn execute_posts_the_wire_record_and_decodes_the_reply() -> anyhow::Result<()> {
        let (listener, url) = bind().await?;
        let recorder = Recorder::default();
        let seen = recorder.clone();
        let router = Router::new().route(
            "/execute_action",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    seen.record("POST", "/execute_action", &headers, body);
                    let reply = Observation::command_output("hi\n", "ls", 0);
                    Json(Catalog::standard().encode(&Event::observation(reply)).unwrap_or_default())
                }
            }),
        );
        serve(listener, router);

        let observation = client(&url, Some("sk"))
            .execute(&Action::run("ls"), Duration::from_secs(7))
            .await?;
        assert_eq!(observation, Observation::command_output("hi\n", "ls", 0));

        let requests = recorder.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].api_key.as_deref(), Some("sk"));
        let record = &requests[0].body["action"];
        assert_eq!(record["action"], "run");
        assert_eq!(record["args"]["command"], "ls");
        assert_eq!(record["timeout"], 7);
        Ok(())
    }

    #[tokio::test]
    async fn error_statuses_map_onto_sandbox_errors() -> anyhow::Result<()> {
        let (listener, url) = bind().await?;
        let router = Router::new()
            .route("/alive", get(|| async { Status::SERVICE_UNAVAILABLE }))
            .route("/list_files", post(|| async { Status::NOT_FOUND }))
            .route(
                "/download_files",
                get(|| async { (Status::INTERNAL_SERVER_ERROR, "disk full") }),
            )
            .route(
                "/execute_action",
                post(|| async {
                    Json(serde_json::json!({"action": "run", "args": {"command": "ls"}}))
                }),
            );
        serve(listener, router);
        let client = client(&url, None);

        assert!(client.alive().await.unwrap_err().is_connection_failure());
        assert!(matches!(client.list_files(None).await, Err(SandboxError::NotFound(_))));
        let err = client.download("a.txt").await.unwrap_err();
        assert!(matches!(&err, SandboxError::Failed(message) if message.contains("disk full")));
        let err = client.execute(&Action::run("ls"), Duration::from_secs(5)).await.unwrap_err();
        let expected = "expected an observation";
        assert!(matches!(&err, SandboxError::Failed(message) if message.contains(expected)));
        Ok(())
    }

    #[tokio::test]
    async fn waiting_retries_until_the_server_is_alive() -> anyhow::Result<()> {
        let (listener, url) = bind().await?;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let router = Router::new().route(
            "/alive",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Status::SERVICE_UNAVAILABLE
                    } else {
                        Status::OK
                    }
                }
            }),
        );
        serve(listener, router);

        client(&url, None)
            .wait_until_alive(
                &CancellationToken::new(),
                Duration::from_secs(10),
                Duration::from_millis(10),
                || async { Ok(()) },
            )
            .await?;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn files_move_through_upload_and_download() -> anyhow::Result<()> {
        let (listener, url) = bind().await?;
        let recorder = Recorder::default();
        let seen = recorder.clone();
        let router = Router::new()
            .route(
                "/upload_file",
                post(move |headers: HeaderMap,
                           Query(query): Query<HashMap<String, String>>,
                           body: Bytes| {
                    let seen = seen.clone();
                    async move {
                        let body = serde_json::json!({
                            "destination": query.get("destination"),
                            "content": String::from_utf8_lossy(&body),
                        });
                        seen.record("POST", "/upload_file", &headers, body);
                        Status::OK
                    }
                }),
            )
            .route(
                "/download_files",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    match query.get("path").map(String::as_str) {
                        Some("/workspace/out.txt") => Ok("result"),
                        _ => Err(Status::NOT_FOUND),
                    }
                }),
            );
        serve(listener, router);
        let client = client(&url, None);

        let host = std::env::temp_dir()
            .join(format!("omni-http-upload-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(host.join("sub")).await?;
        fs::write(host.join("sub/a.txt"), "alpha").await?;
        client.upload(&host, "/workspace/", true).await?;
        let root = host
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let requests = recorder.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["destination"], format!("/workspace/{root}/sub/a.txt"));
        assert_eq!(requests[0].body["content"], "alpha");

        let copied = client.download("/workspace/out.txt").await?;
        assert_eq!(fs::read_to_string(&copied).await?, "result");
        assert!(matches!(client.download("/workspace/none").await, Err(SandboxError::NotFound(_))));
        let _ = fs::remove_dir_all(host).await;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_server_is_a_disconnect() {
        // Port 9 (discard) is reserved and closed on test hosts.
        let catalog = Arc::new(Catalog::standard());
        let client = ActionExecutionClient::new("http://127.0.0.1:9/", None, catalog)
            .expect("client builds");
        assert_eq!(client.base_url(), "http://127.0.0.1:9");
        let err = client
            .execute(&Action::run("ls"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_connection_failure(), "got {err:?}");
        assert!(client.alive().await.is_err());
    }

    #[tokio::test]
    async fn waiting_stops_on_cancel_and_on_failed_precheck() {
        let catalog = Arc::new(Catalog::standard());
        let client = ActionExecutionClient::new("http://127.0.0.1:9", None, catalog)
            .expect("client builds");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .wait_until_alive(
                &cancel,
                Duration::from_secs(30),
                Duration::from_millis(10),
                || async { Ok(()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled));

        let err = client
            .wait_until_alive(
                &CancellationToken::new(),
                Duration::from_secs(30),
                Duration::from_millis(10),
                || async { Err(SandboxError::Disconnected("container has exited".into())) },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));

        let err = client
            .wait_until_alive(
                &CancellationToken::new(),
                Duration::from_millis(50),
                Duration::from_millis(10),
                || async { Ok(()) },
            )
            .await
            .unwrap_err();
        assert!(err.is_connection_failure());
    }
}
