use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omni_protocol::{
    Action, ActionKind, ActionType, BrowseInteractive, BrowseUrl, Catalog, EditFile, Observation,
    ReadFile, RunCodeCell, RunCommand, SessionId, WriteFile,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::http::{ActionExecutionClient, server_supports};
use crate::process::{ensure_success, random_in_range, run_process};
use crate::{BackendKind, SandboxBackend, SandboxConfig, SandboxError, SandboxResult};

const SESSION_LABEL: &str = "omninexus.session";
const PORT_LABEL: &str = "omninexus.port";
const ALIVE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Default)]
struct DockerState {
    client: Option<ActionExecutionClient>,
    port: Option<u16>,
    detached: bool,
    closed: bool,
}

/// A sandbox container on the local docker daemon running the action
/// execution server. Driven through the `docker` CLI.
pub struct DockerBackend {
    config: SandboxConfig,
    session_id: SessionId,
    catalog: Arc<Catalog>,
    attach: bool,
    container_name: String,
    state: Mutex<DockerState>,
}

/// `docker inspect` view of an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerInfo {
    status: String,
    port: Option<u16>,
}

fn parse_inspect(line: &str) -> ContainerInfo {
    let mut parts = line.split_whitespace();
    let status = parts.next().unwrap_or_default().to_owned();
    let port = parts.next().and_then(|port| port.parse().ok());
    ContainerInfo { status, port }
}

impl DockerBackend {
    pub fn new(
        config: SandboxConfig,
        session_id: SessionId,
        catalog: Arc<Catalog>,
        attach: bool,
    ) -> SandboxResult<Self> {
        if config.docker.image.trim().is_empty() {
            return Err(SandboxError::Failed("sandbox.docker.image must be set".into()));
        }
        let container_name = format!("{}{}", config.docker.container_name_prefix, session_id);
        Ok(Self {
            config,
            session_id,
            catalog,
            attach,
            container_name,
            state: Mutex::new(DockerState::default()),
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    fn client(&self) -> SandboxResult<ActionExecutionClient> {
        self.state
            .lock()
            .client
            .clone()
            .ok_or_else(|| {
                SandboxError::Disconnected(format!(
                    "container {} is not connected",
                    self.container_name
                ))
            })
    }

    async fn docker(&self, args: &[String]) -> SandboxResult<String> {
        let output = run_process("docker", args, None).await?;
        let context = format!("docker {}", args.first().map_or("", String::as_str));
        let output = ensure_success(output, &context)?;
        Ok(output.stdout)
    }

    async fn inspect(&self) -> SandboxResult<Option<ContainerInfo>> {
        let format = format!("{{{{.State.Status}}}} {{{{index .Config.Labels \"{PORT_LABEL}\"}}}}");
        let output = run_process(
            "docker",
            &["inspect".into(), "--format".into(), format, self.container_name.clone()],
            None,
        )
        .await?;
        if output.exit_code != 0 {
            if output.stderr.contains("No such") {
                return Ok(None);
            }
            return Err(SandboxError::Failed(format!("docker inspect: {}", output.stderr.trim())));
        }
        Ok(Some(parse_inspect(output.stdout.trim())))
    }

    fn run_args(&self, port: u16) -> Vec<String> {
        let docker = &self.config.docker;
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            self.container_name.clone(),
            "--label".into(),
            format!("{SESSION_LABEL}={}", self.session_id),
            "--label".into(),
            format!("{PORT_LABEL}={port}"),
            "-e".into(),
            format!("port={port}"),
            "-e".into(),
            "PYTHONUNBUFFERED=1".into(),
            "-w".into(),
            "/omninexus/code/".into(),
        ];
        for (key, value) in &self.config.runtime_startup_env_vars {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if docker.use_host_network {
            args.push("--network".into());
            args.push("host".into());
        } else {
            args.push("-p".into());
            args.push(format!("{port}:{port}"));
        }
        if docker.mount_workspace {
            args.push("-v".into());
            args.push(format!(
                "{}:{}:rw",
                self.config.workspace_dir.display(),
                docker.sandbox_workspace_dir
            ));
        }
        if docker.enable_gpu {
            args.push("--gpus".into());
            args.push("all".into());
        }
        args.push(docker.image.clone());
        args.push("sh".into());
        args.push("-c".into());
        args.push(docker.server_command.replace("{port}", &port.to_string()));
        args
    }

    async fn start_container(&self) -> SandboxResult<u16> {
        let docker = &self.config.docker;
        let port = random_in_range(docker.port_range_start, docker.port_range_end);
        let args = self.run_args(port);
        let output = run_process("docker", &args, None).await?;
        if output.exit_code != 0 && output.stderr.contains("Conflict") {
            warn!(container = %self.container_name, "container already exists; replacing it");
            self.remove(&self.container_name).await?;
            self.docker(&args).await?;
        } else {
            ensure_success(output, "docker run")?;
        }
        info!(
            container = %self.container_name,
            port,
            image = %docker.image,
            "sandbox container started"
        );
        Ok(port)
    }

    async fn remove(&self, name: &str) -> SandboxResult<()> {
        self.docker(&["rm".into(), "-f".into(), name.to_owned()]).await.map(|_| ())
    }

    /// Removes every container whose name starts with `prefix`.
    async fn remove_matching(&self, prefix: &str) -> SandboxResult<()> {
        let listed = self
            .docker(&[
                "ps".into(),
                "-a".into(),
                "--filter".into(),
                format!("name={prefix}"),
                "--format".into(),
                "{{.Names}}".into(),
            ])
            .await?;
        for name in listed.lines().map(str::trim).filter(|name| name.starts_with(prefix)) {
            if let Err(err) = self.remove(name).await {
                warn!(container = name, error = %err, "failed to remove container");
            }
        }
        Ok(())
    }

    async fn ensure_running(&self) -> SandboxResult<()> {
        match self.inspect().await? {
            None => Err(SandboxError::NotFound(format!("container {}", self.container_name))),
            Some(info) if info.status == "exited" || info.status == "dead" => {
                Err(SandboxError::Disconnected(format!(
                    "container {} has exited",
                    self.container_name
                )))
            }
            Some(_) => Ok(()),
        }
    }

    fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    async fn forward(&self, kind: ActionKind, timeout: Duration) -> SandboxResult<Observation> {
        self.client()?.execute(&Action::new(kind), timeout).await
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn supports(&self, action: ActionType) -> bool {
        server_supports(action)
    }

    #[instrument(
        skip(self, cancel),
        fields(container = %self.container_name, attach = self.attach)
    )]
    async fn connect(&self, cancel: &CancellationToken) -> SandboxResult<()> {
        let port = match self.inspect().await? {
            Some(info) => {
                if info.status != "running" {
                    debug!(status = %info.status, "restarting existing container");
                    self.docker(&["start".into(), self.container_name.clone()]).await?;
                }
                info.port.ok_or_else(|| {
                    SandboxError::Failed(format!(
                        "container {} carries no {PORT_LABEL} label",
                        self.container_name
                    ))
                })?
            }
            None if self.attach => {
                return Err(SandboxError::NotFound(format!("container {}", self.container_name)));
            }
            None => self.start_container().await?,
        };

        let base_url = format!("http://localhost:{port}");
        let client = ActionExecutionClient::new(base_url, None, self.catalog.clone())?;
        let limit = Duration::from_secs(self.config.docker.startup_timeout_secs);
        client
            .wait_until_alive(cancel, limit, ALIVE_INTERVAL, || self.ensure_running())
            .await?;

        let mut state = self.state.lock();
        state.client = Some(client);
        state.port = Some(port);
        state.detached = false;
        info!(port, "sandbox container is alive");
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
        self.forward(ActionKind::ReadFile(action.clone()), self.default_timeout())
            .await
    }

    async fn write(&self, action: &WriteFile) -> SandboxResult<Observation> {
        self.forward(ActionKind::WriteFile(action.clone()), self.default_timeout())
            .await
    }

    async fn edit(&self, action: &EditFile) -> SandboxResult<Observation> {
        self.forward(ActionKind::EditFile(action.clone()), self.default_timeout())
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
        let mut state = self.state.lock();
        state.client = None;
        state.detached = true;
        Ok(())
    }

    #[instrument(skip(self), fields(container = %self.container_name))]
    async fn close(&self) -> SandboxResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.client = None;
            state.closed = true;
        }
        if self.config.keep_runtime_alive || self.attach {
            debug!("leaving container running");
            return Ok(());
        }
        if self.config.docker.rm_all_containers {
            let prefix = self.config.docker.container_name_prefix.clone();
            self.remove_matching(&prefix).await
        } else {
            self.remove(&self.container_name).await
        }
    }
}

impl Drop for DockerBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let kept = self.config.keep_runtime_alive || self.attach;
        if state.closed || state.detached || state.port.is_none() || kept {
            return;
        }
        // Best effort: the runtime is gone without closing its sandbox.
        let spawned = std::process::Command::new("docker")
            .args(["rm", "-f", self.container_name.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(err) = spawned {
            warn!(
                container = %self.container_name,
                error = %err,
                "container teardown on drop failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(config: SandboxConfig) -> DockerBackend {
        let catalog = Arc::new(Catalog::standard());
        DockerBackend::new(config, SessionId::from_string("abc"), catalog, false)
            .expect("backend builds")
    }

    #[test]
    fn container_is_named_after_the_session() {
        assert_eq!(backend(SandboxConfig::default()).container_name(), "omninexus-runtime-abc");
    }

    #[test]
    fn run_args_label_port_and_mount() {
        let mut config = SandboxConfig::default();
        config.docker.mount_workspace = true;
        config.docker.enable_gpu = true;
        config.runtime_startup_env_vars.insert("FOO".into(), "bar".into());
        let args = backend(config).run_args(31234);

        assert!(args.contains(&"omninexus.port=31234".to_owned()));
        assert!(args.contains(&"omninexus.session=abc".to_owned()));
        assert!(args.contains(&"31234:31234".to_owned()));
        assert!(args.contains(&"FOO=bar".to_owned()));
        assert!(args.iter().any(|arg| arg.ends_with(":/workspace:rw")));
        assert!(args.contains(&"--gpus".to_owned()));
        assert!(args.last().is_some_and(|cmd| cmd.contains("action_execution_server 31234")));
    }

    #[test]
    fn host_network_skips_port_publishing() {
        let mut config = SandboxConfig::default();
        config.docker.use_host_network = true;
        let args = backend(config).run_args(30001);
        assert!(args.contains(&"host".to_owned()));
        assert!(!args.contains(&"-p".to_owned()));
    }

    #[test]
    fn inspect_output_parses_status_and_port() {
        assert_eq!(
            parse_inspect("running 30123"),
            ContainerInfo {
                status: "running".into(),
                port: Some(30123)
            }
        );
        assert_eq!(parse_inspect("exited <no value>").port, None);
    }

    #[tokio::test]
    async fn handlers_require_a_connection() {
        let err = backend(SandboxConfig::default())
            .run(&RunCommand::new("ls"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn connected_handlers_forward_to_the_execution_server() -> anyhow::Result<()> {
        use axum::http::{HeaderMap, StatusCode as Status};
        use axum::routing::post;
        use axum::{Json, Router};
        use serde_json::Value;

        use crate::testing::{Recorder, bind, serve};

        let (listener, url) = bind().await?;
        let recorder = Recorder::default();
        let seen = recorder.clone();
        let router = Router::new().route(
            "/execute_action",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    seen.record("POST", "/execute_action", &headers, body);
                    Status::BAD_GATEWAY
                }
            }),
        );
        serve(listener, router);

        let backend = backend(SandboxConfig::default());
        let client = ActionExecutionClient::new(&url, None, Arc::new(Catalog::standard()))?;
        backend.state.lock().client = Some(client);

        let err = backend.read(&ReadFile::whole("/etc/hosts")).await.unwrap_err();
        assert!(err.is_connection_failure(), "got {err:?}");
        let requests = recorder.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["action"]["action"], "read");
        assert_eq!(requests[0].body["action"]["args"]["path"], "/etc/hosts");

        backend.detach().await?;
        assert!(backend.read(&ReadFile::whole("a")).await.unwrap_err().is_connection_failure());
        Ok(())
    }
}
