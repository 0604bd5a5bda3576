//! In-sandbox helper processes started during runtime bootstrap.

use std::time::Duration;

use omni_protocol::{ObservationKind, RunCommand};
use omni_sandbox::{SandboxBackend, SandboxError, random_in_range, shell_quote};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::RuntimeError;

const JUPYTER_PORT_RANGE: (u16, u16) = (40000, 49999);
const VSCODE_PORT_RANGE: (u16, u16) = (50000, 54999);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How a started plugin signals that it is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The plugin's log contains this text.
    LogMarker(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    /// Shell command launched in the background inside the sandbox.
    pub command: String,
    pub log_path: String,
    pub readiness: Readiness,
    /// Port the plugin listens on inside the sandbox, when it has one.
    pub port: Option<u16>,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>, readiness: Readiness) -> Self {
        let name = name.into();
        Self {
            log_path: format!("/tmp/omninexus-{name}.log"),
            name,
            command: command.into(),
            readiness,
            port: None,
        }
    }

    pub fn jupyter() -> Self {
        let port = random_in_range(JUPYTER_PORT_RANGE.0, JUPYTER_PORT_RANGE.1);
        let command = format!(
            "jupyter kernelgateway --KernelGatewayApp.ip=0.0.0.0 --KernelGatewayApp.port={port}"
        );
        Self {
            port: Some(port),
            ..Self::new("jupyter", command, Readiness::LogMarker("is available at".into()))
        }
    }

    pub fn vscode(connection_token: &str) -> Self {
        let port = random_in_range(VSCODE_PORT_RANGE.0, VSCODE_PORT_RANGE.1);
        let command = format!(
            "openvscode-server --host 0.0.0.0 --connection-token {} --port {port}",
            shell_quote(connection_token)
        );
        Self {
            port: Some(port),
            ..Self::new("vscode", command, Readiness::LogMarker("available at".into()))
        }
    }

    /// Looks up a plugin by its configured name.
    pub fn builtin(name: &str, connection_token: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "jupyter" => Some(Self::jupyter()),
            "vscode" => Some(Self::vscode(connection_token)),
            _ => None,
        }
    }

    fn launch_command(&self) -> String {
        format!(
            "nohup sh -c {} > {} 2>&1 &",
            shell_quote(&self.command),
            shell_quote(&self.log_path)
        )
    }

    fn readiness_command(&self) -> String {
        format!("cat {} 2>/dev/null", shell_quote(&self.log_path))
    }

    fn is_ready(&self, output: &str) -> bool {
        match &self.readiness {
            Readiness::LogMarker(marker) => output.contains(marker.as_str()),
        }
    }
}

/// Polling bounds for [`start_plugin`].
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Launches `plugin` and polls until it reports ready, the deadline passes,
/// or `cancel` fires.
#[instrument(skip(backend, cancel), fields(plugin = %plugin.name))]
pub async fn start_plugin(
    backend: &dyn SandboxBackend,
    plugin: &PluginSpec,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<(), RuntimeError> {
    let launched = backend
        .run(
            &RunCommand::new(plugin.launch_command()),
            LAUNCH_TIMEOUT,
        )
        .await
        .map_err(|err| RuntimeError::PluginFailed {
            name: plugin.name.clone(),
            message: err.to_string(),
        })?;
    if let ObservationKind::CommandOutput(output) = &launched.kind
        && output.exit_code != 0
    {
        return Err(RuntimeError::PluginFailed {
            name: plugin.name.clone(),
            message: format!(
                "launch exited with {}: {}",
                output.exit_code,
                launched.content.trim()
            ),
        });
    }

    let started = Instant::now();
    let deadline = started + policy.timeout;
    let check = RunCommand::new(plugin.readiness_command());
    loop {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        match backend.run(&check, policy.interval.max(Duration::from_secs(1))).await {
            Ok(observation) if plugin.is_ready(&observation.content) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "plugin ready");
                return Ok(());
            }
            Ok(_) => {}
            Err(err @ SandboxError::Disconnected(_)) => return Err(err.into()),
            Err(err) => debug!(error = %err, "plugin readiness check failed"),
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::PluginNotReady {
                name: plugin.name.clone(),
                waited_secs: policy.timeout.as_secs(),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}
