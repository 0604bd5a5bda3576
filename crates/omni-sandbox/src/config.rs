use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which substrate executes actions for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Docker,
    Remote,
    Cloud,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Remote => "remote",
            Self::Cloud => "cloud",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "docker" => Some(Self::Docker),
            "remote" => Some(Self::Remote),
            "cloud" => Some(Self::Cloud),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,
    /// Default action timeout, applied when an action carries none.
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    /// Host directory the local backend confines file access to, and the
    /// directory mounted into containers when `docker.mount_workspace` is set.
    pub workspace_dir: PathBuf,
    pub shell: String,
    /// Leave the sandbox running when its runtime closes.
    pub keep_runtime_alive: bool,
    pub runtime_startup_env_vars: BTreeMap<String, String>,
    pub docker: DockerConfig,
    pub remote: RemoteConfig,
    pub cloud: CloudConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            timeout_secs: 120,
            max_output_bytes: 64 * 1024,
            workspace_dir: std::env::temp_dir().join("omninexus-workspace"),
            shell: "sh".to_owned(),
            keep_runtime_alive: false,
            runtime_startup_env_vars: BTreeMap::new(),
            docker: DockerConfig::default(),
            remote: RemoteConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,
    pub container_name_prefix: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub use_host_network: bool,
    pub mount_workspace: bool,
    /// Path the workspace is mounted at inside the container.
    pub sandbox_workspace_dir: String,
    pub enable_gpu: bool,
    /// On close, remove every container carrying the name prefix, not just this session's.
    pub rm_all_containers: bool,
    pub startup_timeout_secs: u64,
    /// Command that starts the action execution server; `{port}` is substituted.
    pub server_command: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/omninexus/runtime:latest".to_owned(),
            container_name_prefix: "omninexus-runtime-".to_owned(),
            port_range_start: 30000,
            port_range_end: 39999,
            use_host_network: false,
            mount_workspace: false,
            sandbox_workspace_dir: "/workspace".to_owned(),
            enable_gpu: false,
            rm_all_containers: false,
            startup_timeout_secs: 120,
            server_command: "/omninexus/micromamba/bin/micromamba run -n omninexus \
                             poetry run python -u \
                             -m omninexus.runtime.action_execution_server {port} \
                             --working-dir /workspace"
                .to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    /// Image the remote service should start the sandbox from.
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub template: String,
    /// Sandbox lifetime requested from the provider.
    pub lifetime_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: None,
            template: "base".to_owned(),
            lifetime_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!(BackendKind::parse("Docker"), Some(BackendKind::Docker));
        assert_eq!(BackendKind::parse(" cloud "), Some(BackendKind::Cloud));
        assert_eq!(BackendKind::parse("kubernetes"), None);
    }

    #[test]
    fn defaults_match_runtime_expectations() {
        let config = SandboxConfig::default();
        assert_eq!(config.default_timeout(), Duration::from_secs(120));
        assert_eq!(config.docker.container_name_prefix, "omninexus-runtime-");
        assert!(config.docker.port_range_start < config.docker.port_range_end);
    }
}
