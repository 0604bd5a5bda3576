//! Sandbox backends for the OmniNexus runtime.
//!
//! Every backend implements [`SandboxBackend`], the handler surface the
//! runtime dispatches actions onto. Backend-native failures (process spawn
//! errors, HTTP transport errors, docker CLI failures) are normalised into
//! [`SandboxError`] here and never cross the crate boundary in their own type.

mod cloud;
mod config;
mod docker;
mod http;
mod lines;
mod local;
mod process;
mod remote;
mod shell;
#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omni_protocol::{
    ActionType, BrowseInteractive, BrowseUrl, Catalog, EditFile, Observation, ReadFile, RunCodeCell,
    RunCommand, SessionId, WriteFile,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use cloud::CloudSandboxBackend;
pub use config::{BackendKind, CloudConfig, DockerConfig, RemoteConfig, SandboxConfig};
pub use docker::DockerBackend;
pub use http::ActionExecutionClient;
pub use lines::{edit_lines, slice_lines, splice_lines};
pub use local::LocalBackend;
pub use process::{random_in_range, shell_quote};
pub use remote::RemoteBackend;
pub use shell::{ShellOutput, ShellSession};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: BackendKind,
    },
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("sandbox operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("sandbox unreachable: {0}")]
    Disconnected(String),
    #[error("sandbox operation cancelled")]
    Cancelled,
    #[error("sandbox operation failed: {0}")]
    Failed(String),
}

impl SandboxError {
    /// Whether the sandbox itself is gone, as opposed to one operation failing.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// The execution primitives a sandbox substrate provides.
///
/// `run`, `read` and `write` are mandatory. The remaining action handlers
/// default to [`SandboxError::Unsupported`]; a backend that overrides one
/// must also report it through [`supports`](Self::supports).
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend has a native handler for `action`.
    fn supports(&self, action: ActionType) -> bool;

    /// Starts or attaches to the sandbox. Waiting loops observe `cancel`.
    async fn connect(&self, cancel: &CancellationToken) -> SandboxResult<()>;

    async fn run(&self, action: &RunCommand, timeout: Duration) -> SandboxResult<Observation>;

    async fn read(&self, action: &ReadFile) -> SandboxResult<Observation>;

    async fn write(&self, action: &WriteFile) -> SandboxResult<Observation>;

    async fn run_code_cell(
        &self,
        _action: &RunCodeCell,
        _timeout: Duration,
    ) -> SandboxResult<Observation> {
        Err(self.unsupported("run_ipython"))
    }

    async fn edit(&self, _action: &EditFile) -> SandboxResult<Observation> {
        Err(self.unsupported("edit"))
    }

    async fn browse(&self, _action: &BrowseUrl, _timeout: Duration) -> SandboxResult<Observation> {
        Err(self.unsupported("browse"))
    }

    async fn browse_interactive(
        &self,
        _action: &BrowseInteractive,
        _timeout: Duration,
    ) -> SandboxResult<Observation> {
        Err(self.unsupported("browse_interactive"))
    }

    /// Copies a host file or directory into the sandbox under `sandbox_dest`.
    async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> SandboxResult<()>;

    /// Copies a sandbox path out to a fresh host location and returns it.
    async fn copy_from(&self, sandbox_path: &str) -> SandboxResult<PathBuf>;

    /// Entries of `path` (the working directory when `None`); directories end with `/`.
    async fn list_files(&self, path: Option<&str>) -> SandboxResult<Vec<String>>;

    /// Releases the connection but leaves the sandbox running.
    async fn detach(&self) -> SandboxResult<()>;

    /// Tears the sandbox down, unless configured to keep it alive.
    async fn close(&self) -> SandboxResult<()>;

    fn unsupported(&self, operation: &'static str) -> SandboxError {
        SandboxError::Unsupported {
            operation,
            backend: self.kind(),
        }
    }
}

/// Builds the backend selected by `config.backend` for `session_id`.
///
/// `attach` asks container backends to reuse an existing sandbox for the
/// session instead of starting a new one.
pub fn create_backend(
    config: &SandboxConfig,
    session_id: &SessionId,
    catalog: Arc<Catalog>,
    attach: bool,
) -> SandboxResult<Arc<dyn SandboxBackend>> {
    let backend: Arc<dyn SandboxBackend> = match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::new(config, session_id)),
        BackendKind::Docker => {
            let backend = DockerBackend::new(config.clone(), session_id.clone(), catalog, attach)?;
            Arc::new(backend)
        }
        BackendKind::Remote => {
            Arc::new(RemoteBackend::new(config.clone(), session_id.clone(), catalog)?)
        }
        BackendKind::Cloud => {
            Arc::new(CloudSandboxBackend::new(config.clone(), session_id.clone())?)
        }
    };
    tracing::debug!(
        backend = %config.backend,
        session_id = %session_id,
        attach,
        "sandbox backend created"
    );
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_is_the_default_selection() {
        let config = SandboxConfig::default();
        let backend = create_backend(
            &config,
            &SessionId::from_string("sel"),
            Arc::new(Catalog::standard()),
            false,
        )
        .expect("local backend builds");
        assert_eq!(backend.kind(), BackendKind::Local);
        assert!(backend.supports(ActionType::Run));
        assert!(!backend.supports(ActionType::Browse));
    }

    #[test]
    fn remote_backend_requires_an_api_url() {
        let config = SandboxConfig {
            backend: BackendKind::Remote,
            ..SandboxConfig::default()
        };
        let result = create_backend(
            &config,
            &SessionId::from_string("sel"),
            Arc::new(Catalog::standard()),
            false,
        );
        assert!(matches!(result, Err(SandboxError::Failed(_))));
    }

    #[test]
    fn timeout_message_reports_seconds() {
        assert_eq!(
            SandboxError::Timeout(Duration::from_secs(5)).to_string(),
            "sandbox operation timed out after 5s"
        );
    }
}
