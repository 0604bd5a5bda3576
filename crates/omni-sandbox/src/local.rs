use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use omni_protocol::{
    ActionType, EditFile, FileEdit, Observation, ObservationKind, ReadFile, RunCommand,
    SessionId, WriteFile,
};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::lines::{edit_lines, slice_lines, splice_lines};
use crate::shell::{ShellOutput, ShellSession};
use crate::{BackendKind, SandboxBackend, SandboxConfig, SandboxError, SandboxResult};

/// Runs actions directly on the host, confined to a per-session workspace
/// directory, through one persistent shell.
pub struct LocalBackend {
    workspace: PathBuf,
    shell: ShellSession,
}

impl LocalBackend {
    pub fn new(config: &SandboxConfig, session_id: &SessionId) -> Self {
        let workspace = config.workspace_dir.join(session_id.as_str());
        let shell = ShellSession::new(&config.shell, &workspace, config.max_output_bytes)
            .with_env(config.runtime_startup_env_vars.clone());
        Self { workspace, shell }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Maps a sandbox path onto the host, rejecting anything outside the workspace.
    fn resolve(&self, path: &str) -> SandboxResult<PathBuf> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace.join(candidate)
        };
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::Failed(format!("invalid path: {path}")));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.workspace) {
            return Err(SandboxError::Failed(format!(
                "path {path} is outside the workspace {}",
                self.workspace.display()
            )));
        }
        Ok(normalized)
    }

    async fn read_text(&self, path: &str) -> SandboxResult<Option<String>> {
        let full = self.resolve(path)?;
        match fs::read_to_string(&full).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) if full.is_dir() => {
                Err(SandboxError::Failed(format!("Path is a directory: {path}")))
            }
            Err(err) => Err(SandboxError::Failed(format!("{path}: {err}"))),
        }
    }

    async fn write_text(&self, path: &str, content: &str) -> SandboxResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| SandboxError::Failed(format!("{path}: {err}")))?;
        }
        fs::write(&full, content)
            .await
            .map_err(|err| SandboxError::Failed(format!("{path}: {err}")))
    }

    fn command_observation(command: &str, out: ShellOutput) -> Observation {
        let mut observation = Observation::command_output(out.output, command, out.exit_code);
        if let ObservationKind::CommandOutput(output) = &mut observation.kind {
            output.metadata.pid = out.pid;
            output.metadata.working_dir = Some(out.working_dir);
        }
        observation
    }
}

/// Copies `src` to `dest`, descending into directories.
async fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        if fs::metadata(&from).await?.is_dir() {
            fs::create_dir_all(&to).await?;
            let mut entries = fs::read_dir(&from).await?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push((entry.path(), to.join(entry.file_name())));
            }
        } else {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(&from, &to).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    // No kernel runs on the host, so code cells stay with the container backends.
    fn supports(&self, action: ActionType) -> bool {
        matches!(
            action,
            ActionType::Run | ActionType::Read | ActionType::Write | ActionType::Edit
        )
    }

    async fn connect(&self, cancel: &CancellationToken) -> SandboxResult<()> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        fs::create_dir_all(&self.workspace)
            .await
            .map_err(|err| {
                SandboxError::Disconnected(format!("{}: {err}", self.workspace.display()))
            })?;
        debug!(workspace = %self.workspace.display(), "local sandbox ready");
        Ok(())
    }

    #[instrument(skip(self, action), fields(backend = "local"))]
    async fn run(&self, action: &RunCommand, timeout: Duration) -> SandboxResult<Observation> {
        let out = self.shell.exec(&action.command, timeout).await?;
        Ok(Self::command_observation(&action.command, out))
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
        let updated = match self.read_text(&action.path).await? {
            Some(existing) => splice_lines(&existing, action.start, action.end, &action.content),
            None => action.content.clone(),
        };
        self.write_text(&action.path, &updated).await?;
        Ok(Observation::file_write(&action.path))
    }

    async fn edit(&self, action: &EditFile) -> SandboxResult<Observation> {
        let previous = self.read_text(&action.path).await?;
        let updated = match &previous {
            Some(existing) => edit_lines(existing, action.start, action.end, &action.content),
            None => action.content.clone(),
        };
        self.write_text(&action.path, &updated).await?;
        Ok(Observation::new(
            format!("The file {} was edited.", action.path),
            ObservationKind::FileEdit(FileEdit {
                path: action.path.clone(),
                prev_exist: previous.is_some(),
                old_content: previous,
                new_content: Some(updated),
            }),
        ))
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
        let name = host_src
            .file_name()
            .ok_or_else(|| SandboxError::Failed(format!("invalid source {}", host_src.display())))?;
        let dest = self.resolve(sandbox_dest)?.join(name);
        copy_tree(host_src, &dest)
            .await
            .map_err(|err| SandboxError::Failed(format!("copy to {sandbox_dest}: {err}")))
    }

    async fn copy_from(&self, sandbox_path: &str) -> SandboxResult<PathBuf> {
        let src = self.resolve(sandbox_path)?;
        if fs::metadata(&src).await.is_err() {
            return Err(SandboxError::NotFound(sandbox_path.to_owned()));
        }
        let name = src.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "workspace".into());
        let dest = std::env::temp_dir()
            .join(format!("omninexus-copy-{}", uuid::Uuid::new_v4().simple()))
            .join(name);
        copy_tree(&src, &dest)
            .await
            .map_err(|err| SandboxError::Failed(format!("copy from {sandbox_path}: {err}")))?;
        Ok(dest)
    }

    async fn list_files(&self, path: Option<&str>) -> SandboxResult<Vec<String>> {
        let dir = self.resolve(path.unwrap_or("."))?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SandboxError::Failed(format!("{}: {err}", dir.display()))),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| SandboxError::Failed(err.to_string()))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.is_ok_and(|kind| kind.is_dir()) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn detach(&self) -> SandboxResult<()> {
        self.shell.shutdown().await;
        Ok(())
    }

    async fn close(&self) -> SandboxResult<()> {
        self.shell.shutdown().await;
        debug!(workspace = %self.workspace.display(), "local sandbox closed");
        Ok(())
    }
}
