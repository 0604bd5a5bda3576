//! In-memory backend for runtime tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use omni_protocol::{ActionType, Observation, ReadFile, RunCommand, WriteFile};
use omni_sandbox::{
    BackendKind, SandboxBackend, SandboxError, SandboxResult, slice_lines, splice_lines,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Commands: `echo X` prints `X`; `hang` never returns; `disconnect` fails
/// as if the sandbox went away. Everything else prints nothing.
pub(crate) struct MemoryBackend {
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    missing: BTreeSet<ActionType>,
    exit_code: i32,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            missing: BTreeSet::new(),
            exit_code: 0,
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn without(mut self, action: ActionType) -> Self {
        self.missing.insert(action);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn put(&self, path: &str, content: &str) {
        self.files.lock().insert(path.to_owned(), content.to_owned());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files.lock().get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl SandboxBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn supports(&self, action: ActionType) -> bool {
        matches!(action, ActionType::Run | ActionType::Read | ActionType::Write)
            && !self.missing.contains(&action)
    }

    async fn connect(&self, cancel: &CancellationToken) -> SandboxResult<()> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, action: &RunCommand, _timeout: Duration) -> SandboxResult<Observation> {
        self.commands.lock().push(action.command.clone());
        match action.command.as_str() {
            "hang" => std::future::pending().await,
            "disconnect" => Err(SandboxError::Disconnected("connection reset".into())),
            command => {
                let output = command.strip_prefix("echo ").unwrap_or_default();
                Ok(Observation::command_output(output, command, self.exit_code))
            }
        }
    }

    async fn read(&self, action: &ReadFile) -> SandboxResult<Observation> {
        let content = self
            .get(&action.path)
            .ok_or_else(|| SandboxError::NotFound(action.path.clone()))?;
        Ok(Observation::file_read(
            slice_lines(&content, action.start, action.end),
            action.path.clone(),
        ))
    }

    async fn write(&self, action: &WriteFile) -> SandboxResult<Observation> {
        let mut files = self.files.lock();
        let existing = files.get(&action.path).cloned().unwrap_or_default();
        let updated = splice_lines(&existing, action.start, action.end, &action.content);
        files.insert(action.path.clone(), updated);
        Ok(Observation::file_write(action.path.clone()))
    }

    async fn copy_to(
        &self,
        _host_src: &Path,
        _sandbox_dest: &str,
        _recursive: bool,
    ) -> SandboxResult<()> {
        Err(self.unsupported("copy_to"))
    }

    async fn copy_from(&self, _sandbox_path: &str) -> SandboxResult<PathBuf> {
        Err(self.unsupported("copy_from"))
    }

    async fn list_files(&self, path: Option<&str>) -> SandboxResult<Vec<String>> {
        let prefix = match path {
            Some(dir) => format!("{}/", dir.trim_end_matches('/')),
            None => String::new(),
        };
        let entries: BTreeSet<String> = self
            .files
            .lock()
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .map(|rest| match rest.split_once('/') {
                Some((dir, _)) => format!("{dir}/"),
                None => rest.to_owned(),
            })
            .collect();
        Ok(entries.into_iter().collect())
    }

    async fn detach(&self) -> SandboxResult<()> {
        Ok(())
    }

    async fn close(&self) -> SandboxResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
