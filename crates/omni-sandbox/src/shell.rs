use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::SandboxError;
use crate::process::truncate_output;

/// Result of one command in a [`ShellSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub output: String,
    pub exit_code: i32,
    /// Working directory after the command ran.
    pub working_dir: String,
    pub pid: Option<u32>,
}

const EXIT_GRACE: Duration = Duration::from_secs(2);

enum CommandEnd {
    Finished {
        output: String,
        exit_code: i32,
        working_dir: String,
    },
    /// The command ended the shell itself, e.g. with `exit`.
    ShellExited { output: String },
}

struct ShellProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A long-lived shell whose working directory and exports persist across
/// commands. Commands run one at a time.
pub struct ShellSession {
    shell: String,
    initial_dir: PathBuf,
    env: BTreeMap<String, String>,
    max_output_bytes: usize,
    process: Mutex<Option<ShellProcess>>,
}

impl ShellSession {
    pub fn new(
        shell: impl Into<String>,
        initial_dir: impl Into<PathBuf>,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            shell: shell.into(),
            initial_dir: initial_dir.into(),
            env: BTreeMap::new(),
            max_output_bytes,
            process: Mutex::new(None),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn initial_dir(&self) -> &Path {
        &self.initial_dir
    }

    fn spawn(&self) -> Result<ShellProcess, SandboxError> {
        let mut cmd = Command::new(&self.shell);
        cmd.kill_on_drop(true)
            .current_dir(&self.initial_dir)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|err| SandboxError::Failed(format!("failed to start {}: {err}", self.shell)))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SandboxError::Failed("shell pipes unavailable".into()));
        };
        debug!(shell = %self.shell, pid = child.id(), "shell session started");
        Ok(ShellProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Runs `command` and waits for it to finish, up to `timeout`. A command
    /// that times out kills the shell, and a command that exits the shell
    /// reports the shell's exit status. Either way the next command starts a
    /// fresh shell in the initial directory.
    #[instrument(skip(self, command), fields(command_len = command.len()))]
    pub async fn exec(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellOutput, SandboxError> {
        let mut slot = self.process.lock().await;
        // Taken out of the slot so a cancelled call drops (and kills) the shell
        // instead of leaving it mid-command for the next caller.
        let mut process = match slot.take() {
            Some(mut process) => match process.child.try_wait() {
                Ok(None) => process,
                _ => self.start().await?,
            },
            None => self.start().await?,
        };

        match tokio::time::timeout(timeout, Self::run_in(&mut process, command)).await {
            Ok(Ok(CommandEnd::Finished {
                output,
                exit_code,
                working_dir,
            })) => {
                let pid = process.child.id();
                *slot = Some(process);
                Ok(ShellOutput {
                    output: truncate_output(output, self.max_output_bytes),
                    exit_code,
                    working_dir,
                    pid,
                })
            }
            Ok(Ok(CommandEnd::ShellExited { output })) => {
                let pid = process.child.id();
                let exit_code = match tokio::time::timeout(EXIT_GRACE, process.child.wait()).await {
                    Ok(Ok(status)) => status.code().unwrap_or(-1),
                    _ => {
                        let _ = process.child.start_kill();
                        -1
                    }
                };
                debug!(exit_code, "command exited the shell; restarting on next command");
                Ok(ShellOutput {
                    output: truncate_output(output, self.max_output_bytes),
                    exit_code,
                    working_dir: self.initial_dir.display().to_string(),
                    pid,
                })
            }
            Ok(Err(err)) => {
                warn!(error = %err, "shell session lost; restarting on next command");
                let _ = process.child.start_kill();
                Err(err)
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "shell command timed out; killing shell");
                let _ = process.child.start_kill();
                Err(SandboxError::Timeout(timeout))
            }
        }
    }

    async fn start(&self) -> Result<ShellProcess, SandboxError> {
        let mut process = self.spawn()?;
        process
            .stdin
            .write_all(b"exec 2>&1\n")
            .await
            .map_err(|err| SandboxError::Failed(format!("shell did not accept input: {err}")))?;
        Ok(process)
    }

    async fn run_in(process: &mut ShellProcess, command: &str) -> Result<CommandEnd, SandboxError> {
        let marker = format!("__OMNI_DONE_{}__", uuid::Uuid::new_v4().simple());
        let script = format!(
            "{{\n{command}\n}} </dev/null\nprintf '\\n{marker} %s %s\\n' \"$?\" \"$PWD\"\n"
        );
        let io_failed =
            |err: std::io::Error| SandboxError::Failed(format!("shell i/o failed: {err}"));
        process.stdin.write_all(script.as_bytes()).await.map_err(io_failed)?;
        process.stdin.flush().await.map_err(io_failed)?;

        let mut output = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = process.stdout.read_until(b'\n', &mut line).await.map_err(io_failed)?;
            if read == 0 {
                return Ok(CommandEnd::ShellExited { output });
            }
            // Commands may print arbitrary bytes.
            let text = String::from_utf8_lossy(&line);
            if let Some(status) = text.trim_end().strip_prefix(&marker) {
                let mut parts = status.trim_start().splitn(2, ' ');
                let exit_code = parts.next().and_then(|code| code.parse().ok()).unwrap_or(-1);
                let working_dir = parts.next().unwrap_or_default().to_owned();
                // Drop the newline the marker printf put in front of itself.
                if output.ends_with('\n') {
                    output.pop();
                }
                return Ok(CommandEnd::Finished {
                    output,
                    exit_code,
                    working_dir,
                });
            }
            output.push_str(&text);
        }
    }

    /// Stops the shell. A later [`exec`](Self::exec) starts a new one.
    pub async fn shutdown(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            let _ = process.child.kill().await;
        }
    }
}
