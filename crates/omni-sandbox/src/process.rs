//! Host process helpers shared by the backends.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::SandboxError;

#[derive(Debug, Clone)]
pub(crate) struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn `program` and wait for it, optionally piping `stdin`.
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<ProcessOutput, SandboxError> {
    let mut cmd = Command::new(program);
    // Dropping the owning future must not leave the child running.
    cmd.kill_on_drop(true);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            SandboxError::Failed(format!("`{program}` was not found in PATH"))
        } else {
            SandboxError::Failed(format!("{program}: {err}"))
        }
    })?;

    if let Some(input) = stdin
        && let Some(mut child_stdin) = child.stdin.take()
    {
        child_stdin
            .write_all(input)
            .await
            .map_err(|err| SandboxError::Failed(format!("{program}: {err}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| SandboxError::Failed(format!("{program}: {err}")))?;

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Turn a non-zero exit into a contextual error.
pub(crate) fn ensure_success(
    output: ProcessOutput,
    context: &str,
) -> Result<ProcessOutput, SandboxError> {
    if output.exit_code == 0 {
        return Ok(output);
    }
    let mut details = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_owned()
    } else {
        output.stderr.trim().to_owned()
    };
    if details.is_empty() {
        details = format!("exited with {}", output.exit_code);
    }
    Err(SandboxError::Failed(format!("{context}: {details}")))
}

/// Shell-safe single-quote escaping.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".into()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Pseudo-random value in `start..=end`, seeded from a v4 uuid.
pub fn random_in_range(start: u16, end: u16) -> u16 {
    let (low, high) = if start <= end { (start, end) } else { (end, start) };
    let span = u128::from(high - low) + 1;
    let offset = uuid::Uuid::new_v4().as_u128() % span;
    low + offset as u16
}

/// Truncate `text` to at most `max_bytes`, on a char boundary, noting the cut.
pub(crate) fn truncate_output(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("\n[output truncated: {dropped} bytes omitted]"));
    text
}
