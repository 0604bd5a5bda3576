//! One-time sandbox preparation: environment injection, repository checkout
//! and microagent discovery.

use std::collections::BTreeMap;
use std::time::Duration;

use omni_protocol::{ObservationKind, ReadFile, RunCodeCell, RunCommand};
use omni_sandbox::{SandboxBackend, SandboxError, shell_quote};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::RuntimeError;

pub const LEGACY_INSTRUCTIONS_FILE: &str = ".omninexus_instructions";
pub const WORKSPACE_BRANCH_PREFIX: &str = "omninexus-workspace-";

// ─── Environment ───────────────────────────────────────────────────

/// Host variables carrying `prefix`, with the prefix stripped.
pub fn prefixed_env(
    prefix: &str,
    vars: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| {
            let stripped = key.strip_prefix(prefix)?;
            (!stripped.is_empty()).then(|| (stripped.to_owned(), value))
        })
        .collect()
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// `export K='V'; ...` for every valid variable name, or `None` if nothing
/// remains to export.
pub fn export_script(vars: &BTreeMap<String, String>) -> Option<String> {
    let mut script = String::new();
    for (key, value) in vars {
        if !is_env_name(key) {
            warn!(key = %key, "skipping environment variable with an invalid name");
            continue;
        }
        script.push_str(&format!("export {key}={}; ", shell_quote(value)));
    }
    (!script.is_empty()).then(|| script.trim_end().to_owned())
}

/// The same variables assigned through `os.environ` for the code-cell kernel.
pub fn python_env_script(vars: &BTreeMap<String, String>) -> Option<String> {
    let mut script = String::from("import os\n");
    let mut any = false;
    for (key, value) in vars.iter().filter(|(key, _)| is_env_name(key)) {
        let literal = serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_owned());
        script.push_str(&format!("os.environ[\"{key}\"] = {literal}\n"));
        any = true;
    }
    any.then_some(script)
}

/// Exports `vars` into the sandbox shell, and into the code-cell kernel
/// when `code_cells` is set. A non-zero shell exit is a bootstrap failure.
#[instrument(skip(backend, vars), fields(count = vars.len()))]
pub async fn inject_env(
    backend: &dyn SandboxBackend,
    vars: &BTreeMap<String, String>,
    code_cells: bool,
    timeout: Duration,
) -> Result<(), RuntimeError> {
    if code_cells && let Some(code) = python_env_script(vars) {
        let observation = backend
            .run_code_cell(&RunCodeCell::new(code).without_extra(), timeout)
            .await
            .map_err(|err| RuntimeError::EnvInjection(err.to_string()))?;
        if observation.is_error() {
            return Err(RuntimeError::EnvInjection(observation.content));
        }
    }

    let Some(command) = export_script(vars) else {
        return Ok(());
    };
    let observation = backend
        .run(&RunCommand::new(command).blocking(), timeout)
        .await
        .map_err(|err| RuntimeError::EnvInjection(err.to_string()))?;
    match &observation.kind {
        ObservationKind::CommandOutput(output) if output.exit_code == 0 => {
            debug!("environment variables exported");
            Ok(())
        }
        ObservationKind::CommandOutput(output) => Err(RuntimeError::EnvInjection(format!(
            "export exited with {}: {}",
            output.exit_code,
            observation.content.trim()
        ))),
        _ => Err(RuntimeError::EnvInjection(observation.content)),
    }
}

// ─── Repository ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    /// `owner/name` on GitHub.
    pub selected_repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
}

impl RepositorySpec {
    /// Directory the repository is cloned into, relative to the workspace.
    pub fn directory(&self) -> Result<&str, RuntimeError> {
        let invalid = || RuntimeError::InvalidRepository(self.selected_repository.clone());
        let (owner, name) = self.selected_repository.split_once('/').ok_or_else(invalid)?;
        let valid_segment = |s: &str| {
            !s.is_empty()
                && s != "."
                && s != ".."
                && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        };
        if !valid_segment(owner) || !valid_segment(name) {
            return Err(invalid());
        }
        Ok(name)
    }

    /// Clone, enter, and branch off into a fresh working branch.
    pub fn clone_command(&self, branch: &str) -> Result<String, RuntimeError> {
        let dir = self.directory()?;
        let url = match self.github_token.as_deref().filter(|token| !token.is_empty()) {
            Some(token) => format!("https://{token}@github.com/{}.git", self.selected_repository),
            None => format!("https://github.com/{}.git", self.selected_repository),
        };
        Ok(format!(
            "git clone {} {dir} ; cd {dir} ; git checkout -b {branch}",
            shell_quote(&url)
        ))
    }
}

/// `omninexus-workspace-` plus eight lowercase alphanumerics.
pub fn workspace_branch_name() -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{WORKSPACE_BRANCH_PREFIX}{suffix}")
}

// ─── Microagents ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicroagentKind {
    /// A single instructions file at the repository root.
    Legacy,
    /// `repo.md`: always-on repository guidance.
    Repo,
    /// `knowledge/*`: guidance triggered by keywords.
    Knowledge,
    /// `tasks/*`: reusable task templates.
    Task,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Microagent {
    pub name: String,
    pub kind: MicroagentKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<String>,
    pub content: String,
}

impl Microagent {
    /// Parses an optional `---` front-matter block for `name` and `triggers`.
    pub fn parse(path: &str, kind: MicroagentKind, raw: &str) -> Self {
        let fallback = path
            .rsplit('/')
            .next()
            .map(|file| file.trim_end_matches(".md").to_owned())
            .unwrap_or_default();
        let mut name = fallback;
        let mut triggers = Vec::new();
        let mut content = raw.to_owned();

        if let Some(rest) = raw.strip_prefix("---\n")
            && let Some(end) = rest.find("\n---")
        {
            for line in rest[..end].lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "name" if !value.is_empty() => name = value.trim_matches('"').to_owned(),
                    "triggers" => {
                        triggers = value
                            .trim_start_matches('[')
                            .trim_end_matches(']')
                            .split(',')
                            .map(|t| t.trim().trim_matches('"').trim_matches('\'').to_owned())
                            .filter(|t| !t.is_empty())
                            .collect();
                    }
                    _ => {}
                }
            }
            let body = &rest[end + 4..];
            content = body.strip_prefix('\n').unwrap_or(body).to_owned();
        }

        Self {
            name,
            kind,
            path: path.to_owned(),
            triggers,
            content,
        }
    }
}

async fn read_optional(backend: &dyn SandboxBackend, path: &str) -> Option<String> {
    match backend.read(&ReadFile::whole(path)).await {
        Ok(observation) if !observation.is_error() => Some(observation.content),
        Ok(_) | Err(SandboxError::NotFound(_)) => None,
        Err(err) => {
            debug!(path, error = %err, "microagent read failed");
            None
        }
    }
}

async fn list_optional(backend: &dyn SandboxBackend, dir: &str) -> Vec<String> {
    match backend.list_files(Some(dir)).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir, error = %err, "microagent listing failed");
            Vec::new()
        }
    }
}

/// Loads the repository's microagents. `repo_dir` is the checkout directory
/// relative to the workspace, if a repository was cloned. Missing files and
/// directories are not errors.
#[instrument(skip(backend))]
pub async fn discover_microagents(
    backend: &dyn SandboxBackend,
    microagent_prefix: &str,
    repo_dir: Option<&str>,
) -> Vec<Microagent> {
    let join = |base: Option<&str>, rest: &str| match base {
        Some(base) => format!("{}/{rest}", base.trim_end_matches('/')),
        None => rest.to_owned(),
    };
    let mut found = Vec::new();

    let legacy = join(repo_dir, LEGACY_INSTRUCTIONS_FILE);
    if let Some(raw) = read_optional(backend, &legacy).await {
        found.push(Microagent::parse(&legacy, MicroagentKind::Legacy, &raw));
    }

    let root = join(repo_dir, microagent_prefix.trim_end_matches('/'));
    let repo_md = format!("{root}/repo.md");
    if let Some(raw) = read_optional(backend, &repo_md).await {
        found.push(Microagent::parse(&repo_md, MicroagentKind::Repo, &raw));
    }

    let nested = [("knowledge", MicroagentKind::Knowledge), ("tasks", MicroagentKind::Task)];
    for (subdir, kind) in nested {
        let dir = format!("{root}/{subdir}");
        let mut entries = list_optional(backend, &dir).await;
        entries.sort();
        for entry in entries.into_iter().filter(|entry| !entry.ends_with('/')) {
            let file = entry.rsplit('/').next().unwrap_or(&entry).to_owned();
            let path = format!("{dir}/{file}");
            if let Some(raw) = read_optional(backend, &path).await {
                found.push(Microagent::parse(&path, kind, &raw));
            }
        }
    }
    debug!(count = found.len(), "microagents discovered");
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;

    #[test]
    fn prefixed_variables_are_stripped() {
        let vars = prefixed_env(
            "SANDBOX_ENV_",
            [
                ("SANDBOX_ENV_TOKEN".to_owned(), "abc".to_owned()),
                ("SANDBOX_ENV_".to_owned(), "empty".to_owned()),
                ("HOME".to_owned(), "/root".to_owned()),
            ],
        );
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("TOKEN").map(String::as_str), Some("abc"));
    }

    #[test]
    fn export_script_quotes_values_and_skips_bad_names() {
        let vars = BTreeMap::from([
            ("A".to_owned(), "it's".to_owned()),
            ("1BAD".to_owned(), "x".to_owned()),
            ("B_2".to_owned(), "two words".to_owned()),
        ]);
        assert_eq!(
            export_script(&vars).as_deref(),
            Some("export A='it'\\''s'; export B_2='two words';")
        );
        let python = python_env_script(&vars).expect("python script");
        assert!(python.contains("os.environ[\"A\"] = \"it's\""));
        assert!(!python.contains("1BAD"));
        assert_eq!(export_script(&BTreeMap::new()), None);
    }

    #[tokio::test]
    async fn failing_export_is_a_bootstrap_error() {
        let backend = MemoryBackend::new().with_exit_code(1);
        let vars = BTreeMap::from([("A".to_owned(), "1".to_owned())]);
        let err = inject_env(&backend, &vars, false, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::EnvInjection(_)));
    }

    #[test]
    fn clone_command_embeds_token_and_branch() {
        let spec = RepositorySpec {
            selected_repository: "acme/widgets".into(),
            github_token: Some("t0k".into()),
        };
        let branch = workspace_branch_name();
        assert!(branch.starts_with(WORKSPACE_BRANCH_PREFIX));
        let suffix = &branch[WORKSPACE_BRANCH_PREFIX.len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let command = spec.clone_command(&branch).expect("valid repository");
        assert_eq!(
            command,
            format!(
                "git clone 'https://t0k@github.com/acme/widgets.git' widgets ; \
                 cd widgets ; git checkout -b {branch}"
            )
        );

        let bad = RepositorySpec {
            selected_repository: "../etc".into(),
            github_token: None,
        };
        assert!(matches!(bad.clone_command("b"), Err(RuntimeError::InvalidRepository(_))));
    }

    #[test]
    fn front_matter_sets_name_and_triggers() {
        let raw = "---\nname: flaky-tests\ntriggers: [pytest, flaky]\n---\n\
                   Rerun with -p no:randomly.\n";
        let agent = Microagent::parse("x/knowledge/flaky.md", MicroagentKind::Knowledge, raw);
        assert_eq!(agent.name, "flaky-tests");
        assert_eq!(agent.triggers, vec!["pytest".to_owned(), "flaky".to_owned()]);
        assert_eq!(agent.content, "Rerun with -p no:randomly.\n");

        let plain = Microagent::parse(
            "widgets/.omninexus/microagents/repo.md",
            MicroagentKind::Repo,
            "hello",
        );
        assert_eq!(plain.name, "repo");
        assert_eq!(plain.content, "hello");
    }

    #[tokio::test]
    async fn discovers_every_microagent_location() {
        let backend = MemoryBackend::new();
        backend.put("widgets/.omninexus_instructions", "legacy");
        backend.put("widgets/.omninexus/microagents/repo.md", "repo");
        backend.put("widgets/.omninexus/microagents/knowledge/git.md", "git");
        backend.put("widgets/.omninexus/microagents/tasks/release.md", "release");

        let agents =
            discover_microagents(&backend, ".omninexus/microagents", Some("widgets")).await;
        let kinds: Vec<_> = agents.iter().map(|agent| agent.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MicroagentKind::Legacy,
                MicroagentKind::Repo,
                MicroagentKind::Knowledge,
                MicroagentKind::Task
            ]
        );
        assert_eq!(agents[2].path, "widgets/.omninexus/microagents/knowledge/git.md");

        let none = discover_microagents(&backend, ".omninexus/microagents", Some("other")).await;
        assert!(none.is_empty());
    }
}
