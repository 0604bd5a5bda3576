//! Observations: the results of executing (or declining to execute) actions.

use crate::state::AgentState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wire discriminator of an observation (`"observation": "<type>"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObservationType {
    Run,
    RunIpython,
    Read,
    Write,
    Edit,
    Browse,
    Delegate,
    AgentStateChanged,
    Error,
    Success,
    UserRejected,
    Null,
}

impl ObservationType {
    pub const ALL: [ObservationType; 12] = [
        Self::Run,
        Self::RunIpython,
        Self::Read,
        Self::Write,
        Self::Edit,
        Self::Browse,
        Self::Delegate,
        Self::AgentStateChanged,
        Self::Error,
        Self::Success,
        Self::UserRejected,
        Self::Null,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::RunIpython => "run_ipython",
            Self::Read => "read",
            Self::Write => "write",
            Self::Edit => "edit",
            Self::Browse => "browse",
            Self::Delegate => "delegate",
            Self::AgentStateChanged => "agent_state_changed",
            Self::Error => "error",
            Self::Success => "success",
            Self::UserRejected => "user_rejected",
            Self::Null => "null",
        }
    }

    pub fn parse(discriminator: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == discriminator)
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured details about the shell a command ran in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandMetadata {
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub py_interpreter_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub metadata: CommandMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCellOutput {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRead {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    #[serde(default)]
    pub prev_exist: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserOutput {
    pub url: String,
    /// Base64-encoded screenshot, empty when none was taken.
    #[serde(default)]
    pub screenshot: String,
    /// Accessibility-tree snapshot as reported by the browser engine.
    #[serde(default)]
    pub axtree_object: Value,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub open_pages_urls: Vec<String>,
    #[serde(default)]
    pub last_browser_action: String,
    #[serde(default)]
    pub last_browser_action_error: String,
    #[serde(default)]
    pub focused_element_bid: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DelegateOutput {
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStateChanged {
    pub agent_state: AgentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorOutput {
    #[serde(default)]
    pub error_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObservationKind {
    CommandOutput(CommandOutput),
    CodeCellOutput(CodeCellOutput),
    FileRead(FileRead),
    FileWrite(FileWrite),
    FileEdit(FileEdit),
    BrowserOutput(Box<BrowserOutput>),
    Delegate(DelegateOutput),
    AgentStateChanged(AgentStateChanged),
    Error(ErrorOutput),
    Success,
    UserReject,
    Null,
}

impl ObservationKind {
    pub fn observation_type(&self) -> ObservationType {
        match self {
            Self::CommandOutput(_) => ObservationType::Run,
            Self::CodeCellOutput(_) => ObservationType::RunIpython,
            Self::FileRead(_) => ObservationType::Read,
            Self::FileWrite(_) => ObservationType::Write,
            Self::FileEdit(_) => ObservationType::Edit,
            Self::BrowserOutput(_) => ObservationType::Browse,
            Self::Delegate(_) => ObservationType::Delegate,
            Self::AgentStateChanged(_) => ObservationType::AgentStateChanged,
            Self::Error(_) => ObservationType::Error,
            Self::Success => ObservationType::Success,
            Self::UserReject => ObservationType::UserRejected,
            Self::Null => ObservationType::Null,
        }
    }
}

/// A result plus its primary textual payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub content: String,
    pub kind: ObservationKind,
}

impl Observation {
    pub fn new(content: impl Into<String>, kind: ObservationKind) -> Self {
        Self {
            content: content.into(),
            kind,
        }
    }

    pub fn null() -> Self {
        Self::new("", ObservationKind::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, ObservationKind::Error(ErrorOutput::default()))
    }

    pub fn error_with_id(message: impl Into<String>, error_id: impl Into<String>) -> Self {
        Self::new(
            message,
            ObservationKind::Error(ErrorOutput {
                error_id: error_id.into(),
            }),
        )
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(message, ObservationKind::Success)
    }

    pub fn user_reject(message: impl Into<String>) -> Self {
        Self::new(message, ObservationKind::UserReject)
    }

    pub fn command_output(
        content: impl Into<String>,
        command: impl Into<String>,
        exit_code: i32,
    ) -> Self {
        Self::new(
            content,
            ObservationKind::CommandOutput(CommandOutput {
                command: command.into(),
                exit_code,
                metadata: CommandMetadata {
                    exit_code,
                    ..CommandMetadata::default()
                },
            }),
        )
    }

    pub fn code_cell_output(content: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            content,
            ObservationKind::CodeCellOutput(CodeCellOutput { code: code.into() }),
        )
    }

    pub fn file_read(content: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(content, ObservationKind::FileRead(FileRead { path: path.into() }))
    }

    pub fn file_write(path: impl Into<String>) -> Self {
        Self::new("", ObservationKind::FileWrite(FileWrite { path: path.into() }))
    }

    pub fn agent_state_changed(agent_state: AgentState) -> Self {
        Self::new(
            "",
            ObservationKind::AgentStateChanged(AgentStateChanged { agent_state }),
        )
    }

    pub fn observation_type(&self) -> ObservationType {
        self.kind.observation_type()
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ObservationKind::Error(_))
    }

    pub fn agent_state(&self) -> Option<AgentState> {
        match &self.kind {
            ObservationKind::AgentStateChanged(changed) => Some(changed.agent_state),
            _ => None,
        }
    }

    /// Derived, human-readable summary. Written to the wire, ignored on decode.
    pub fn message_text(&self) -> String {
        match &self.kind {
            ObservationKind::CommandOutput(output) => format!(
                "Command `{}` executed with exit code {}.",
                output.command, output.exit_code
            ),
            ObservationKind::CodeCellOutput(_) => "Code executed in IPython cell.".to_owned(),
            ObservationKind::FileRead(read) => format!("I read the file {}.", read.path),
            ObservationKind::FileWrite(write) => format!("I wrote to the file {}.", write.path),
            ObservationKind::FileEdit(edit) => format!("I edited the file {}.", edit.path),
            ObservationKind::BrowserOutput(browser) => format!("Visited {}", browser.url),
            ObservationKind::Delegate(_) | ObservationKind::AgentStateChanged(_) => String::new(),
            ObservationKind::Error(_) | ObservationKind::Success | ObservationKind::UserReject => {
                self.content.clone()
            }
            ObservationKind::Null => "No observation".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_mirrors_exit_code_into_metadata() {
        let obs = Observation::command_output("hi\n", "echo hi", 0);
        let ObservationKind::CommandOutput(output) = &obs.kind else {
            panic!("expected command output");
        };
        assert_eq!(output.metadata.exit_code, 0);
        assert_eq!(obs.message_text(), "Command `echo hi` executed with exit code 0.");
    }

    #[test]
    fn discriminators_parse_back() {
        for kind in ObservationType::ALL {
            assert_eq!(ObservationType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ObservationType::parse("telemetry"), None);
    }

    #[test]
    fn agent_state_is_exposed() {
        let obs = Observation::agent_state_changed(AgentState::Init);
        assert_eq!(obs.agent_state(), Some(AgentState::Init));
        assert_eq!(Observation::null().agent_state(), None);
    }
}
