//! Actions: commands the agent (or a user) asks the runtime to execute.
//!
//! `Action` is a closed sum type. The variant payloads are plain serde structs
//! whose field names are the wire `args` names; the discriminator string and
//! the fields shared by every variant (`thought`, `confirmation_state`,
//! `timeout`) are handled by the [`Catalog`](crate::catalog::Catalog) codec.

use crate::state::AgentState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ─── Discriminators ────────────────────────────────────────────────

/// Wire discriminator of an action (`"action": "<type>"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionType {
    Run,
    RunIpython,
    Read,
    Write,
    Edit,
    Browse,
    BrowseInteractive,
    Delegate,
    Finish,
    Reject,
    ChangeAgentState,
    Message,
    Null,
}

impl ActionType {
    pub const ALL: [ActionType; 13] = [
        Self::Run,
        Self::RunIpython,
        Self::Read,
        Self::Write,
        Self::Edit,
        Self::Browse,
        Self::BrowseInteractive,
        Self::Delegate,
        Self::Finish,
        Self::Reject,
        Self::ChangeAgentState,
        Self::Message,
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
            Self::BrowseInteractive => "browse_interactive",
            Self::Delegate => "delegate",
            Self::Finish => "finish",
            Self::Reject => "reject",
            Self::ChangeAgentState => "change_agent_state",
            Self::Message => "message",
            Self::Null => "null",
        }
    }

    pub fn parse(discriminator: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == discriminator)
    }

    /// Whether actions of this type execute against a sandbox backend.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            Self::Run
                | Self::RunIpython
                | Self::Read
                | Self::Write
                | Self::Edit
                | Self::Browse
                | Self::BrowseInteractive
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-in-the-loop gate on a runnable action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    #[default]
    Confirmed,
    Rejected,
    AwaitingConfirmation,
}

// ─── Variant payloads ──────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_end() -> i64 {
    -1
}

fn default_edit_start() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    pub command: String,
    #[serde(default)]
    pub blocking: bool,
}

impl RunCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            blocking: false,
        }
    }

    /// Runs to completion rather than returning early on a prompt.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCodeCell {
    pub code: String,
    #[serde(default = "default_true")]
    pub include_extra: bool,
    #[serde(default)]
    pub kernel_init_code: String,
}

impl RunCodeCell {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            include_extra: true,
            kernel_init_code: String::new(),
        }
    }

    /// Output only, without the interpreter banner.
    pub fn without_extra(mut self) -> Self {
        self.include_extra = false;
        self
    }
}

/// Read a window of lines; `start` is 0-indexed and `end = -1` means end of file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFile {
    pub path: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_end")]
    pub end: i64,
}

impl ReadFile {
    pub fn whole(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            start: 0,
            end: -1,
        }
    }
}

/// Replace a window of lines (same indexing as [`ReadFile`]) with `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_end")]
    pub end: i64,
}

impl WriteFile {
    pub fn whole(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            start: 0,
            end: -1,
        }
    }
}

/// Replace the 1-indexed inclusive line range `start..=end` (`end = -1` means
/// end of file) with `content`, creating the file if it does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditFile {
    pub path: String,
    pub content: String,
    #[serde(default = "default_edit_start")]
    pub start: i64,
    #[serde(default = "default_end")]
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseInteractive {
    pub browser_actions: String,
    #[serde(default)]
    pub browsergym_send_msg_to_user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateToAgent {
    pub agent: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Finish {
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reject {
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeState {
    pub agent_state: AgentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAction {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
    #[serde(default)]
    pub wait_for_response: bool,
}

// ─── Action ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    RunCommand(RunCommand),
    RunCodeCell(RunCodeCell),
    ReadFile(ReadFile),
    WriteFile(WriteFile),
    EditFile(EditFile),
    BrowseUrl(BrowseUrl),
    BrowseInteractive(BrowseInteractive),
    DelegateToAgent(DelegateToAgent),
    Finish(Finish),
    Reject(Reject),
    ChangeState(ChangeState),
    Message(MessageAction),
    Null,
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::RunCommand(_) => ActionType::Run,
            Self::RunCodeCell(_) => ActionType::RunIpython,
            Self::ReadFile(_) => ActionType::Read,
            Self::WriteFile(_) => ActionType::Write,
            Self::EditFile(_) => ActionType::Edit,
            Self::BrowseUrl(_) => ActionType::Browse,
            Self::BrowseInteractive(_) => ActionType::BrowseInteractive,
            Self::DelegateToAgent(_) => ActionType::Delegate,
            Self::Finish(_) => ActionType::Finish,
            Self::Reject(_) => ActionType::Reject,
            Self::ChangeState(_) => ActionType::ChangeAgentState,
            Self::Message(_) => ActionType::Message,
            Self::Null => ActionType::Null,
        }
    }
}

/// A command plus the fields every command carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    /// Free-text rationale attached by the agent.
    pub thought: String,
    /// Timeout in seconds; the sandbox default applies when unset.
    pub timeout: Option<u64>,
    pub confirmation_state: ConfirmationState,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            thought: String::new(),
            timeout: None,
            confirmation_state: ConfirmationState::Confirmed,
        }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Self::new(ActionKind::RunCommand(RunCommand::new(command)))
    }

    pub fn run_code(code: impl Into<String>) -> Self {
        Self::new(ActionKind::RunCodeCell(RunCodeCell::new(code)))
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::new(ActionKind::ReadFile(ReadFile::whole(path)))
    }

    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(ActionKind::WriteFile(WriteFile::whole(path, content)))
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self::new(ActionKind::Message(MessageAction {
            content: content.into(),
            image_urls: None,
            wait_for_response: false,
        }))
    }

    pub fn change_state(agent_state: AgentState) -> Self {
        Self::new(ActionKind::ChangeState(ChangeState { agent_state }))
    }

    pub fn null() -> Self {
        Self::new(ActionKind::Null)
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_confirmation_state(mut self, state: ConfirmationState) -> Self {
        self.confirmation_state = state;
        self
    }

    /// The same command, explicitly approved for execution.
    pub fn confirmed(self) -> Self {
        self.with_confirmation_state(ConfirmationState::Confirmed)
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    pub fn runnable(&self) -> bool {
        self.action_type().is_runnable()
    }

    /// Derived, human-readable summary. Written to the wire, ignored on decode.
    pub fn message_text(&self) -> String {
        match &self.kind {
            ActionKind::RunCommand(run) => format!("Running command: {}", run.command),
            ActionKind::RunCodeCell(cell) => {
                format!("Running Python code interactively: {}", cell.code)
            }
            ActionKind::ReadFile(read) => format!("Reading file: {}", read.path),
            ActionKind::WriteFile(write) => format!("Writing file: {}", write.path),
            ActionKind::EditFile(edit) => format!("Editing file: {}", edit.path),
            ActionKind::BrowseUrl(browse) => format!("Browsing URL: {}", browse.url),
            ActionKind::BrowseInteractive(browse) => {
                format!("Executing browser actions: {}", browse.browser_actions)
            }
            ActionKind::DelegateToAgent(delegate) => {
                format!("I'm asking {} for help with this task.", delegate.agent)
            }
            ActionKind::Finish(_) if !self.thought.is_empty() => self.thought.clone(),
            ActionKind::Finish(_) => "All done! What's next on the agenda?".to_owned(),
            ActionKind::Reject(_) => "Task is rejected by the agent.".to_owned(),
            ActionKind::ChangeState(change) => {
                format!("Agent state changed to {}", change.agent_state)
            }
            ActionKind::Message(message) => message.content.clone(),
            ActionKind::Null => "No action".to_owned(),
        }
    }
}
