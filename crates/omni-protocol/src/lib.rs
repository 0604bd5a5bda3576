//! # omni-protocol: OmniNexus runtime protocol
//!
//! This crate defines the shared vocabulary of the runtime: the event
//! envelope, the closed catalog of actions and observations, the wire codec
//! that turns them into JSON records and back, and the storage port the
//! event stream persists through.
//!
//! It is intentionally dependency-light (no tokio, no HTTP stack) so every
//! other crate in the workspace can depend on it as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId, SubscriberId, ConnectionId) and `EventId`
//! - [`event`]: Event envelope, EventSource, ToolCallMetadata
//! - [`action`]: Action sum type, ActionType discriminators, ConfirmationState
//! - [`observation`]: Observation sum type and ObservationType discriminators
//! - [`state`]: AgentState
//! - [`catalog`]: The `Catalog` registry value: `encode`/`decode` of wire records
//! - [`migration`]: Versioned field migration table applied during decode
//! - [`ports`]: The `FileStore` storage port and its error type
//! - [`error`]: Protocol error types

pub mod action;
pub mod catalog;
pub mod error;
pub mod event;
pub mod ids;
pub mod migration;
pub mod observation;
pub mod ports;
pub mod state;

pub use action::{
    Action, ActionKind, ActionType, BrowseInteractive, BrowseUrl, ChangeState, ConfirmationState,
    DelegateToAgent, EditFile, Finish, MessageAction, ReadFile, Reject, RunCodeCell, RunCommand,
    WriteFile,
};
pub use catalog::Catalog;
pub use error::{ProtocolError, ProtocolResult};
pub use event::{Event, EventPayload, EventSource, ToolCallMetadata};
pub use ids::{ConnectionId, EventId, SessionId, SubscriberId};
pub use migration::{FieldChange, FieldMigration, MIGRATIONS, MigrationScope, WIRE_SCHEMA_VERSION};
pub use observation::{
    AgentStateChanged, BrowserOutput, CodeCellOutput, CommandMetadata, CommandOutput,
    DelegateOutput, ErrorOutput, FileEdit, FileRead, FileWrite, Observation, ObservationKind,
    ObservationType,
};
pub use ports::{FileStore, StoreError};
pub use state::AgentState;
