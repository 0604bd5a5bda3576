//! The action/observation catalog and its wire codec.
//!
//! A [`Catalog`] is an explicit registry value: it lists which discriminators
//! a deployment accepts and owns the `encode`/`decode` pair for wire records
//!
//! ```json
//! {"id": 4, "timestamp": "...", "source": "agent", "cause": 3,
//!  "action": "run", "args": {"command": "ls", "thought": "", ...},
//!  "timeout": 30, "message": "Running command: ls",
//!  "tool_call_metadata": {...}}
//! ```
//!
//! Construct one at startup and pass it by reference (usually `Arc<Catalog>`)
//! to every component that decodes events or dispatches actions.

use crate::action::{Action, ActionKind, ActionType, ConfirmationState};
use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{Event, EventPayload};
use crate::migration::{MigrationScope, migrate};
use crate::observation::{Observation, ObservationKind, ObservationType};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    actions: BTreeSet<ActionType>,
    observations: BTreeSet<ObservationType>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl Catalog {
    /// Every action and observation kind this build knows.
    pub fn standard() -> Self {
        Self {
            actions: ActionType::ALL.into_iter().collect(),
            observations: ObservationType::ALL.into_iter().collect(),
        }
    }

    /// Removes an action kind from the accepted vocabulary.
    pub fn without_action(mut self, action_type: ActionType) -> Self {
        self.actions.remove(&action_type);
        self
    }

    pub fn contains_action(&self, action_type: ActionType) -> bool {
        self.actions.contains(&action_type)
    }

    pub fn action_types(&self) -> impl Iterator<Item = ActionType> + '_ {
        self.actions.iter().copied()
    }

    pub fn resolve_action(&self, discriminator: &str) -> Option<ActionType> {
        ActionType::parse(discriminator).filter(|kind| self.actions.contains(kind))
    }

    pub fn resolve_observation(&self, discriminator: &str) -> Option<ObservationType> {
        ObservationType::parse(discriminator).filter(|kind| self.observations.contains(kind))
    }

    // ─── Encode ────────────────────────────────────────────────────

    pub fn encode(&self, event: &Event) -> ProtocolResult<Value> {
        let mut record = Map::new();
        if let Some(id) = event.id {
            record.insert("id".into(), id.into());
        }
        if let Some(timestamp) = event.timestamp {
            record.insert(
                "timestamp".into(),
                Value::String(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            );
        }
        if let Some(source) = event.source {
            record.insert("source".into(), source.as_str().into());
        }
        if let Some(cause) = event.cause {
            record.insert("cause".into(), cause.into());
        }
        match &event.payload {
            EventPayload::Action(action) => write_action(action, &mut record)?,
            EventPayload::Observation(observation) => {
                write_observation(observation, &mut record)?
            }
        }
        record.insert("message".into(), event.message().into());
        if let Some(metadata) = &event.tool_call_metadata {
            record.insert("tool_call_metadata".into(), to_json(metadata)?);
        }
        Ok(Value::Object(record))
    }

    /// Encodes an action without an envelope, as sent to execution servers.
    pub fn encode_action(&self, action: &Action) -> ProtocolResult<Value> {
        let mut record = Map::new();
        write_action(action, &mut record)?;
        record.insert("message".into(), action.message_text().into());
        Ok(Value::Object(record))
    }

    // ─── Decode ────────────────────────────────────────────────────

    pub fn decode_str(&self, raw: &str) -> ProtocolResult<Event> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| ProtocolError::malformed(format!("invalid JSON: {err}")))?;
        self.decode(&value)
    }

    pub fn decode(&self, value: &Value) -> ProtocolResult<Event> {
        let record = value
            .as_object()
            .ok_or_else(|| ProtocolError::malformed("event record must be a JSON object"))?;

        let mut hoisted = Vec::new();
        let payload = if record.contains_key("action") {
            EventPayload::Action(self.read_action(record, &mut hoisted)?)
        } else if record.contains_key("observation") {
            EventPayload::Observation(self.read_observation(record)?)
        } else {
            return Err(ProtocolError::malformed(
                "record has neither an 'action' nor an 'observation' discriminator",
            ));
        };

        let mut timestamp = parse_timestamp(record.get("timestamp"))?;
        if timestamp.is_none() {
            for (key, value) in &hoisted {
                if *key == "timestamp" {
                    timestamp = parse_timestamp(Some(value))?;
                }
            }
        }

        Ok(Event {
            id: optional_field(record, "id")?,
            timestamp,
            source: optional_field(record, "source")?,
            cause: optional_field(record, "cause")?,
            tool_call_metadata: optional_field(record, "tool_call_metadata")?,
            payload,
        })
    }

    pub fn decode_action(&self, value: &Value) -> ProtocolResult<Action> {
        match self.decode(value)?.payload {
            EventPayload::Action(action) => Ok(action),
            EventPayload::Observation(observation) => Err(ProtocolError::malformed(format!(
                "expected an action, got observation '{}'",
                observation.observation_type()
            ))),
        }
    }

    pub fn decode_observation(&self, value: &Value) -> ProtocolResult<Observation> {
        match self.decode(value)?.payload {
            EventPayload::Observation(observation) => Ok(observation),
            EventPayload::Action(action) => Err(ProtocolError::malformed(format!(
                "expected an observation, got action '{}'",
                action.action_type()
            ))),
        }
    }

    fn read_action(
        &self,
        record: &Map<String, Value>,
        hoisted: &mut Vec<(&'static str, Value)>,
    ) -> ProtocolResult<Action> {
        let name = discriminator(record, "action")?;
        let action_type = self
            .resolve_action(name)
            .ok_or_else(|| ProtocolError::malformed(format!("'{name}' is not a known action")))?;

        let mut args = object_field(record, "args")?;
        hoisted.extend(migrate(MigrationScope::ActionArgs, &mut args));

        let thought = match args.remove("thought") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(thought)) => thought,
            Some(other) => {
                return Err(ProtocolError::malformed(format!(
                    "'thought' must be a string, got {other}"
                )));
            }
        };
        let confirmation_state: ConfirmationState = match args.remove("confirmation_state") {
            None | Some(Value::Null) => ConfirmationState::default(),
            Some(value) => serde_json::from_value(value).map_err(|err| {
                ProtocolError::malformed(format!("invalid confirmation_state: {err}"))
            })?,
        };
        let legacy_timeout = args.remove("timeout");
        let timeout = match optional_field::<u64>(record, "timeout")? {
            Some(timeout) => Some(timeout),
            None => match legacy_timeout {
                None | Some(Value::Null) => None,
                Some(value) => Some(serde_json::from_value(value).map_err(|err| {
                    ProtocolError::malformed(format!("invalid timeout: {err}"))
                })?),
            },
        };

        let kind = action_kind(action_type, args).map_err(|err| {
            ProtocolError::malformed(format!("invalid args for action '{name}': {err}"))
        })?;
        Ok(Action {
            kind,
            thought,
            timeout,
            confirmation_state,
        })
    }

    fn read_observation(&self, record: &Map<String, Value>) -> ProtocolResult<Observation> {
        let name = discriminator(record, "observation")?;
        let observation_type = self.resolve_observation(name).ok_or_else(|| {
            ProtocolError::malformed(format!("'{name}' is not a known observation"))
        })?;

        let content = match record.get("content") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(content)) => content.clone(),
            Some(other) => {
                return Err(ProtocolError::malformed(format!(
                    "'content' must be a string, got {other}"
                )));
            }
        };
        let mut extras = object_field(record, "extras")?;
        migrate(MigrationScope::ObservationExtras, &mut extras);

        let kind = observation_kind(observation_type, extras).map_err(|err| {
            ProtocolError::malformed(format!("invalid extras for observation '{name}': {err}"))
        })?;
        Ok(Observation { content, kind })
    }
}

fn write_action(action: &Action, record: &mut Map<String, Value>) -> ProtocolResult<()> {
    let mut args = action_args(&action.kind)?;
    args.insert("thought".into(), action.thought.clone().into());
    args.insert(
        "confirmation_state".into(),
        to_json(&action.confirmation_state)?,
    );
    record.insert("action".into(), action.action_type().as_str().into());
    record.insert("args".into(), Value::Object(args));
    if let Some(timeout) = action.timeout {
        record.insert("timeout".into(), timeout.into());
    }
    Ok(())
}

fn write_observation(
    observation: &Observation,
    record: &mut Map<String, Value>,
) -> ProtocolResult<()> {
    record.insert(
        "observation".into(),
        observation.observation_type().as_str().into(),
    );
    record.insert("content".into(), observation.content.clone().into());
    record.insert(
        "extras".into(),
        Value::Object(observation_extras(&observation.kind)?),
    );
    if let ObservationKind::CommandOutput(output) = &observation.kind {
        record.insert("success".into(), (output.exit_code == 0).into());
    }
    Ok(())
}

fn action_args(kind: &ActionKind) -> ProtocolResult<Map<String, Value>> {
    match kind {
        ActionKind::RunCommand(args) => to_fields(args),
        ActionKind::RunCodeCell(args) => to_fields(args),
        ActionKind::ReadFile(args) => to_fields(args),
        ActionKind::WriteFile(args) => to_fields(args),
        ActionKind::EditFile(args) => to_fields(args),
        ActionKind::BrowseUrl(args) => to_fields(args),
        ActionKind::BrowseInteractive(args) => to_fields(args),
        ActionKind::DelegateToAgent(args) => to_fields(args),
        ActionKind::Finish(args) => to_fields(args),
        ActionKind::Reject(args) => to_fields(args),
        ActionKind::ChangeState(args) => to_fields(args),
        ActionKind::Message(args) => to_fields(args),
        ActionKind::Null => Ok(Map::new()),
    }
}

fn action_kind(
    action_type: ActionType,
    args: Map<String, Value>,
) -> Result<ActionKind, serde_json::Error> {
    let args = Value::Object(args);
    Ok(match action_type {
        ActionType::Run => ActionKind::RunCommand(serde_json::from_value(args)?),
        ActionType::RunIpython => ActionKind::RunCodeCell(serde_json::from_value(args)?),
        ActionType::Read => ActionKind::ReadFile(serde_json::from_value(args)?),
        ActionType::Write => ActionKind::WriteFile(serde_json::from_value(args)?),
        ActionType::Edit => ActionKind::EditFile(serde_json::from_value(args)?),
        ActionType::Browse => ActionKind::BrowseUrl(serde_json::from_value(args)?),
        ActionType::BrowseInteractive => {
            ActionKind::BrowseInteractive(serde_json::from_value(args)?)
        }
        ActionType::Delegate => ActionKind::DelegateToAgent(serde_json::from_value(args)?),
        ActionType::Finish => ActionKind::Finish(serde_json::from_value(args)?),
        ActionType::Reject => ActionKind::Reject(serde_json::from_value(args)?),
        ActionType::ChangeAgentState => ActionKind::ChangeState(serde_json::from_value(args)?),
        ActionType::Message => ActionKind::Message(serde_json::from_value(args)?),
        ActionType::Null => ActionKind::Null,
    })
}

fn observation_extras(kind: &ObservationKind) -> ProtocolResult<Map<String, Value>> {
    match kind {
        ObservationKind::CommandOutput(extras) => to_fields(extras),
        ObservationKind::CodeCellOutput(extras) => to_fields(extras),
        ObservationKind::FileRead(extras) => to_fields(extras),
        ObservationKind::FileWrite(extras) => to_fields(extras),
        ObservationKind::FileEdit(extras) => to_fields(extras),
        ObservationKind::BrowserOutput(extras) => to_fields(&**extras),
        ObservationKind::Delegate(extras) => to_fields(extras),
        ObservationKind::AgentStateChanged(extras) => to_fields(extras),
        ObservationKind::Error(extras) => to_fields(extras),
        ObservationKind::Success | ObservationKind::UserReject | ObservationKind::Null => {
            Ok(Map::new())
        }
    }
}

fn observation_kind(
    observation_type: ObservationType,
    extras: Map<String, Value>,
) -> Result<ObservationKind, serde_json::Error> {
    let extras = Value::Object(extras);
    Ok(match observation_type {
        ObservationType::Run => ObservationKind::CommandOutput(serde_json::from_value(extras)?),
        ObservationType::RunIpython => {
            ObservationKind::CodeCellOutput(serde_json::from_value(extras)?)
        }
        ObservationType::Read => ObservationKind::FileRead(serde_json::from_value(extras)?),
        ObservationType::Write => ObservationKind::FileWrite(serde_json::from_value(extras)?),
        ObservationType::Edit => ObservationKind::FileEdit(serde_json::from_value(extras)?),
        ObservationType::Browse => {
            ObservationKind::BrowserOutput(Box::new(serde_json::from_value(extras)?))
        }
        ObservationType::Delegate => ObservationKind::Delegate(serde_json::from_value(extras)?),
        ObservationType::AgentStateChanged => {
            ObservationKind::AgentStateChanged(serde_json::from_value(extras)?)
        }
        ObservationType::Error => ObservationKind::Error(serde_json::from_value(extras)?),
        ObservationType::Success => ObservationKind::Success,
        ObservationType::UserRejected => ObservationKind::UserReject,
        ObservationType::Null => ObservationKind::Null,
    })
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Value> {
    serde_json::to_value(value).map_err(|err| ProtocolError::Serialization(err.to_string()))
}

fn to_fields<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Map<String, Value>> {
    match to_json(value)? {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::Serialization(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

fn discriminator<'a>(record: &'a Map<String, Value>, key: &str) -> ProtocolResult<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::malformed(format!("'{key}' discriminator must be a string")))
}

fn object_field(record: &Map<String, Value>, key: &str) -> ProtocolResult<Map<String, Value>> {
    match record.get(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(ProtocolError::malformed(format!(
            "'{key}' must be an object, got {other}"
        ))),
    }
}

fn optional_field<T: DeserializeOwned>(
    record: &Map<String, Value>,
    key: &str,
) -> ProtocolResult<Option<T>> {
    match record.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| ProtocolError::malformed(format!("invalid '{key}': {err}"))),
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp (read as UTC) as older builds wrote.
fn parse_timestamp(value: Option<&Value>) -> ProtocolResult<Option<DateTime<Utc>>> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(raw)) => raw,
        Some(other) => {
            return Err(ProtocolError::malformed(format!(
                "'timestamp' must be a string, got {other}"
            )));
        }
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(|err| ProtocolError::malformed(format!("invalid timestamp '{raw}': {err}")))
}
