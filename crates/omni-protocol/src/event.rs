//! The event envelope shared by every action and observation.
//!
//! `id`, `timestamp` and `source` are stamped exactly once by the event
//! stream at append time; an event constructed in memory carries `None` for
//! all three until then.

use crate::action::Action;
use crate::ids::EventId;
use crate::observation::Observation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Originator of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Environment => "environment",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlates an action back to the LLM tool call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallMetadata {
    pub function_name: String,
    pub tool_call_id: String,
    /// Number of tool calls in the same completion response.
    #[serde(default = "default_total_calls")]
    pub total_calls_in_response: u32,
}

fn default_total_calls() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: Option<EventId>,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: Option<EventSource>,
    /// Id of the event that produced this one. Set on observations.
    pub cause: Option<EventId>,
    pub tool_call_metadata: Option<ToolCallMetadata>,
    pub payload: EventPayload,
}

impl Event {
    fn unstamped(payload: EventPayload) -> Self {
        Self {
            id: None,
            timestamp: None,
            source: None,
            cause: None,
            tool_call_metadata: None,
            payload,
        }
    }

    pub fn action(action: Action) -> Self {
        Self::unstamped(EventPayload::Action(action))
    }

    pub fn observation(observation: Observation) -> Self {
        Self::unstamped(EventPayload::Observation(observation))
    }

    pub fn with_cause(mut self, cause: EventId) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_tool_call_metadata(mut self, metadata: Option<ToolCallMetadata>) -> Self {
        self.tool_call_metadata = metadata;
        self
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(observation) => Some(observation),
            EventPayload::Action(_) => None,
        }
    }

    /// The wire discriminator of the payload.
    pub fn kind_name(&self) -> &'static str {
        match &self.payload {
            EventPayload::Action(action) => action.action_type().as_str(),
            EventPayload::Observation(observation) => observation.observation_type().as_str(),
        }
    }

    pub fn is_null(&self) -> bool {
        match &self.payload {
            EventPayload::Action(action) => action.action_type() == crate::ActionType::Null,
            EventPayload::Observation(observation) => {
                observation.observation_type() == crate::ObservationType::Null
            }
        }
    }

    pub fn message(&self) -> String {
        match &self.payload {
            EventPayload::Action(action) => action.message_text(),
            EventPayload::Observation(observation) => observation.message_text(),
        }
    }
}
