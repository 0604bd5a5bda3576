use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use omni_events::{EventStream, FeedItem};
use omni_protocol::{
    Action, AgentState, ConnectionId, Event, EventId, EventSource, Observation, SessionId,
};
use omni_runtime::Runtime;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{SessionEntry, SessionError};

/// One client's handle on a live session.
///
/// Dropping a conversation does not release it; call [`detach`](Self::detach).
pub struct Conversation {
    pub(crate) entry: Arc<SessionEntry>,
    pub(crate) connection_id: ConnectionId,
    pub(crate) user_id: Option<String>,
    pub(crate) detached: AtomicBool,
}

impl Conversation {
    pub(crate) fn new(entry: Arc<SessionEntry>, user_id: Option<String>) -> Self {
        Self {
            entry,
            connection_id: ConnectionId::new_uuid(),
            user_id,
            detached: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.entry.stream.session_id()
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.entry.runtime
    }

    pub fn stream(&self) -> &EventStream {
        &self.entry.stream
    }

    /// Decodes a wire action record sent by the client and appends it as a
    /// user event.
    #[instrument(skip(self, raw), fields(session_id = %self.session_id()))]
    pub async fn send(&self, raw: &Value) -> Result<EventId, SessionError> {
        // Client-supplied envelope fields other than tool call metadata are
        // reassigned at append.
        let decoded = self.entry.stream.catalog().decode(raw)?;
        let Some(action) = decoded.as_action().cloned() else {
            return Err(SessionError::NotAnAction(decoded.kind_name().to_owned()));
        };
        let event = Event::action(action).with_tool_call_metadata(decoded.tool_call_metadata);
        let id = self.entry.stream.append(event, EventSource::User).await?;
        debug!(event_id = id, "client action appended");
        Ok(id)
    }

    pub async fn send_action(&self, action: Action) -> Result<EventId, SessionError> {
        let id = self
            .entry
            .stream
            .append(Event::action(action), EventSource::User)
            .await?;
        debug!(event_id = id, "client action appended");
        Ok(id)
    }

    /// Waits up to `limit` for the observation caused by action `cause`.
    /// `None` when none arrived in time.
    pub async fn wait_for_observation(
        &self,
        cause: EventId,
        limit: Duration,
    ) -> Result<Option<Arc<Event>>, SessionError> {
        let mut feed = self.entry.stream.subscribe_from(cause + 1).await?;
        let reply = async {
            while let Some(item) = feed.next().await {
                match item? {
                    FeedItem::Backlog(event) | FeedItem::Live(event)
                        if event.cause == Some(cause) =>
                    {
                        return Ok(Some(event));
                    }
                    _ => {}
                }
            }
            Ok::<_, SessionError>(None)
        };
        match tokio::time::timeout(limit, reply).await {
            Ok(found) => found,
            Err(_) => {
                debug!(cause, "no observation before the wait limit");
                Ok(None)
            }
        }
    }

    /// Every event after `last_seen`, then live events.
    ///
    /// Backlog `agent_state_changed` events other than `init` are held back
    /// until the backlog is exhausted and then delivered in order, preceded by
    /// an `init` marker when none was replayed. The marker is synthesised and
    /// carries no id.
    pub async fn events(
        &self,
        last_seen: Option<EventId>,
    ) -> Result<BoxStream<'static, Result<Arc<Event>, SessionError>>, SessionError> {
        let start = last_seen.map_or(0, |id| id + 1);
        let mut feed = self.entry.stream.subscribe_from(start).await?;
        Ok(Box::pin(try_stream! {
            let mut deferred: Vec<Arc<Event>> = Vec::new();
            let mut init_seen = false;
            while let Some(item) = feed.next().await {
                match item? {
                    FeedItem::Backlog(event) => match agent_state_of(&event) {
                        Some(AgentState::Init) => {
                            init_seen = true;
                            yield event;
                        }
                        Some(_) => deferred.push(event),
                        None => yield event,
                    },
                    FeedItem::CaughtUp => {
                        if !deferred.is_empty() && !init_seen {
                            yield Arc::new(init_marker());
                        }
                        for event in deferred.drain(..) {
                            yield event;
                        }
                    }
                    FeedItem::Live(event) => yield event,
                }
            }
        }))
    }

    /// Releases this connection. The runtime detaches in the background once
    /// no connection remains. Idempotent.
    pub fn detach(&self) {
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.entry.release(&self.connection_id);
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

fn agent_state_of(event: &Event) -> Option<AgentState> {
    event.as_observation().and_then(Observation::agent_state)
}

fn init_marker() -> Event {
    let mut marker = Event::observation(Observation::agent_state_changed(AgentState::Init));
    marker.source = Some(EventSource::Environment);
    marker
}
