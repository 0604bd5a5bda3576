use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::stream::{BoxStream, StreamExt};
use indexmap::IndexMap;
use omni_protocol::{
    Catalog, Event, EventId, EventSource, FileStore, ProtocolError, SessionId, StoreError,
    SubscriberId,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::file_store::{event_filename, event_id_from_path, events_dir};

pub const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event already carries id {0}; events are appended exactly once")]
    AlreadyAppended(EventId),
    #[error("event stream for session {0} is closed")]
    Closed(SessionId),
    #[error("event stream for session {0} failed after a store error and accepts no more appends")]
    Failed(SessionId),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A listener registered on an [`EventStream`].
///
/// Each subscriber is driven by its own task, so a slow handler delays only
/// its own deliveries.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_event(&self, event: Arc<Event>);
}

#[async_trait]
impl EventHandler for mpsc::UnboundedSender<Arc<Event>> {
    async fn on_event(&self, event: Arc<Event>) {
        let _ = self.send(event);
    }
}

/// One step of a replay-then-live feed.
#[derive(Debug, Clone)]
pub enum FeedItem {
    /// A persisted event that existed when the feed was opened.
    Backlog(Arc<Event>),
    /// Every backlog event has been yielded; live delivery follows.
    CaughtUp,
    Live(Arc<Event>),
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Case-insensitive substring matched against the encoded record.
    pub query: Option<String>,
    /// Wire discriminator, e.g. `run` or `agent_state_changed`.
    pub event_type: Option<String>,
    pub source: Option<EventSource>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl EventFilter {
    fn matches(&self, event: &Event, encoded: &str) -> bool {
        if let Some(event_type) = &self.event_type
            && event.kind_name() != event_type
        {
            return false;
        }
        if let Some(source) = self.source
            && event.source != Some(source)
        {
            return false;
        }
        if let Some(start) = self.start_date
            && event.timestamp.is_none_or(|ts| ts < start)
        {
            return false;
        }
        if let Some(end) = self.end_date
            && event.timestamp.is_none_or(|ts| ts > end)
        {
            return false;
        }
        match &self.query {
            Some(query) => encoded.to_lowercase().contains(&query.to_lowercase()),
            None => true,
        }
    }
}

struct Subscription {
    sender: mpsc::UnboundedSender<Arc<Event>>,
    worker: Option<JoinHandle<()>>,
}

struct StreamInner {
    session_id: SessionId,
    store: Arc<dyn FileStore>,
    catalog: Arc<Catalog>,
    /// Next id to assign. Held for the whole append so writes never interleave.
    next_id: tokio::sync::Mutex<EventId>,
    subscribers: Mutex<IndexMap<SubscriberId, Subscription>>,
    closed: AtomicBool,
    failed: AtomicBool,
}

/// Append-only, replayable log of the events of one session.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

impl EventStream {
    /// Opens the stream for `session_id`, resuming after any persisted events.
    #[instrument(skip(store, catalog), fields(session_id = %session_id))]
    pub async fn open(
        session_id: SessionId,
        store: Arc<dyn FileStore>,
        catalog: Arc<Catalog>,
    ) -> Result<Self, StreamError> {
        let next_id = match store.list(&events_dir(&session_id)).await {
            Ok(paths) => paths
                .iter()
                .filter_map(|path| event_id_from_path(path))
                .max()
                .map_or(0, |latest| latest + 1),
            Err(StoreError::NotFound(_)) => 0,
            Err(err) => return Err(err.into()),
        };
        debug!(next_id, "event stream opened");
        Ok(Self {
            inner: Arc::new(StreamInner {
                session_id,
                store,
                catalog,
                next_id: tokio::sync::Mutex::new(next_id),
                subscribers: Mutex::new(IndexMap::new()),
                closed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    /// Assigns the next id, stamps timestamp and source, persists the event and
    /// queues it for every subscriber in registration order.
    #[instrument(
        skip(self, event),
        fields(session_id = %self.inner.session_id, kind = event.kind_name(), %source)
    )]
    pub async fn append(
        &self,
        mut event: Event,
        source: EventSource,
    ) -> Result<EventId, StreamError> {
        if let Some(id) = event.id {
            return Err(StreamError::AlreadyAppended(id));
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed(self.inner.session_id.clone()));
        }

        let mut next_id = self.inner.next_id.lock().await;
        if self.inner.failed.load(Ordering::Acquire) {
            return Err(StreamError::Failed(self.inner.session_id.clone()));
        }
        let id = *next_id;
        event.id = Some(id);
        event.timestamp = Some(Utc::now());
        event.source = Some(source);

        let encoded = self.inner.catalog.encode(&event)?;
        let bytes = serde_json::to_vec(&encoded)
            .map_err(|err| ProtocolError::Serialization(err.to_string()))?;
        if let Err(err) = self
            .inner
            .store
            .write(&event_filename(&self.inner.session_id, id), &bytes)
            .await
        {
            self.inner.failed.store(true, Ordering::Release);
            error!(
                event_id = id,
                error = %err,
                "event store write failed; stream stops accepting appends"
            );
            return Err(err.into());
        }
        *next_id = id + 1;

        let event = Arc::new(event);
        for subscription in self.inner.subscribers.lock().values() {
            let _ = subscription.sender.send(event.clone());
        }
        drop(next_id);
        debug!(event_id = id, "event appended");
        Ok(id)
    }

    /// Registers `handler` under `subscriber_id`, replacing any previous handler
    /// registered under the same id. Must be called from within a tokio runtime.
    pub fn subscribe(&self, subscriber_id: SubscriberId, handler: Arc<dyn EventHandler>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<Event>>();
        let label = subscriber_id.clone();
        let session_id = self.inner.session_id.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let delivery = AssertUnwindSafe(handler.on_event(event.clone())).catch_unwind();
                if delivery.await.is_err() {
                    error!(
                        session_id = %session_id,
                        subscriber = %label,
                        event_id = ?event.id,
                        "event handler panicked"
                    );
                }
            }
        });

        let previous = self.inner.subscribers.lock().insert(
            subscriber_id.clone(),
            Subscription {
                sender,
                worker: Some(worker),
            },
        );
        if previous.is_some() {
            warn!(
                session_id = %self.inner.session_id,
                subscriber = %subscriber_id,
                "subscriber re-registered; previous handler replaced"
            );
        }
    }

    /// Removes a subscriber. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, subscriber_id: &SubscriberId) -> bool {
        let removed = self.inner.subscribers.lock().shift_remove(subscriber_id);
        if removed.is_none() {
            warn!(
                session_id = %self.inner.session_id,
                subscriber = %subscriber_id,
                "unsubscribe for unknown subscriber"
            );
        }
        removed.is_some()
    }

    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.inner.subscribers.lock().keys().cloned().collect()
    }

    /// Id of the most recently appended event.
    pub async fn latest_event_id(&self) -> Option<EventId> {
        self.head().await.checked_sub(1)
    }

    async fn head(&self) -> EventId {
        *self.inner.next_id.lock().await
    }

    pub async fn get_event(&self, id: EventId) -> Result<Option<Event>, StreamError> {
        let path = event_filename(&self.inner.session_id, id);
        let bytes = match self.inner.store.read(&path).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|err| ProtocolError::malformed(format!("{path}: {err}")))?;
        Ok(Some(self.inner.catalog.decode(&value)?))
    }

    /// Persisted events with id `>= start`, up to the latest event at the time
    /// the sequence is first polled. Nothing is read until then.
    pub fn read_from(&self, start: EventId) -> BoxStream<'static, Result<Event, StreamError>> {
        let this = self.clone();
        Box::pin(try_stream! {
            let head = this.head().await;
            for id in start..head {
                if let Some(event) = this.get_event(id).await? {
                    yield event;
                }
            }
        })
    }

    /// Persisted events with id `>= start` followed by live events, with no
    /// gap or duplicate between the two.
    pub async fn subscribe_from(
        &self,
        start: EventId,
    ) -> Result<BoxStream<'static, Result<FeedItem, StreamError>>, StreamError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed(self.inner.session_id.clone()));
        }
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<Event>>();
        let feed_id = SubscriberId::from_string(format!("feed-{}", uuid::Uuid::new_v4().simple()));

        // Registering while holding the append lock splits the log exactly:
        // ids below `head` are persisted, ids from `head` on arrive on `receiver`.
        let head = {
            let next_id = self.inner.next_id.lock().await;
            self.inner.subscribers.lock().insert(
                feed_id.clone(),
                Subscription {
                    sender,
                    worker: None,
                },
            );
            *next_id
        };

        let guard = FeedGuard {
            inner: self.inner.clone(),
            id: feed_id,
        };
        let this = self.clone();
        let live_from = start.max(head);
        Ok(Box::pin(try_stream! {
            let _guard = guard;
            for id in start..head {
                match this.get_event(id).await? {
                    Some(event) => yield FeedItem::Backlog(Arc::new(event)),
                    None => warn!(event_id = id, "persisted event missing during replay"),
                }
            }
            yield FeedItem::CaughtUp;
            while let Some(event) = receiver.recv().await {
                if event.id.is_some_and(|id| id >= live_from) {
                    yield FeedItem::Live(event);
                }
            }
        }))
    }

    /// Events matching `filter`, starting at `start`, at most `limit` of them.
    pub async fn search(
        &self,
        filter: &EventFilter,
        start: EventId,
        limit: usize,
    ) -> Result<Vec<Event>, StreamError> {
        if !(1..=MAX_SEARCH_LIMIT).contains(&limit) {
            return Err(StreamError::InvalidQuery(format!(
                "limit must be between 1 and {MAX_SEARCH_LIMIT}, got {limit}"
            )));
        }
        let mut matches = Vec::new();
        let mut events = self.read_from(start);
        while let Some(event) = events.next().await {
            let event = event?;
            let encoded = self.inner.catalog.encode(&event)?.to_string();
            if filter.matches(&event, &encoded) {
                matches.push(event);
                if matches.len() >= limit {
                    break;
                }
            }
        }
        Ok(matches)
    }

    /// Drops every subscriber and rejects further appends. Persisted history
    /// is untouched.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.inner.subscribers.lock().drain(..).collect();
        for (id, subscription) in drained {
            drop(subscription.sender);
            if let Some(worker) = subscription.worker {
                debug!(subscriber = %id, finished = worker.is_finished(), "subscriber released");
            }
        }
        debug!(session_id = %self.inner.session_id, "event stream closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

struct FeedGuard {
    inner: Arc<StreamInner>,
    id: SubscriberId,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.inner.subscribers.lock().shift_remove(&self.id);
    }
}
