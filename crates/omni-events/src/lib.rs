mod file_store;
mod stream;

pub use file_store::{
    InMemoryFileStore, LocalFileStore, event_filename, event_id_from_path, events_dir,
    metadata_filename, session_dir, session_exists,
};
pub use stream::{EventFilter, EventHandler, EventStream, FeedItem, MAX_SEARCH_LIMIT, StreamError};
