//! Storage port for persisted session data.
//!
//! The event stream, session metadata and settings are all written through
//! a [`FileStore`]. Implementations only need a narrow path-keyed contract;
//! the one hard requirement is that a missing path surfaces as
//! [`StoreError::NotFound`], which callers use to tell "absent" from "broken".
//!
//! Object-safety note: the trait uses `async-trait` for async dyn-dispatch.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid store path: {0}")]
    InvalidPath(String),
    #[error("store io error at {path}: {message}")]
    Io { path: String, message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), StoreError>;

    /// Immediate children of `prefix`. Directory entries end with `/`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Removes `path` and everything beneath it. Missing paths are not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn read_to_string(&self, path: &str) -> Result<String, StoreError> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).map_err(|err| StoreError::Io {
            path: path.to_owned(),
            message: err.to_string(),
        })
    }
}
