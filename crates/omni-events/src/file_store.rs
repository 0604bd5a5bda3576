use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use omni_protocol::{EventId, FileStore, SessionId, StoreError};
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, instrument};

pub fn session_dir(session_id: &SessionId) -> String {
    format!("sessions/{session_id}/")
}

pub fn events_dir(session_id: &SessionId) -> String {
    format!("sessions/{session_id}/events/")
}

pub fn event_filename(session_id: &SessionId, id: EventId) -> String {
    format!("sessions/{session_id}/events/{id}.json")
}

pub fn metadata_filename(session_id: &SessionId) -> String {
    format!("sessions/{session_id}/metadata.json")
}

/// Parses the event id out of a path produced by [`event_filename`].
pub fn event_id_from_path(path: &str) -> Option<EventId> {
    path.rsplit('/')
        .next()?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Whether any history has been persisted for `session_id`.
pub async fn session_exists(
    store: &dyn FileStore,
    session_id: &SessionId,
) -> Result<bool, StoreError> {
    match store.list(&session_dir(session_id)).await {
        Ok(entries) => Ok(!entries.is_empty()),
        Err(StoreError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

fn io_error(path: &str, err: std::io::Error) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(path.to_owned())
    } else {
        StoreError::Io {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Store rooted at a directory on the local disk.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return Err(StoreError::InvalidPath(path.to_owned()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path, display: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(display, err))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve(path)?;
        fs::read(&full).await.map_err(|err| io_error(path, err))
    }

    #[instrument(skip(self, content), fields(bytes = content.len()))]
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full, path).await?;
        fs::write(&full, content)
            .await
            .map_err(|err| io_error(path, err))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let full = self.resolve(prefix)?;
        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|err| io_error(prefix, err))?;
        let base = prefix.trim_end_matches('/');
        let mut out = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| io_error(prefix, err))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            let suffix = if is_dir { "/" } else { "" };
            out.insert(format!("{base}/{name}{suffix}"));
        }
        Ok(out.into_iter().collect())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        let result = match fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full).await,
            Ok(_) => fs::remove_file(&full).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                debug!(path, "store path deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(path, err)),
        }
    }
}

/// Process-local store, used by tests and ephemeral deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileStore {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(path: &str) -> String {
        path.trim_start_matches('/').to_owned()
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.files
            .lock()
            .get(&Self::normalize(path))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_owned()))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        self.files
            .lock()
            .insert(Self::normalize(path), content.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut prefix = Self::normalize(prefix);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        let files = self.files.lock();
        let mut out = BTreeSet::new();
        for key in files.keys().filter(|key| key.starts_with(&prefix)) {
            let rest = &key[prefix.len()..];
            match rest.split_once('/') {
                Some((dir, _)) => out.insert(format!("{prefix}{dir}/")),
                None => out.insert(key.clone()),
            };
        }
        if out.is_empty() {
            return Err(StoreError::NotFound(prefix));
        }
        Ok(out.into_iter().collect())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let path = Self::normalize(path);
        let dir = if path.ends_with('/') {
            path.clone()
        } else {
            format!("{path}/")
        };
        self.files
            .lock()
            .retain(|key, _| key != &path && !key.starts_with(&dir));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use omni_protocol::{FileStore, SessionId, StoreError};

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn exercise(store: &dyn FileStore) -> Result<()> {
        let session_id = SessionId::from_string("abc");
        assert!(!session_exists(store, &session_id).await?);
        assert!(matches!(
            store.read(&event_filename(&session_id, 0)).await,
            Err(StoreError::NotFound(_))
        ));

        store.write(&event_filename(&session_id, 0), b"{}").await?;
        store.write(&event_filename(&session_id, 1), b"{}").await?;
        store.write(&metadata_filename(&session_id), b"{}").await?;
        assert!(session_exists(store, &session_id).await?);

        let listed = store.list(&events_dir(&session_id)).await?;
        let mut ids: Vec<_> = listed.iter().filter_map(|p| event_id_from_path(p)).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);

        let top = store.list(&session_dir(&session_id)).await?;
        assert!(top.contains(&"sessions/abc/events/".to_owned()));
        assert!(top.contains(&"sessions/abc/metadata.json".to_owned()));

        store.delete(&session_dir(&session_id)).await?;
        assert!(!session_exists(store, &session_id).await?);
        store.delete(&session_dir(&session_id)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn local_store_honours_the_contract() -> Result<()> {
        let root = unique_test_root("omni-local-store");
        exercise(&LocalFileStore::new(&root)).await?;
        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_store_honours_the_contract() -> Result<()> {
        exercise(&InMemoryFileStore::new()).await
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_paths() -> Result<()> {
        let store = LocalFileStore::new(unique_test_root("omni-local-escape"));
        let err = store.write("../outside.json", b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(_)));
        Ok(())
    }

    #[test]
    fn event_ids_parse_from_paths() {
        assert_eq!(event_id_from_path("sessions/a/events/42.json"), Some(42));
        assert_eq!(event_id_from_path("sessions/a/events/notes.txt"), None);
    }
}
