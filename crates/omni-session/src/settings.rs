use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use omni_events::metadata_filename;
use omni_protocol::{FileStore, SessionId, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::SessionError;

pub fn settings_filename(user_id: &str) -> String {
    format!("users/{user_id}/settings.json")
}

/// Per-user preferences persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub language: Option<String>,
    pub agent: Option<String>,
    pub llm_model: Option<String>,
    pub confirmation_mode: bool,
    /// Exported into every sandbox the user starts.
    pub sandbox_env_vars: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn FileStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn load(&self, user_id: &str) -> Result<Option<UserSettings>, SessionError> {
        match self.store.read(&settings_filename(user_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| SessionError::Serialization(err.to_string())),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self, settings))]
    pub async fn save(&self, user_id: &str, settings: &UserSettings) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|err| SessionError::Serialization(err.to_string()))?;
        self.store.write(&settings_filename(user_id), &bytes).await?;
        Ok(())
    }
}

/// Stored beside the event log: `sessions/{sid}/metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    /// User who created the session. Only the owner may attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SessionMetadata {
    pub fn new(session_id: SessionId, owner: Option<String>) -> Self {
        Self {
            session_id,
            owner,
            created_at: Utc::now(),
            selected_repository: None,
            title: None,
        }
    }

    /// Whether `user_id` may attach. Ownerless sessions are open to everyone.
    pub fn allows(&self, user_id: Option<&str>) -> bool {
        match &self.owner {
            Some(owner) => user_id == Some(owner.as_str()),
            None => true,
        }
    }

    pub async fn load(
        store: &dyn FileStore,
        session_id: &SessionId,
    ) -> Result<Option<Self>, SessionError> {
        match store.read(&metadata_filename(session_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| SessionError::Serialization(err.to_string())),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, store: &dyn FileStore) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| SessionError::Serialization(err.to_string()))?;
        store.write(&metadata_filename(&self.session_id), &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use omni_events::InMemoryFileStore;

    use super::*;

    #[tokio::test]
    async fn settings_round_trip_and_absence() -> Result<()> {
        let settings = SettingsStore::new(Arc::new(InMemoryFileStore::new()));
        assert_eq!(settings.load("ada").await?, None);

        let mut stored = UserSettings {
            language: Some("en".into()),
            confirmation_mode: true,
            ..UserSettings::default()
        };
        stored.extra.insert("theme".into(), Value::String("dark".into()));
        settings.save("ada", &stored).await?;
        assert_eq!(settings.load("ada").await?, Some(stored));
        Ok(())
    }

    #[tokio::test]
    async fn metadata_owner_controls_access() -> Result<()> {
        let store = InMemoryFileStore::new();
        let session_id = SessionId::from_string("s1");
        assert_eq!(SessionMetadata::load(&store, &session_id).await?, None);

        let metadata = SessionMetadata::new(session_id.clone(), Some("ada".into()));
        metadata.save(&store).await?;
        let loaded = SessionMetadata::load(&store, &session_id).await?.expect("saved");
        assert!(loaded.allows(Some("ada")));
        assert!(!loaded.allows(Some("bob")));
        assert!(!loaded.allows(None));
        assert!(SessionMetadata::new(session_id, None).allows(Some("anyone")));
        Ok(())
    }
}
