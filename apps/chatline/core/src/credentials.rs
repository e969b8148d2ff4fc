//! Persistence of the opaque per-session credential blob.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

const CREDENTIALS_FILE: &str = "creds.json";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid session id `{0}`")]
    InvalidSessionId(String),
    #[error("credential io failed: {0}")]
    Io(#[from] io::Error),
    #[error("credential blob is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Value>, CredentialError>;

    async fn save(&self, session_id: &str, credentials: &Value) -> Result<(), CredentialError>;
}

/// Keeps `<root>/<session_id>/creds.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    /// Creates the root directory if it does not exist yet.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, CredentialError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }
}

pub fn validate_session_id(session_id: &str) -> Result<(), CredentialError> {
    let escapes = session_id.is_empty()
        || session_id.contains('/')
        || session_id.contains('\\')
        || session_id.contains("..")
        || session_id.contains('\0');
    if escapes {
        return Err(CredentialError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, session_id: &str) -> Result<Option<Value>, CredentialError> {
        let path = self.session_dir(session_id)?.join(CREDENTIALS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, session_id: &str, credentials: &Value) -> Result<(), CredentialError> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let bytes = serde_json::to_vec(credentials)?;
        let tmp = dir.join(format!("{CREDENTIALS_FILE}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, dir.join(CREDENTIALS_FILE)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        debug!(session_id = %session_id, bytes = bytes.len(), "credentials saved");
        Ok(())
    }
}

/// Process-local store for tests and throwaway development sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    blobs: Mutex<HashMap<String, Value>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Value> {
        self.blobs.lock().get(session_id).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, session_id: &str) -> Result<Option<Value>, CredentialError> {
        validate_session_id(session_id)?;
        Ok(self.get(session_id))
    }

    async fn save(&self, session_id: &str, credentials: &Value) -> Result<(), CredentialError> {
        validate_session_id(session_id)?;
        self.blobs
            .lock()
            .insert(session_id.to_string(), credentials.clone());
        Ok(())
    }
}
