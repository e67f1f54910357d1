use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::state::UploadState;

/// Durable key-value storage for upload sessions, keyed by `upload_id`
#[async_trait::async_trait]
pub trait UploadStore: Send + Sync {
    /// Insert or replace the record for `state.upload_id`
    async fn save(&self, state: &UploadState) -> Result<()>;

    async fn load(&self, upload_id: &str) -> Result<Option<UploadState>>;

    /// Remove a record. Deleting a missing record is not an error.
    async fn delete(&self, upload_id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<UploadState>>;
}

/// Stores each session as `<upload_id>.json` in a directory
pub struct FileUploadStore {
    dir: PathBuf,
}

impl FileUploadStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create upload state directory: {:?}", dir))?;

        Ok(Self { dir })
    }

    fn path_for(&self, upload_id: &str) -> Result<PathBuf> {
        if upload_id.is_empty()
            || !upload_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!("Invalid upload id: {:?}", upload_id);
        }
        Ok(self.dir.join(format!("{}.json", upload_id)))
    }
}

#[async_trait::async_trait]
impl UploadStore for FileUploadStore {
    async fn save(&self, state: &UploadState) -> Result<()> {
        let path = self.path_for(&state.upload_id)?;
        let tmp_path = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(state)?;

        // Write-then-rename so a crash never leaves a torn record
        tokio::fs::write(&tmp_path, payload)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to replace {:?}", path))?;

        debug!(
            "Persisted upload {} ({}/{} chunks)",
            state.upload_id,
            state.sent_chunks.len(),
            state.total_chunks
        );
        Ok(())
    }

    async fn load(&self, upload_id: &str) -> Result<Option<UploadState>> {
        let path = self.path_for(upload_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt upload state: {:?}", path))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    async fn delete(&self, upload_id: &str) -> Result<()> {
        let path = self.path_for(upload_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {:?}", path)),
        }
    }

    async fn list(&self) -> Result<Vec<UploadState>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list {:?}", self.dir))?;
        let mut states = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<UploadState>(&bytes) {
                Ok(state) => states.push(state),
                Err(e) => warn!("Skipping unreadable upload state {:?}: {}", path, e),
            }
        }

        states.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.upload_id.cmp(&b.upload_id))
        });
        Ok(states)
    }
}

/// In-process store, for tests and callers that don't need durability
#[derive(Default)]
pub struct MemoryUploadStore {
    states: Mutex<HashMap<String, UploadState>>,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UploadStore for MemoryUploadStore {
    async fn save(&self, state: &UploadState) -> Result<()> {
        let mut states = self.states.lock().await;
        states.insert(state.upload_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, upload_id: &str) -> Result<Option<UploadState>> {
        let states = self.states.lock().await;
        Ok(states.get(upload_id).cloned())
    }

    async fn delete(&self, upload_id: &str) -> Result<()> {
        let mut states = self.states.lock().await;
        states.remove(upload_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<UploadState>> {
        let states = self.states.lock().await;
        let mut all: Vec<UploadState> = states.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.upload_id.cmp(&b.upload_id))
        });
        Ok(all)
    }
}
