use super::storage::ServerStorage;
use crate::upload::AssembledUpload;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Server-side view of one chunked upload
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub match_id: String,
    pub filename: String,
    pub total_chunks: usize,
    pub received: BTreeSet<usize>,
    /// Set once the file has been assembled
    pub assembled: Option<AssembledUpload>,
}

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Uploads seen since startup (upload_id → record)
    pub uploads: Arc<RwLock<HashMap<String, UploadRecord>>>,

    pub storage: Arc<ServerStorage>,
}

impl AppState {
    pub fn new(storage: ServerStorage) -> Self {
        Self {
            uploads: Arc::new(RwLock::new(HashMap::new())),
            storage: Arc::new(storage),
        }
    }
}
