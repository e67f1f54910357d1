use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::retry::RetryPolicy;

/// Configuration for chunked uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Base URL of the upload server
    pub endpoint: String,

    /// Size of each chunk in bytes
    /// Default: 5 MiB
    pub chunk_size_bytes: u64,

    /// Chunk requests allowed in flight at once (1 = strictly sequential)
    pub max_concurrent_chunks: usize,

    /// Directory holding resumable session records
    pub state_dir: PathBuf,

    /// Per-request timeout for chunk and assemble calls
    pub request_timeout_secs: u64,

    /// Capacity of the event channel handed to callers
    pub event_buffer: usize,

    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8787".to_string(),
            chunk_size_bytes: 5 * 1024 * 1024,
            max_concurrent_chunks: 1,
            state_dir: PathBuf::from(".matchcast/uploads"),
            request_timeout_secs: 120,
            event_buffer: 64,
            retry: RetryPolicy::default(),
        }
    }
}

impl UploadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
