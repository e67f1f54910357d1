//! Resumable chunked file uploads
//!
//! Splits a file into fixed-size chunks and sends them through a
//! [`ChunkTransport`], persisting the acknowledged set after every chunk in an
//! [`UploadStore`] so a session survives network failures and process restarts.

mod config;
mod error;
mod retry;
mod service;
mod state;
mod store;
mod transport;

pub use config::UploadConfig;
pub use error::{UploadError, UploadResult};
pub use retry::{with_retry, RetryPolicy};
pub use service::{
    ChunkedUploadService, PostProcessor, StageReporter, UploadEvent, UploadRequest,
};
pub use state::{total_chunks, PersistedUploadSummary, UploadProgress, UploadState, UploadStatus};
pub use store::{FileUploadStore, MemoryUploadStore, UploadStore};
pub use transport::{
    AssembleRequest, AssembledUpload, ChunkAck, ChunkRequest, ChunkTransport, HttpTransport,
    HEADER_FILENAME, HEADER_MATCH_ID, HEADER_TOTAL_CHUNKS,
};
