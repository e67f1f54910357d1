pub mod config;
pub mod http;
pub mod segment;
pub mod session;
pub mod upload;

pub use config::Config;
pub use http::{create_router, AppState, ServerStorage};
pub use segment::{
    HttpSegmentUploader, MediaChunk, SegmentConfig, SegmentUploadStatus, SegmentUploader,
    VideoSegment, VideoSegmentBuffer,
};
pub use session::{LiveSession, RecordingSummary, SessionConfig, SessionStats};
pub use upload::{
    ChunkTransport, ChunkedUploadService, FileUploadStore, HttpTransport, MemoryUploadStore,
    UploadConfig, UploadError, UploadEvent, UploadRequest, UploadState, UploadStatus, UploadStore,
};
