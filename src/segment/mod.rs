//! Live recording segment buffer
//!
//! Turns a stream of small media chunks into overlapping, bounded segments
//! that are uploaded as they are sealed and can be queried by recording time
//! for clip extraction.

mod buffer;
mod config;
mod segment;
mod uploader;

pub use buffer::VideoSegmentBuffer;
pub use config::SegmentConfig;
pub use segment::{MediaChunk, SealedSegment, SegmentUploadStatus, VideoSegment};
pub use uploader::{
    HttpSegmentUploader, SegmentUploader, StoredSegment, HEADER_END_TIME, HEADER_START_TIME,
};
