use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics about a live recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    /// Whether chunks are still being received
    pub is_recording: bool,

    /// When the recording started
    pub started_at: DateTime<Utc>,

    /// Recording time covered so far, in seconds
    pub duration_secs: f64,

    /// Media chunks received
    pub chunks_received: usize,

    /// Segments created, including the active one
    pub segments_count: usize,

    /// Segments whose upload succeeded
    pub uploaded_segments: usize,

    /// Segments whose upload failed
    pub failed_segments: usize,
}

/// What a finished recording left behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub recording_id: String,

    pub total_duration_secs: f64,

    /// Sealed segments in recording order
    pub segments: Vec<SegmentSummary>,

    /// URLs of uploaded segments in recording order
    pub uploaded_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub upload_status: crate::segment::SegmentUploadStatus,
    pub upload_url: Option<String>,
}
