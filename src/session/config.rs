use serde::{Deserialize, Serialize};

use crate::segment::SegmentConfig;

/// Configuration for a live recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Unique recording identifier (e.g., "recording-2025-06-14-final")
    pub recording_id: String,

    /// Match the recording belongs to
    pub match_id: String,

    /// Segment rotation and retention
    pub segments: SegmentConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recording_id: format!("recording-{}", uuid::Uuid::new_v4()),
            match_id: String::new(),
            segments: SegmentConfig::default(),
        }
    }
}
