use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Segment rotation configuration for live recordings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Recording time covered by one segment before it is sealed
    /// Default: 300 seconds (5 minutes)
    pub segment_duration_secs: f64,

    /// Time shared by consecutive segments
    /// Default: 60 seconds
    pub overlap_secs: f64,

    /// Segments kept in memory; older ones have their bytes released
    pub max_segments: usize,

    /// Slack past a segment's end accepted by time lookups
    pub lookup_tolerance_secs: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: 300.0,
            overlap_secs: 60.0,
            max_segments: 3,
            lookup_tolerance_secs: 5.0,
        }
    }
}

impl SegmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segment_duration_secs <= 0.0 {
            anyhow::bail!("segment_duration_secs must be positive");
        }
        if self.overlap_secs < 0.0 || self.overlap_secs >= self.segment_duration_secs {
            anyhow::bail!(
                "overlap_secs ({}) must be in [0, segment_duration_secs ({}))",
                self.overlap_secs,
                self.segment_duration_secs
            );
        }
        if self.max_segments == 0 {
            anyhow::bail!("max_segments must be at least 1");
        }
        Ok(())
    }
}
