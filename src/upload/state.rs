use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;

/// Lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Paused,
    Assembling,
    Converting,
    Extracting,
    Segmenting,
    Transcribing,
    Complete,
    Error,
}

impl UploadStatus {
    /// Post-assembly stages reported by a [`PostProcessor`](super::PostProcessor)
    pub fn is_processing_stage(self) -> bool {
        matches!(
            self,
            UploadStatus::Converting
                | UploadStatus::Extracting
                | UploadStatus::Segmenting
                | UploadStatus::Transcribing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Error)
    }
}

/// State of one upload session. This is also the record written to durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadState {
    pub upload_id: String,
    pub match_id: String,
    pub filename: String,
    pub total_bytes: u64,
    /// Fixed for the life of the session so persisted indices stay valid
    pub chunk_size: u64,
    pub total_chunks: usize,
    /// Acknowledged chunk indices
    pub sent_chunks: BTreeSet<usize>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadState {
    pub fn new(
        upload_id: String,
        match_id: String,
        filename: String,
        total_bytes: u64,
        chunk_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id,
            match_id,
            filename,
            total_bytes,
            chunk_size,
            total_chunks: total_chunks(total_bytes, chunk_size),
            sent_chunks: BTreeSet::new(),
            status: UploadStatus::Uploading,
            created_at: now,
            updated_at: now,
        }
    }

    /// Byte range of chunk `index` within the file
    pub fn chunk_range(&self, index: usize) -> Range<usize> {
        let start = (index as u64 * self.chunk_size).min(self.total_bytes);
        let end = (start + self.chunk_size).min(self.total_bytes);
        start as usize..end as usize
    }

    pub fn chunk_len(&self, index: usize) -> u64 {
        let range = self.chunk_range(index);
        (range.end - range.start) as u64
    }

    /// Sum of acknowledged chunk sizes
    pub fn uploaded_bytes(&self) -> u64 {
        self.sent_chunks.iter().map(|&i| self.chunk_len(i)).sum()
    }

    /// Chunk indices not yet acknowledged, lowest first
    pub fn pending_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.sent_chunks.contains(i))
            .collect()
    }

    pub fn next_pending_chunk(&self) -> Option<usize> {
        (0..self.total_chunks).find(|i| !self.sent_chunks.contains(i))
    }

    pub fn all_chunks_sent(&self) -> bool {
        self.sent_chunks.len() == self.total_chunks
    }

    /// Record an acknowledgment. Returns false for out-of-range or duplicate indices.
    pub fn acknowledge(&mut self, index: usize) -> bool {
        if index >= self.total_chunks {
            return false;
        }
        let inserted = self.sent_chunks.insert(index);
        if inserted {
            self.updated_at = Utc::now();
        }
        inserted
    }

    pub fn set_status(&mut self, status: UploadStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn progress(&self) -> UploadProgress {
        let uploaded_bytes = self.uploaded_bytes();
        let fraction = if self.total_bytes == 0 {
            0.0
        } else {
            uploaded_bytes as f64 / self.total_bytes as f64
        };

        UploadProgress {
            upload_id: self.upload_id.clone(),
            status: self.status,
            sent_chunks: self.sent_chunks.len(),
            total_chunks: self.total_chunks,
            uploaded_bytes,
            total_bytes: self.total_bytes,
            fraction,
        }
    }

    pub fn summary(&self) -> PersistedUploadSummary {
        PersistedUploadSummary {
            upload_id: self.upload_id.clone(),
            filename: self.filename.clone(),
            sent_chunks: self.sent_chunks.len(),
            total_chunks: self.total_chunks,
            status: self.status,
            updated_at: self.updated_at,
        }
    }
}

/// Number of chunks needed to cover `total_bytes`
pub fn total_chunks(total_bytes: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total_bytes.div_ceil(chunk_size) as usize
}

/// Progress snapshot delivered after every acknowledged chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub upload_id: String,
    pub status: UploadStatus,
    pub sent_chunks: usize,
    pub total_chunks: usize,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// `uploaded_bytes / total_bytes`, never decreasing within a session
    pub fraction: f64,
}

/// A resumable session found in durable storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedUploadSummary {
    pub upload_id: String,
    pub filename: String,
    pub sent_chunks: usize,
    pub total_chunks: usize,
    pub status: UploadStatus,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(total_bytes: u64, chunk_size: u64) -> UploadState {
        UploadState::new(
            "upload-1".to_string(),
            "match-1".to_string(),
            "game.mp4".to_string(),
            total_bytes,
            chunk_size,
        )
    }

    #[test]
    fn last_chunk_may_be_shorter() {
        let s = state(25, 10);
        assert_eq!(s.total_chunks, 3);
        assert_eq!(s.chunk_range(0), 0..10);
        assert_eq!(s.chunk_range(2), 20..25);
        assert_eq!(s.chunk_len(2), 5);
    }

    #[test]
    fn uploaded_bytes_follow_acknowledgments() {
        let mut s = state(25, 10);
        assert!(s.acknowledge(2));
        assert!(s.acknowledge(0));
        assert!(!s.acknowledge(0), "duplicate ack must be ignored");
        assert!(!s.acknowledge(3), "out of range ack must be ignored");

        assert_eq!(s.uploaded_bytes(), 15);
        assert_eq!(s.pending_chunks(), vec![1]);
        assert_eq!(s.next_pending_chunk(), Some(1));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&UploadStatus::Transcribing).unwrap();
        assert_eq!(json, "\"transcribing\"");
    }
}
