use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// A block of encoded media emitted by the recorder
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub data: Bytes,
    /// Recording-clock offset in seconds when the chunk was emitted
    pub recording_time_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentUploadStatus {
    Pending,
    Uploading,
    Complete,
    Error,
}

/// A time window of a live recording
#[derive(Debug, Clone)]
pub struct VideoSegment {
    pub id: String,
    /// Sequence number within the recording (0-indexed)
    pub index: usize,
    /// Nominal start, `overlap_secs` before the previous segment was sealed
    pub start_time: f64,
    pub end_time: f64,
    /// Recording time of the first chunk held. Anything earlier lives in older segments.
    pub first_chunk_time: Option<f64>,
    /// Chunks received while the segment was active. Emptied when sealed or pruned.
    pub chunks: Vec<Bytes>,
    /// Concatenated chunks, set once the segment is sealed
    pub blob: Option<Bytes>,
    pub is_active: bool,
    pub upload_status: SegmentUploadStatus,
    pub upload_url: Option<String>,
    pub upload_error: Option<String>,
    /// Bytes were released to bound memory
    pub pruned: bool,
}

impl VideoSegment {
    pub(crate) fn open(index: usize, start_time: f64) -> Self {
        Self {
            id: format!("segment-{:03}-{}", index, uuid::Uuid::new_v4()),
            index,
            start_time,
            end_time: start_time,
            first_chunk_time: None,
            chunks: Vec::new(),
            blob: None,
            is_active: true,
            upload_status: SegmentUploadStatus::Pending,
            upload_url: None,
            upload_error: None,
            pruned: false,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Whether the segment still holds media in memory
    pub fn has_data(&self) -> bool {
        !self.pruned && (self.blob.is_some() || !self.chunks.is_empty())
    }

    pub fn size_bytes(&self) -> usize {
        match &self.blob {
            Some(blob) => blob.len(),
            None => self.chunks.iter().map(Bytes::len).sum(),
        }
    }

    /// Segment bytes: the sealed blob, or the chunks received so far
    pub fn bytes(&self) -> Option<Bytes> {
        if !self.has_data() {
            return None;
        }
        match &self.blob {
            Some(blob) => Some(blob.clone()),
            None => Some(concat(&self.chunks)),
        }
    }

    /// Whether the bytes held reach back to `t`
    pub fn holds_data_from(&self, t: f64) -> bool {
        self.has_data() && self.first_chunk_time.is_some_and(|first| first <= t)
    }

    pub fn covers(&self, start: f64, end: f64) -> bool {
        self.start_time <= start && end <= self.end_time
    }

    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        self.start_time <= end && start <= self.end_time
    }

    pub(crate) fn seal(&mut self) -> Bytes {
        let blob = concat(&self.chunks);
        self.chunks.clear();
        self.blob = Some(blob.clone());
        self.is_active = false;
        blob
    }

    pub(crate) fn release(&mut self) {
        self.chunks = Vec::new();
        self.blob = None;
        self.pruned = true;
    }
}

/// A sealed segment handed to the uploader
#[derive(Debug, Clone)]
pub struct SealedSegment {
    pub id: String,
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub data: Bytes,
}

pub(crate) fn concat(parts: &[Bytes]) -> Bytes {
    match parts {
        [] => Bytes::new(),
        [only] => only.clone(),
        _ => {
            let mut buf = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
            for part in parts {
                buf.extend_from_slice(part);
            }
            buf.freeze()
        }
    }
}
