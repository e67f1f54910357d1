use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SegmentConfig;
use super::segment::{concat, SealedSegment, SegmentUploadStatus, VideoSegment};
use super::uploader::SegmentUploader;

/// Rolling in-memory buffer of overlapping live-recording segments.
///
/// Chunks are appended to the active segment. Once it spans
/// `segment_duration_secs` it is sealed, handed to the [`SegmentUploader`] in a
/// background task, and a new segment is opened `overlap_secs` before the
/// sealing time. Only the newest `max_segments` segments keep their bytes.
///
/// Queries are synchronous and only look at memory. Sealing spawns a tokio
/// task, so `add_chunk` and `flush` must be called from within a runtime.
pub struct VideoSegmentBuffer {
    config: SegmentConfig,
    uploader: Arc<dyn SegmentUploader>,
    state: Arc<Mutex<BufferState>>,
    uploads: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct BufferState {
    recording_started_at: Option<DateTime<Utc>>,
    segments: Vec<VideoSegment>,
    next_index: usize,
    last_recording_time: f64,
    /// Bumped on reset so late upload results are dropped
    generation: u64,
}

impl BufferState {
    fn active_mut(&mut self) -> Option<&mut VideoSegment> {
        self.segments.iter_mut().rev().find(|s| s.is_active)
    }

    fn open_segment(&mut self, start_time: f64) {
        let segment = VideoSegment::open(self.next_index, start_time.max(0.0));
        debug!(
            "Opened segment {} at {:.1}s",
            segment.index, segment.start_time
        );
        self.next_index += 1;
        self.segments.push(segment);
    }

    /// Seal the active segment and mark it for upload
    fn seal_active(&mut self) -> Option<SealedSegment> {
        let segment = self.active_mut()?;
        if segment.chunks.is_empty() {
            return None;
        }

        let data = segment.seal();
        segment.upload_status = SegmentUploadStatus::Uploading;

        info!(
            "Segment {} sealed: {:.1}s - {:.1}s ({} bytes)",
            segment.index,
            segment.start_time,
            segment.end_time,
            data.len()
        );

        Some(SealedSegment {
            id: segment.id.clone(),
            index: segment.index,
            start_time: segment.start_time,
            end_time: segment.end_time,
            data,
        })
    }

    /// Release bytes of the oldest sealed segments beyond `max_segments`
    fn prune(&mut self, max_segments: usize) {
        let mut resident = self.segments.iter().filter(|s| s.has_data()).count();

        for segment in self.segments.iter_mut() {
            if resident <= max_segments {
                break;
            }
            if segment.is_active || !segment.has_data() {
                continue;
            }

            info!(
                "Pruning segment {} ({:.1}s - {:.1}s, {} bytes)",
                segment.index,
                segment.start_time,
                segment.end_time,
                segment.size_bytes()
            );
            segment.release();
            resident -= 1;
        }
    }
}

impl VideoSegmentBuffer {
    pub fn new(config: SegmentConfig, uploader: Arc<dyn SegmentUploader>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            uploader,
            state: Arc::new(Mutex::new(BufferState::default())),
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Reset and open the first segment at offset 0
    pub fn start(&self, recording_started_at: DateTime<Utc>) {
        let mut state = self.lock();
        Self::clear(&mut state);
        state.recording_started_at = Some(recording_started_at);
        state.open_segment(0.0);

        info!(
            "Segment buffer started (segments: {}s, overlap: {}s, keep: {})",
            self.config.segment_duration_secs, self.config.overlap_secs, self.config.max_segments
        );
    }

    /// Append a chunk recorded at `recording_time_secs`, rotating segments as needed
    pub fn add_chunk(&self, chunk: Bytes, recording_time_secs: f64) {
        if chunk.is_empty() {
            debug!("Ignoring empty chunk at {:.1}s", recording_time_secs);
            return;
        }

        let sealed = {
            let mut state = self.lock();
            if state.recording_started_at.is_none() {
                warn!("Chunk received before start(); starting recording now");
                state.recording_started_at = Some(Utc::now());
            }
            if state.active_mut().is_none() {
                state.open_segment(recording_time_secs);
            }

            state.last_recording_time = state.last_recording_time.max(recording_time_secs);

            let Some(active) = state.active_mut() else {
                return;
            };
            active.chunks.push(chunk);
            active.first_chunk_time.get_or_insert(recording_time_secs);
            active.end_time = active.end_time.max(recording_time_secs);

            if recording_time_secs - active.start_time >= self.config.segment_duration_secs {
                let sealed = state.seal_active();
                state.open_segment(recording_time_secs - self.config.overlap_secs);
                state.prune(self.config.max_segments);
                sealed.map(|s| (s, state.generation))
            } else {
                None
            }
        };

        if let Some((segment, generation)) = sealed {
            self.spawn_upload(segment, generation);
        }
    }

    /// Seal the active segment now and upload it (manual stop)
    pub fn flush(&self) {
        let sealed = {
            let mut state = self.lock();
            let sealed = state.seal_active();
            // An active segment without chunks has nothing to keep
            state.segments.retain(|s| !(s.is_active && s.chunks.is_empty()));
            state.prune(self.config.max_segments);
            sealed.map(|s| (s, state.generation))
        };

        if let Some((segment, generation)) = sealed {
            self.spawn_upload(segment, generation);
        }
    }

    /// First segment whose `[start_time, end_time + tolerance]` contains `t`
    pub fn get_segment_for_time(&self, t: f64) -> Option<VideoSegment> {
        let state = self.lock();
        state
            .segments
            .iter()
            .find(|s| s.start_time <= t && t <= s.end_time + self.config.lookup_tolerance_secs)
            .cloned()
    }

    /// Bytes covering `[start, end]`.
    ///
    /// Prefers a single sealed segment covering the whole range, then the active
    /// segment if `start` falls inside it, then every resident segment
    /// overlapping the range in order. The first two only count a segment whose
    /// chunks reach back to `start`, since a fresh segment's overlap window holds
    /// no bytes. `None` only when nothing overlaps.
    pub fn get_blob_for_time_range(&self, start: f64, end: f64) -> Option<Bytes> {
        let state = self.lock();

        if let Some(segment) = state
            .segments
            .iter()
            .find(|s| !s.is_active && s.holds_data_from(start) && s.covers(start, end))
        {
            return segment.bytes();
        }

        if let Some(active) = state.segments.iter().find(|s| s.is_active && s.has_data()) {
            if active.holds_data_from(start)
                && start <= active.end_time + self.config.lookup_tolerance_secs
            {
                return active.bytes();
            }
        }

        let parts: Vec<Bytes> = state
            .segments
            .iter()
            .filter(|s| s.overlaps(start, end))
            .filter_map(VideoSegment::bytes)
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(concat(&parts))
        }
    }

    /// Clip window around an event, clamped at the start of the recording
    pub fn clip_around(&self, event_time: f64, before_secs: f64, after_secs: f64) -> Option<Bytes> {
        self.get_blob_for_time_range((event_time - before_secs).max(0.0), event_time + after_secs)
    }

    /// Every resident segment's bytes in chronological order
    pub fn get_all_chunks_combined(&self) -> Option<Bytes> {
        let state = self.lock();
        let parts: Vec<Bytes> = state.segments.iter().filter_map(VideoSegment::bytes).collect();

        if parts.is_empty() {
            None
        } else {
            Some(concat(&parts))
        }
    }

    /// Latest recording time seen, in seconds
    pub fn get_total_duration(&self) -> f64 {
        self.lock().last_recording_time
    }

    /// URLs of successfully uploaded segments, including pruned ones
    pub fn get_uploaded_segment_urls(&self) -> Vec<String> {
        self.lock()
            .segments
            .iter()
            .filter(|s| s.upload_status == SegmentUploadStatus::Complete)
            .filter_map(|s| s.upload_url.clone())
            .collect()
    }

    pub fn segments(&self) -> Vec<VideoSegment> {
        self.lock().segments.clone()
    }

    pub fn recording_started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().recording_started_at
    }

    /// Drop all segments. Uploads still in flight finish but their results are ignored.
    pub fn reset(&self) {
        let mut state = self.lock();
        Self::clear(&mut state);
        debug!("Segment buffer reset");
    }

    /// Wait for every segment upload spawned so far
    pub async fn wait_for_uploads(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *uploads)
            };
            if handles.is_empty() {
                return;
            }

            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Segment upload task panicked: {}", e);
                }
            }
        }
    }

    fn clear(state: &mut BufferState) {
        let generation = state.generation + 1;
        *state = BufferState {
            generation,
            ..BufferState::default()
        };
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_upload(&self, segment: SealedSegment, generation: u64) {
        let uploader = Arc::clone(&self.uploader);
        let state = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            let segment_id = segment.id.clone();
            let index = segment.index;
            let result = uploader.upload(segment).await;

            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != generation {
                debug!("Dropping upload result for segment {} after reset", index);
                return;
            }
            let Some(target) = state.segments.iter_mut().find(|s| s.id == segment_id) else {
                return;
            };

            match result {
                Ok(url) => {
                    info!("Segment {} uploaded: {}", index, url);
                    target.upload_status = SegmentUploadStatus::Complete;
                    target.upload_url = Some(url);
                }
                Err(e) => {
                    error!("Segment {} upload failed: {:#}", index, e);
                    target.upload_status = SegmentUploadStatus::Error;
                    target.upload_error = Some(format!("{:#}", e));
                }
            }
        });

        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        uploads.retain(|h| !h.is_finished());
        uploads.push(handle);
    }
}
