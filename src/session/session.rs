use super::config::SessionConfig;
use super::stats::{RecordingSummary, SegmentSummary, SessionStats};
use crate::segment::{MediaChunk, SegmentUploadStatus, SegmentUploader, VideoSegmentBuffer};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

/// A live recording that feeds recorder chunks into a segment buffer
pub struct LiveSession {
    /// Session configuration
    config: SessionConfig,

    /// Segment buffer, shared with clip extraction consumers
    buffer: Arc<VideoSegmentBuffer>,

    /// When the session was created
    started_at: DateTime<Utc>,

    /// Whether chunks are currently being consumed
    is_recording: Arc<AtomicBool>,

    /// Number of chunks received
    chunks_received: Arc<AtomicUsize>,

    /// Wakes `record` when `stop` is called
    stop_signal: Arc<Notify>,
}

impl LiveSession {
    /// Create a new live session
    pub fn new(config: SessionConfig, uploader: Arc<dyn SegmentUploader>) -> Result<Self> {
        info!("Creating live session: {}", config.recording_id);

        let buffer = VideoSegmentBuffer::new(config.segments.clone(), uploader)
            .context("Invalid segment configuration")?;

        Ok(Self {
            config,
            buffer: Arc::new(buffer),
            started_at: Utc::now(),
            is_recording: Arc::new(AtomicBool::new(false)),
            chunks_received: Arc::new(AtomicUsize::new(0)),
            stop_signal: Arc::new(Notify::new()),
        })
    }

    pub fn recording_id(&self) -> &str {
        &self.config.recording_id
    }

    /// Handle for time-range queries while recording
    pub fn buffer(&self) -> Arc<VideoSegmentBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Consume chunks until the sender closes or `stop` is called.
    ///
    /// On exit the active segment is flushed and all segment uploads are awaited.
    pub async fn record(&self, mut chunk_rx: mpsc::Receiver<MediaChunk>) -> Result<RecordingSummary> {
        if self.is_recording.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Recording {} already started", self.config.recording_id);
        }

        info!(
            "Starting live recording {} for match {}",
            self.config.recording_id, self.config.match_id
        );
        self.buffer.start(self.started_at);

        loop {
            let chunk = tokio::select! {
                chunk = chunk_rx.recv() => chunk,
                _ = self.stop_signal.notified() => {
                    info!("Stop requested for recording {}", self.config.recording_id);
                    None
                }
            };
            let Some(chunk) = chunk else {
                break;
            };

            self.buffer.add_chunk(chunk.data, chunk.recording_time_secs);
            self.chunks_received.fetch_add(1, Ordering::SeqCst);
        }

        self.buffer.flush();
        self.buffer.wait_for_uploads().await;
        self.is_recording.store(false, Ordering::SeqCst);

        let summary = self.summary();
        let failed = summary
            .segments
            .iter()
            .filter(|s| s.upload_status == SegmentUploadStatus::Error)
            .count();
        if failed > 0 {
            warn!(
                "Recording {}: {} segment upload(s) failed",
                self.config.recording_id, failed
            );
        }

        info!(
            "Live recording complete: {} ({:.1}s, {} segments)",
            self.config.recording_id,
            summary.total_duration_secs,
            summary.segments.len()
        );

        Ok(summary)
    }

    /// Stop recording (called externally while `record` runs in the background)
    pub fn stop(&self) {
        if !self.is_recording.load(Ordering::SeqCst) {
            warn!("Recording not active");
            return;
        }
        self.stop_signal.notify_one();
    }

    /// Get current session statistics
    pub fn get_stats(&self) -> SessionStats {
        let segments = self.buffer.segments();

        SessionStats {
            is_recording: self.is_recording.load(Ordering::SeqCst),
            started_at: self.started_at,
            duration_secs: self.buffer.get_total_duration(),
            chunks_received: self.chunks_received.load(Ordering::SeqCst),
            segments_count: segments.len(),
            uploaded_segments: segments
                .iter()
                .filter(|s| s.upload_status == SegmentUploadStatus::Complete)
                .count(),
            failed_segments: segments
                .iter()
                .filter(|s| s.upload_status == SegmentUploadStatus::Error)
                .count(),
        }
    }

    fn summary(&self) -> RecordingSummary {
        let segments = self
            .buffer
            .segments()
            .into_iter()
            .filter(|s| !s.is_active)
            .map(|s| SegmentSummary {
                index: s.index,
                start_time: s.start_time,
                end_time: s.end_time,
                upload_status: s.upload_status,
                upload_url: s.upload_url,
            })
            .collect();

        RecordingSummary {
            recording_id: self.config.recording_id.clone(),
            total_duration_secs: self.buffer.get_total_duration(),
            segments,
            uploaded_urls: self.buffer.get_uploaded_segment_urls(),
        }
    }
}
