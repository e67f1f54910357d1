use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::segment::SealedSegment;

pub const HEADER_START_TIME: &str = "x-start-time";
pub const HEADER_END_TIME: &str = "x-end-time";

/// Receives each sealed segment. Returns the URL the segment is reachable at.
#[async_trait::async_trait]
pub trait SegmentUploader: Send + Sync {
    async fn upload(&self, segment: SealedSegment) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSegment {
    pub url: String,
}

/// Uploads segments to the REST server in [`crate::http`]
pub struct HttpSegmentUploader {
    client: reqwest::Client,
    endpoint: String,
    recording_id: String,
}

impl HttpSegmentUploader {
    pub fn new(
        endpoint: impl Into<String>,
        recording_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            recording_id: recording_id.into(),
        })
    }
}

#[async_trait::async_trait]
impl SegmentUploader for HttpSegmentUploader {
    async fn upload(&self, segment: SealedSegment) -> Result<String> {
        let url = format!(
            "{}/recordings/{}/segments/{}",
            self.endpoint, self.recording_id, segment.id
        );
        debug!("PUT {} ({} bytes)", url, segment.data.len());

        let stored: StoredSegment = self
            .client
            .put(&url)
            .header(HEADER_START_TIME, segment.start_time.to_string())
            .header(HEADER_END_TIME, segment.end_time.to_string())
            .body(segment.data)
            .send()
            .await
            .with_context(|| format!("Failed to upload segment {}", segment.id))?
            .error_for_status()?
            .json()
            .await
            .context("Malformed segment upload response")?;

        Ok(stored.url)
    }
}
