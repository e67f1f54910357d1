use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::error::{UploadError, UploadResult};

pub const HEADER_TOTAL_CHUNKS: &str = "x-total-chunks";
pub const HEADER_MATCH_ID: &str = "x-match-id";
pub const HEADER_FILENAME: &str = "x-filename";

/// One chunk on its way to the server
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub match_id: String,
    pub filename: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub data: Bytes,
}

/// Server acknowledgment for a stored chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub upload_id: String,
    pub chunk_index: usize,
    pub received_chunks: usize,
}

/// Body of the final "assemble" call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembleRequest {
    pub filename: String,
    pub match_id: String,
    pub total_chunks: usize,
    pub total_bytes: u64,
}

/// Result of server-side concatenation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledUpload {
    pub upload_id: String,
    pub file_url: String,
    pub size_bytes: u64,
}

/// Network seam of the upload engine
///
/// Implementations must be idempotent per `(upload_id, chunk_index)`: a chunk
/// may be sent more than once after a retry or a resume.
#[async_trait::async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn send_chunk(&self, chunk: ChunkRequest) -> UploadResult<ChunkAck>;

    async fn assemble(
        &self,
        upload_id: &str,
        request: AssembleRequest,
    ) -> UploadResult<AssembledUpload>;
}

/// Talks to the REST endpoints served by [`crate::http`]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> UploadResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::from_status(status.as_u16(), body.trim()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UploadError::Protocol(format!("Malformed server response: {}", e)))
    }
}

fn transport_error(err: reqwest::Error) -> UploadError {
    match err.status() {
        Some(status) => UploadError::from_status(status.as_u16(), &err.to_string()),
        None => UploadError::Transient(err.to_string()),
    }
}

#[async_trait::async_trait]
impl ChunkTransport for HttpTransport {
    async fn send_chunk(&self, chunk: ChunkRequest) -> UploadResult<ChunkAck> {
        let url = format!(
            "{}/uploads/{}/chunks/{}",
            self.endpoint, chunk.upload_id, chunk.chunk_index
        );
        debug!("PUT {} ({} bytes)", url, chunk.data.len());

        let response = self
            .client
            .put(&url)
            .header(HEADER_TOTAL_CHUNKS, chunk.total_chunks.to_string())
            .header(HEADER_MATCH_ID, &chunk.match_id)
            .header(HEADER_FILENAME, &chunk.filename)
            .body(chunk.data)
            .send()
            .await
            .map_err(transport_error)?;

        Self::read_json(response).await
    }

    async fn assemble(
        &self,
        upload_id: &str,
        request: AssembleRequest,
    ) -> UploadResult<AssembledUpload> {
        let url = format!("{}/uploads/{}/assemble", self.endpoint, upload_id);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        Self::read_json(response).await
    }
}
