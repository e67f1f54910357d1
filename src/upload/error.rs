use thiserror::Error;

/// Failures surfaced by the chunked upload engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Timeouts, dropped connections, 5xx responses. Retried with backoff.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The server rejected the request (unknown upload id, size mismatch, ...)
    #[error("upload rejected by server: {0}")]
    Protocol(String),

    #[error("invalid upload input: {0}")]
    InvalidInput(String),

    #[error("upload state persistence failed: {0}")]
    Storage(String),

    /// The session was cancelled and can no longer be driven
    #[error("upload session {0} is closed")]
    SessionClosed(String),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }

    /// Classify an HTTP status returned by the upload endpoint
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };

        match status {
            408 | 429 => UploadError::Transient(message),
            s if s >= 500 => UploadError::Transient(message),
            _ => UploadError::Protocol(message),
        }
    }
}

impl From<anyhow::Error> for UploadError {
    fn from(err: anyhow::Error) -> Self {
        UploadError::Storage(format!("{:#}", err))
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
