use super::state::{AppState, UploadRecord};
use super::storage::is_safe_id;
use crate::segment::{StoredSegment, HEADER_END_TIME, HEADER_START_TIME};
use crate::upload::{
    AssembleRequest, AssembledUpload, ChunkAck, HEADER_FILENAME, HEADER_MATCH_ID,
    HEADER_TOTAL_CHUNKS,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub match_id: String,
    pub filename: String,
    pub total_chunks: usize,
    pub received_chunks: Vec<usize>,
    pub assembled: Option<AssembledUpload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ============================================================================
// Handlers
// ============================================================================

/// PUT /uploads/:upload_id/chunks/:index
/// Store one chunk of an upload (idempotent per index)
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, usize)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !is_safe_id(&upload_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid upload id");
    }

    let Some(total_chunks) =
        header_str(&headers, HEADER_TOTAL_CHUNKS).and_then(|v| v.parse::<usize>().ok())
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Missing or invalid {} header", HEADER_TOTAL_CHUNKS),
        );
    };
    if index >= total_chunks {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Chunk index {} out of range (total {})", index, total_chunks),
        );
    }

    // Register the upload, recovering chunks stored before a restart
    {
        let mut uploads = state.uploads.write().await;
        if !uploads.contains_key(&upload_id) {
            let received = match state.storage.stored_chunks(&upload_id).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Failed to scan chunks of {}: {:#}", upload_id, e);
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error");
                }
            };
            info!(
                "New upload {} ({} chunks, {} already stored)",
                upload_id,
                total_chunks,
                received.len()
            );
            uploads.insert(
                upload_id.clone(),
                UploadRecord {
                    match_id: header_str(&headers, HEADER_MATCH_ID).unwrap_or_default().to_string(),
                    filename: header_str(&headers, HEADER_FILENAME).unwrap_or_default().to_string(),
                    total_chunks,
                    received,
                    assembled: None,
                },
            );
        }

        let Some(record) = uploads.get(&upload_id) else {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Upload vanished");
        };
        if record.total_chunks != total_chunks {
            warn!(
                "Upload {}: chunk claims {} total chunks, session has {}",
                upload_id, total_chunks, record.total_chunks
            );
            return error_response(
                StatusCode::CONFLICT,
                format!(
                    "Upload {} has {} chunks, not {}",
                    upload_id, record.total_chunks, total_chunks
                ),
            );
        }
        if record.assembled.is_some() {
            return (
                StatusCode::OK,
                Json(ChunkAck {
                    upload_id: upload_id.clone(),
                    chunk_index: index,
                    received_chunks: record.received.len(),
                }),
            )
                .into_response();
        }
    }

    if let Err(e) = state.storage.write_chunk(&upload_id, index, &body).await {
        error!("Failed to store chunk {} of {}: {:#}", index, upload_id, e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store chunk");
    }

    let mut uploads = state.uploads.write().await;
    let Some(record) = uploads.get_mut(&upload_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("Upload {} not found", upload_id));
    };
    record.received.insert(index);

    (
        StatusCode::OK,
        Json(ChunkAck {
            upload_id,
            chunk_index: index,
            received_chunks: record.received.len(),
        }),
    )
        .into_response()
}

/// POST /uploads/:upload_id/assemble
/// Concatenate all chunks into the final file
pub async fn assemble_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Json(req): Json<AssembleRequest>,
) -> impl IntoResponse {
    if !is_safe_id(&upload_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid upload id");
    }

    let mut uploads = state.uploads.write().await;

    if !uploads.contains_key(&upload_id) {
        match state.storage.stored_chunks(&upload_id).await {
            Ok(received) if !received.is_empty() => {
                uploads.insert(
                    upload_id.clone(),
                    UploadRecord {
                        match_id: req.match_id.clone(),
                        filename: req.filename.clone(),
                        total_chunks: req.total_chunks,
                        received,
                        assembled: None,
                    },
                );
            }
            Ok(_) => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    format!("Upload {} not found", upload_id),
                );
            }
            Err(e) => {
                error!("Failed to scan chunks of {}: {:#}", upload_id, e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error");
            }
        }
    }

    let Some(record) = uploads.get_mut(&upload_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("Upload {} not found", upload_id));
    };

    if let Some(assembled) = &record.assembled {
        return (StatusCode::OK, Json(assembled.clone())).into_response();
    }
    if record.total_chunks != req.total_chunks {
        return error_response(
            StatusCode::CONFLICT,
            format!(
                "Upload {} has {} chunks, not {}",
                upload_id, record.total_chunks, req.total_chunks
            ),
        );
    }

    let missing: BTreeSet<usize> = (0..record.total_chunks)
        .filter(|i| !record.received.contains(i))
        .collect();
    if !missing.is_empty() {
        warn!("Upload {} is missing chunks {:?}", upload_id, missing);
        return error_response(
            StatusCode::CONFLICT,
            format!("Upload {} is missing chunks {:?}", upload_id, missing),
        );
    }

    let filename = if req.filename.is_empty() {
        record.filename.clone()
    } else {
        req.filename.clone()
    };
    let (name, size_bytes) = match state
        .storage
        .assemble(&upload_id, &filename, record.total_chunks)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            error!("Failed to assemble {}: {:#}", upload_id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to assemble upload");
        }
    };

    if size_bytes != req.total_bytes {
        warn!(
            "Upload {} assembled to {} bytes, client expected {}",
            upload_id, size_bytes, req.total_bytes
        );
        if let Err(e) = state.storage.remove_file(&name).await {
            error!("Failed to remove mismatched file {}: {:#}", name, e);
        }
        return error_response(
            StatusCode::CONFLICT,
            format!(
                "Assembled size {} does not match expected {}",
                size_bytes, req.total_bytes
            ),
        );
    }

    if let Err(e) = state.storage.remove_chunks(&upload_id).await {
        warn!("Failed to clean up chunks of {}: {:#}", upload_id, e);
    }

    let assembled = AssembledUpload {
        upload_id: upload_id.clone(),
        file_url: format!("/files/{}", name),
        size_bytes,
    };
    record.assembled = Some(assembled.clone());

    (StatusCode::OK, Json(assembled)).into_response()
}

/// GET /uploads/:upload_id
/// Which chunks the server holds for an upload
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> impl IntoResponse {
    let uploads = state.uploads.read().await;

    match uploads.get(&upload_id) {
        Some(record) => (
            StatusCode::OK,
            Json(UploadStatusResponse {
                upload_id: upload_id.clone(),
                match_id: record.match_id.clone(),
                filename: record.filename.clone(),
                total_chunks: record.total_chunks,
                received_chunks: record.received.iter().copied().collect(),
                assembled: record.assembled.clone(),
            }),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("Upload {} not found", upload_id)),
    }
}

/// PUT /recordings/:recording_id/segments/:segment_id
/// Store a sealed live-recording segment
pub async fn put_segment(
    State(state): State<AppState>,
    Path((recording_id, segment_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !is_safe_id(&recording_id) || !is_safe_id(&segment_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid recording or segment id");
    }

    match state
        .storage
        .write_segment(&recording_id, &segment_id, &body)
        .await
    {
        Ok(path) => {
            info!(
                "Stored segment {} of {} ({}s - {}s, {} bytes)",
                segment_id,
                recording_id,
                header_str(&headers, HEADER_START_TIME).unwrap_or("?"),
                header_str(&headers, HEADER_END_TIME).unwrap_or("?"),
                body.len()
            );
            (
                StatusCode::OK,
                Json(StoredSegment {
                    url: format!("/segments/{}", path),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to store segment {}: {:#}", segment_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store segment")
        }
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
