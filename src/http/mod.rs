//! HTTP server receiving chunked uploads and live segments
//!
//! This module provides the REST endpoints the upload engines talk to:
//! - PUT /uploads/:id/chunks/:index - Store one chunk (idempotent)
//! - POST /uploads/:id/assemble - Concatenate chunks into the final file
//! - GET /uploads/:id - Query received chunks
//! - PUT /recordings/:id/segments/:segment_id - Store a live segment
//! - GET /files/*, /segments/* - Serve stored media
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;
mod storage;

pub use handlers::{ErrorResponse, UploadStatusResponse};
pub use routes::create_router;
pub use state::{AppState, UploadRecord};
pub use storage::ServerStorage;
