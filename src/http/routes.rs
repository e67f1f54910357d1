use super::handlers;
use super::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    let files = ServeDir::new(state.storage.output_dir());
    let segments = ServeDir::new(state.storage.segment_dir());

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Chunked uploads
        .route("/uploads/:upload_id", get(handlers::get_upload))
        .route(
            "/uploads/:upload_id/chunks/:index",
            put(handlers::put_chunk),
        )
        .route(
            "/uploads/:upload_id/assemble",
            post(handlers::assemble_upload),
        )
        // Live recording segments
        .route(
            "/recordings/:recording_id/segments/:segment_id",
            put(handlers::put_segment),
        )
        // Stored media
        .nest_service("/files", files)
        .nest_service("/segments", segments)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
