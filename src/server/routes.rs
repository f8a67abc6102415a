//! Router configuration for the ingest API.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the `/api/v1` router.
pub fn create_router(state: AppState) -> Router {
    // Multipart overhead on top of the configured file cap.
    let body_limit = state.settings.max_file_size_bytes as usize + 64 * 1024;

    Router::new()
        // Upload slots and processing
        .route(
            "/api/v1/documents/generate-url",
            post(handlers::generate_url),
        )
        .route(
            "/api/v1/documents/start-processing",
            post(handlers::start_processing),
        )
        .route("/api/v1/documents/upload", post(handlers::upload))
        .route("/api/v1/documents", get(handlers::list_documents))
        .route("/api/v1/documents/:id", get(handlers::get_document))
        // Presigned blob writes
        .route("/api/v1/blobs/*object", put(handlers::put_blob))
        // Pipeline status and results
        .route("/api/v1/pipeline/status/:id", get(handlers::pipeline_status))
        .route(
            "/api/v1/pipeline/results/:id",
            get(handlers::pipeline_results),
        )
        .route("/api/v1/pipeline/cancel/:id", post(handlers::cancel))
        .route("/api/v1/pipeline/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
