//! Ingest API server.
//!
//! Accepts uploads, validates them, registers documents, enqueues
//! pipeline jobs, and serves status and results. All processing happens
//! in the worker process; the API never runs pipeline stages.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::blobstore::BlobStore;
use crate::config::Settings;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::queue::JobQueue;
use crate::repository::DocumentRepository;

/// Shared state for the API process.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub repo: Arc<DocumentRepository>,
    pub queue: Arc<JobQueue>,
    pub blobs: BlobStore,
    pub llm: LlmClient,
}

impl AppState {
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        std::fs::create_dir_all(&settings.data_dir)?;
        let repo = Arc::new(DocumentRepository::new(&settings.db_path())?);
        let queue = Arc::new(JobQueue::new(&settings.db_path())?);
        let public_base = format!("http://{}:{}", settings.host, settings.port);
        let blobs = BlobStore::new(
            settings.blobs_dir(),
            settings.presign_secret.clone(),
            public_base,
        )?;
        let llm = LlmClient::new(settings.llm.clone());

        Ok(Self {
            settings,
            repo,
            queue,
            blobs,
            llm,
        })
    }
}

/// Start the API server.
pub async fn serve(settings: Arc<Settings>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let state = AppState::new(settings)?;
    let app = create_router(state);

    tracing::info!("ingest api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn pdf_bytes(body_len: usize) -> Vec<u8> {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.extend(std::iter::repeat(b'x').take(body_len));
        bytes.extend_from_slice(b"\nstartxref\n12345\n%%EOF\n");
        bytes
    }

    fn setup(max_file_size: u64) -> (axum::Router, AppState, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.data_dir = dir.path().to_path_buf();
        settings.max_file_size_bytes = max_file_size;
        let settings = Arc::new(settings);

        let state = AppState::new(settings).unwrap();
        let app = create_router(state.clone());
        (app, state, dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_upload(filename: &str, bytes: &[u8]) -> Request<Body> {
        let boundary = "test-boundary-7f3a";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/v1/documents/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_url_happy_path() {
        let (app, _state, _dir) = setup(1 << 20);
        let response = app
            .oneshot(post_json(
                "/api/v1/documents/generate-url",
                serde_json::json!({
                    "filename": "roof plan.pdf",
                    "content_type": "application/pdf",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let blob_name = json["blob_name"].as_str().unwrap();
        assert!(blob_name.starts_with("uploads/"));
        assert!(blob_name.ends_with("/roof_plan.pdf"));
        assert!(json["upload_url"].as_str().unwrap().contains("sig="));
    }

    #[tokio::test]
    async fn test_generate_url_rejects_wrong_content_type() {
        let (app, _state, _dir) = setup(1 << 20);
        let response = app
            .oneshot(post_json(
                "/api/v1/documents/generate-url",
                serde_json::json!({
                    "filename": "roof.pdf",
                    "content_type": "image/jpeg",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "validation_error");
        assert!(json["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_start_processing_registers_and_is_idempotent() {
        let (app, state, _dir) = setup(1 << 20);

        let blob_name = "uploads/slot-1/roof.pdf";
        let path = state.blobs.prepare_write(blob_name).unwrap();
        std::fs::write(&path, pdf_bytes(2048)).unwrap();

        let request = serde_json::json!({
            "blob_name": blob_name,
            "original_filename": "roof.pdf",
        });
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/documents/start-processing",
                request.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = body_json(response).await;
        assert_eq!(first["status"], "pending");
        let document_id = first["document_id"].as_str().unwrap().to_string();

        // Same tuple again: same document, still exactly one open job.
        let response = app
            .oneshot(post_json("/api/v1/documents/start-processing", request))
            .await
            .unwrap();
        let second = body_json(response).await;
        assert_eq!(second["document_id"], document_id.as_str());
        assert_eq!(state.queue.depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_processing_unknown_blob_is_404() {
        let (app, _state, _dir) = setup(1 << 20);
        let response = app
            .oneshot(post_json(
                "/api/v1/documents/start-processing",
                serde_json::json!({
                    "blob_name": "uploads/nope/roof.pdf",
                    "original_filename": "roof.pdf",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_processing_invalid_pdf_is_415() {
        let (app, state, _dir) = setup(1 << 20);
        let blob_name = "uploads/slot-2/fake.pdf";
        let path = state.blobs.prepare_write(blob_name).unwrap();
        std::fs::write(&path, b"\xff\xd8\xff\xe0 jpeg disguised as pdf").unwrap();

        let response = app
            .oneshot(post_json(
                "/api/v1/documents/start-processing",
                serde_json::json!({
                    "blob_name": blob_name,
                    "original_filename": "fake.pdf",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        // No document row was created.
        assert!(state.repo.list(None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_streams_and_enqueues() {
        let (app, state, _dir) = setup(1 << 20);
        let response = app
            .oneshot(multipart_upload("site plan.pdf", &pdf_bytes(4096)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");

        let id = json["document_id"].as_str().unwrap();
        let doc = state.repo.get_required(id).unwrap();
        assert_eq!(doc.filename, "site_plan.pdf");
        assert!(state.blobs.exists(&doc.blob_ref));
        assert_eq!(state.queue.depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_oversized_upload_leaves_nothing_behind() {
        let (app, state, _dir) = setup(1024);
        let response = app
            .oneshot(multipart_upload("big.pdf", &pdf_bytes(8192)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert!(state.repo.list(None, 10).unwrap().is_empty());
        assert_eq!(state.queue.depth().unwrap(), 0);
        // No partial blob remains on disk.
        let uploads_root = state.settings.blobs_dir().join("uploads");
        let leftovers: Vec<_> = walk_files(&uploads_root);
        assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_upload_with_bad_magic_is_415() {
        let (app, state, _dir) = setup(1 << 20);
        let response = app
            .oneshot(multipart_upload("photo.pdf", b"\xff\xd8\xff\xe0 jpeg bytes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(state.repo.list(None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_document_not_found() {
        let (app, _state, _dir) = setup(1 << 20);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/documents/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "not_found_error");
    }

    #[tokio::test]
    async fn test_status_and_results_lifecycle() {
        let (app, state, _dir) = setup(1 << 20);

        let blob_name = "uploads/slot-3/roof.pdf";
        let path = state.blobs.prepare_write(blob_name).unwrap();
        std::fs::write(&path, pdf_bytes(1024)).unwrap();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/documents/start-processing",
                serde_json::json!({
                    "blob_name": blob_name,
                    "original_filename": "roof.pdf",
                }),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["document_id"]
            .as_str()
            .unwrap()
            .to_string();

        // Status while pending.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(&format!("/api/v1/pipeline/status/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "pending");

        // Results are not ready yet.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(&format!("/api/v1/pipeline/results/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "not_ready_error");

        // Cancel from pending is immediate.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&format!("/api/v1/pipeline/cancel/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "cancelled");

        // Cancelling again conflicts.
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&format!("/api/v1/pipeline/cancel/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_health_reports_deps() {
        let (app, _state, _dir) = setup(1 << 20);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/pipeline/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        // Local deps are up; the LLM is not running in tests.
        assert_eq!(json["deps"]["db"], true);
        assert_eq!(json["deps"]["broker"], true);
        assert_eq!(json["deps"]["blob"], true);
        assert_eq!(json["status"], "degraded");
    }

    #[tokio::test]
    async fn test_presigned_put_round_trip() {
        let (app, state, _dir) = setup(1 << 20);
        let blob_name = "uploads/slot-4/roof.pdf";
        let url = state.blobs.presign_put(blob_name, 900).unwrap();
        let path_and_query = url.splitn(4, '/').nth(3).map(|s| format!("/{s}")).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(&path_and_query)
                    .body(Body::from(pdf_bytes(512)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.blobs.exists(blob_name));

        // A forged signature is rejected.
        let forged = path_and_query.replace("sig=", "sig=00");
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(&forged)
                    .body(Body::from(pdf_bytes(512)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn walk_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    files.extend(walk_files(&path));
                } else {
                    files.push(path);
                }
            }
        }
        files
    }
}
