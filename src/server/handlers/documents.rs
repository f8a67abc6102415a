//! Document ingest handlers: upload slots, processing registration, the
//! streamed upload path, and record reads.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::blobstore::BlobStore;
use crate::error::{PipelineError, Result};
use crate::models::{Document, DocumentKind, ProcessingStatus};
use crate::validate::{sanitize_filename, validate_file, StreamValidator};

use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateUrlRequest {
    pub filename: String,
    pub content_type: String,
}

/// POST /api/v1/documents/generate-url
pub async fn generate_url(
    State(state): State<AppState>,
    Json(req): Json<GenerateUrlRequest>,
) -> Result<Json<serde_json::Value>> {
    if req.content_type != "application/pdf" {
        return Err(PipelineError::Validation(format!(
            "content_type must be application/pdf, got {:?}",
            req.content_type
        )));
    }
    let filename = sanitize_filename(&req.filename)?;
    let slot_id = uuid::Uuid::new_v4().to_string();
    let blob_name = BlobStore::object_name(&slot_id, &filename);
    let upload_url = state
        .blobs
        .presign_put(&blob_name, state.settings.presign_ttl_seconds)?;

    Ok(Json(json!({
        "upload_url": upload_url,
        "blob_name": blob_name,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StartProcessingRequest {
    pub blob_name: String,
    pub original_filename: String,
    pub document_kind_hint: Option<String>,
}

/// POST /api/v1/documents/start-processing
///
/// Idempotent per `(blob_name, original_filename)`: a repeat request
/// returns the existing document and enqueues nothing.
pub async fn start_processing(
    State(state): State<AppState>,
    Json(req): Json<StartProcessingRequest>,
) -> Result<Json<serde_json::Value>> {
    let filename = sanitize_filename(&req.original_filename)?;
    let pdf_path = state.blobs.download(&req.blob_name)?;
    let size_bytes = validate_file(&pdf_path, state.settings.max_file_size_bytes)?;

    let mut hasher = Sha256::new();
    hasher.update(req.blob_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(filename.as_bytes());
    let request_token = hex::encode(hasher.finalize());

    let mut doc = Document::new(filename, req.blob_name.clone(), size_bytes, request_token);
    doc.kind_hint = req
        .document_kind_hint
        .as_deref()
        .map(DocumentKind::parse);

    let (doc, created) = state.repo.create_or_get(&doc)?;
    if created {
        state.queue.enqueue(&doc.id)?;
        info!(document_id = %doc.id, "document registered and enqueued");
    }

    Ok(Json(json!({
        "document_id": doc.id,
        "status": doc.status.as_str(),
    })))
}

/// POST /api/v1/documents/upload — streamed multipart alternative used
/// when no presigned path is available.
///
/// The size cap is enforced chunk by chunk; a rejected upload leaves no
/// partial file behind.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let mut kind_hint: Option<DocumentKind> = None;
    let mut stored: Option<(String, String, u64)> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Validation(format!("bad multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "document_type" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| PipelineError::Validation(format!("bad field: {e}")))?;
                kind_hint = Some(DocumentKind::parse(&value));
            }
            "file" => {
                let declared = field
                    .file_name()
                    .ok_or_else(|| PipelineError::Validation("file field needs a filename".into()))?
                    .to_string();
                let filename = sanitize_filename(&declared)?;

                let document_id = uuid::Uuid::new_v4().to_string();
                let blob_name = BlobStore::object_name(&document_id, &filename);
                let path = state.blobs.prepare_write(&blob_name)?;

                // Stream through the validator into the blob location;
                // remove the partial file on any failure.
                let mut validator = StreamValidator::new(state.settings.max_file_size_bytes);
                let mut file = tokio::fs::File::create(&path).await?;
                let write_result: Result<u64> = async {
                    use tokio::io::AsyncWriteExt;
                    while let Some(chunk) = field
                        .chunk()
                        .await
                        .map_err(|e| PipelineError::Validation(format!("upload aborted: {e}")))?
                    {
                        validator.update(&chunk)?;
                        file.write_all(&chunk).await?;
                    }
                    file.flush().await?;
                    validator.finish()
                }
                .await;

                match write_result {
                    Ok(size) => stored = Some((document_id, blob_name, size)),
                    Err(e) => {
                        drop(file);
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(e);
                    }
                }
            }
            _ => {}
        }
    }

    let (document_id, blob_name, size_bytes) =
        stored.ok_or_else(|| PipelineError::Validation("missing file field".into()))?;

    let filename = blob_name
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let mut hasher = Sha256::new();
    hasher.update(blob_name.as_bytes());
    let request_token = hex::encode(hasher.finalize());

    let mut doc = Document::new(filename, blob_name.clone(), size_bytes, request_token);
    doc.id = document_id;
    doc.kind_hint = kind_hint;

    let (doc, created) = state.repo.create_or_get(&doc)?;
    if created {
        state.queue.enqueue(&doc.id)?;
        info!(document_id = %doc.id, size_bytes, "document uploaded and enqueued");
    }

    Ok(Json(json!({
        "document_id": doc.id,
        "status": doc.status.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

/// GET /api/v1/documents
pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            ProcessingStatus::parse(raw)
                .ok_or_else(|| PipelineError::Validation(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };
    let docs = state.repo.list(status, params.limit.unwrap_or(50).min(500))?;
    let items: Vec<_> = docs.iter().map(document_json).collect();
    Ok(Json(json!({ "items": items })))
}

/// GET /api/v1/documents/:id
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let doc = state.repo.get_required(&id)?;
    Ok(Json(document_json(&doc)))
}

fn document_json(doc: &Document) -> serde_json::Value {
    json!({
        "id": doc.id,
        "filename": doc.filename,
        "status": doc.status.as_str(),
        "created_at": doc.created_at.to_rfc3339(),
        "updated_at": doc.updated_at.to_rfc3339(),
    })
}
