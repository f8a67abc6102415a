//! Presigned blob PUT endpoint backing the local blob store.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{PipelineError, Result};

use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct PresignParams {
    pub expires: i64,
    pub sig: String,
}

/// PUT /api/v1/blobs/*object — accepts bytes for a presigned slot.
///
/// Only the size cap is enforced here; PDF structure is validated when
/// processing starts. An oversized body leaves no partial object.
pub async fn put_blob(
    State(state): State<AppState>,
    Path(object): Path<String>,
    Query(params): Query<PresignParams>,
    body: Body,
) -> Result<Json<serde_json::Value>> {
    state.blobs.verify_put(&object, params.expires, &params.sig)?;

    let cap = state.settings.max_file_size_bytes;
    let path = state.blobs.prepare_write(&object)?;
    let mut file = tokio::fs::File::create(&path).await?;
    let mut written: u64 = 0;

    let mut stream = body.into_data_stream();
    let write_result: Result<()> = async {
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| PipelineError::Validation(format!("upload aborted: {e}")))?;
            written += chunk.len() as u64;
            if written > cap {
                return Err(PipelineError::TooLarge {
                    size: written,
                    cap,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = write_result {
        drop(file);
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e);
    }

    debug!(object, written, "blob stored");
    Ok(Json(json!({ "blob_name": object, "size_bytes": written })))
}
