//! Pipeline status, results, cancellation, and health handlers.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use crate::error::{PipelineError, Result};
use crate::models::ProcessingStatus;

use super::super::AppState;

/// GET /api/v1/pipeline/status/:id
pub async fn pipeline_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let doc = state.repo.get_required(&id)?;

    let mut body = json!({ "status": doc.status.as_str() });
    match doc.status {
        ProcessingStatus::Processing => {
            if let Some((stage, progress)) = state.queue.latest_progress(&id)? {
                if let Some(stage) = stage {
                    body["stage"] = json!(stage);
                }
                body["progress"] = json!(progress);
            }
        }
        ProcessingStatus::Completed => {
            body["progress"] = json!(1.0);
        }
        ProcessingStatus::Failed => {
            body["error"] = json!({
                "kind": doc.error_kind,
                "message": doc.error_message,
            });
        }
        _ => {}
    }
    Ok(Json(body))
}

/// GET /api/v1/pipeline/results/:id
pub async fn pipeline_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let doc = state.repo.get_required(&id)?;
    match doc.status {
        ProcessingStatus::Completed => {
            let estimate = state
                .repo
                .get_estimate(&id)?
                .ok_or_else(|| PipelineError::Internal("completed without results".into()))?;
            Ok(Json(serde_json::to_value(estimate)?))
        }
        ProcessingStatus::Failed => Err(PipelineError::Failed(
            doc.error_message
                .unwrap_or_else(|| "processing failed".to_string()),
        )),
        ProcessingStatus::Cancelled => {
            Err(PipelineError::Conflict("document was cancelled".into()))
        }
        other => Err(PipelineError::NotReady(other.as_str().to_string())),
    }
}

/// POST /api/v1/pipeline/cancel/:id
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let status = state.repo.request_cancel(&id)?;
    match status {
        ProcessingStatus::Cancelled => Ok(Json(json!({ "status": "cancelled" }))),
        // The worker observes the flag at its next stage boundary.
        other => Ok(Json(json!({
            "status": other.as_str(),
            "cancel_requested": true,
        }))),
    }
}

/// GET /api/v1/pipeline/health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db = state.repo.status_counts().is_ok();
    let queue = state.queue.depth().is_ok();
    let blob = state.blobs.healthy();
    let llm = state.llm.is_available().await;

    let status = if db && queue && blob {
        if llm {
            "healthy"
        } else {
            "degraded"
        }
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "deps": { "db": db, "broker": queue, "blob": blob, "llm": llm },
    }))
}
