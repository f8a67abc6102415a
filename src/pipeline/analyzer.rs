//! Stage 1: classify the document kind and pick the pipeline strategy.

use serde::Deserialize;
use tracing::{debug, info};

use super::context::StageContext;
use crate::error::{PipelineError, Result};
use crate::llm::extract_json;
use crate::models::DocumentKind;
use crate::tools;

/// Keyword table for the non-LLM fallback path. First match wins.
const KIND_KEYWORDS: &[(DocumentKind, &[&str])] = &[
    (
        DocumentKind::Blueprint,
        &["roof plan", "scale:", "drawn by", "sheet no", "floor plan", "elevation"],
    ),
    (
        DocumentKind::InspectionReport,
        &["inspection", "deficiency", "deficiencies", "observed condition", "site visit"],
    ),
    (
        DocumentKind::ExistingEstimate,
        &["estimate", "proposal", "total cost", "bid amount", "quote"],
    ),
];

#[derive(Debug, Deserialize)]
struct KindReply {
    kind: String,
    #[serde(default)]
    confidence: f64,
}

/// Classify the PDF. Deterministic structural problems (encryption, no
/// pages) surface here so later stages never see them.
pub async fn classify(ctx: &StageContext) -> Result<DocumentKind> {
    let pdf_path = ctx.pdf_path.clone();
    let info = tokio::task::spawn_blocking(move || tools::pdf_info(&pdf_path))
        .await
        .map_err(|e| PipelineError::Internal(format!("join: {e}")))??;

    if info.encrypted {
        return Err(PipelineError::PasswordProtected);
    }
    if info.page_count == 0 {
        return Err(PipelineError::EmptyPdf);
    }

    // A short text excerpt drives both the LLM prompt and the keyword
    // fallback.
    let pdf_path = ctx.pdf_path.clone();
    let excerpt = tokio::task::spawn_blocking(move || tools::pdf_text(&pdf_path))
        .await
        .map_err(|e| PipelineError::Internal(format!("join: {e}")))?
        .unwrap_or_default();
    let excerpt: String = excerpt.chars().take(2000).collect();

    let prompt = format!(
        "You classify commercial roofing documents. Reply with only a JSON object \
         {{\"kind\": \"...\", \"confidence\": 0.0}} where kind is one of: blueprint, \
         inspection_report, existing_estimate, photo, unknown.\n\n\
         Pages: {}\nText excerpt:\n{}",
        info.page_count, excerpt
    );

    let kind = match ctx.llm.complete(&prompt, 128).await {
        Ok(reply) => match extract_json::<KindReply>(&reply) {
            Ok(parsed) => {
                debug!(kind = %parsed.kind, confidence = parsed.confidence, "llm classification");
                DocumentKind::parse(&parsed.kind)
            }
            Err(_) => {
                debug!("classification reply was not JSON, using keywords");
                keyword_classify(&excerpt)
            }
        },
        // Adapter transport failures are retryable; propagate.
        Err(e) => return Err(e),
    };

    // The client hint breaks ties when classification comes back unknown.
    let resolved = match (kind, ctx.document.kind_hint) {
        (DocumentKind::Unknown, Some(hint)) => hint,
        (k, _) => k,
    };
    info!(document_id = %ctx.document.id, kind = resolved.as_str(), "classified");
    Ok(resolved)
}

/// Keyword heuristics over the excerpt, used when the model reply is not
/// parseable.
pub fn keyword_classify(text: &str) -> DocumentKind {
    let lowered = text.to_lowercase();
    for (kind, keywords) in KIND_KEYWORDS {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return *kind;
        }
    }
    if lowered.trim().is_empty() {
        // No text layer at all reads like a scan or photo set.
        DocumentKind::Photo
    } else {
        DocumentKind::Unknown
    }
}
