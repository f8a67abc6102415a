//! Stage 4: structured interpretation of extracted content.
//!
//! The model is asked for strict JSON. A non-JSON reply gets one repair
//! retry; after that the stage degrades to a deterministic low-confidence
//! interpretation instead of failing the document. Only adapter
//! transport errors propagate.

use serde::Deserialize;
use tracing::{debug, warn};

use super::context::StageContext;
use crate::error::Result;
use crate::llm::extract_json;
use crate::models::{ExtractedContent, Interpretation};

#[derive(Debug, Deserialize)]
struct InterpretationReply {
    #[serde(default)]
    roof_area_sqft: Option<f64>,
    #[serde(default)]
    material: String,
    #[serde(default)]
    complexity_factors: Vec<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    confidence: f64,
}

/// Interpret extracted content into the structured form the composer
/// needs.
pub async fn interpret(ctx: &StageContext, content: &ExtractedContent) -> Result<Interpretation> {
    let prompt = build_prompt(ctx, content);

    let reply = ctx.llm.complete(&prompt, ctx.settings.llm.max_tokens).await?;
    match extract_json::<InterpretationReply>(&reply) {
        Ok(parsed) => Ok(from_reply(parsed, content)),
        Err(_) => {
            debug!("interpretation reply was not JSON, sending repair prompt");
            let repair = format!(
                "Your previous reply could not be parsed. Reply with ONLY the JSON object, \
                 no prose, matching the schema requested.\n\nOriginal request:\n{prompt}"
            );
            let second = ctx.llm.complete(&repair, ctx.settings.llm.max_tokens).await?;
            match extract_json::<InterpretationReply>(&second) {
                Ok(parsed) => Ok(from_reply(parsed, content)),
                Err(e) => {
                    warn!("interpretation degraded to deterministic fallback: {e}");
                    Ok(fallback_interpretation(content))
                }
            }
        }
    }
}

fn build_prompt(ctx: &StageContext, content: &ExtractedContent) -> String {
    let text = ctx.llm.truncate_content(&content.text);
    let mut metadata_lines = String::new();
    for (key, value) in &content.metadata.0 {
        metadata_lines.push_str(&format!("- {key}: {value}\n"));
    }
    let measurements: Vec<String> = content
        .measurements
        .iter()
        .take(10)
        .map(|m| format!("{} ({:.0} sq ft)", m.source_span, m.value_sqft))
        .collect();

    format!(
        "You are a commercial roofing estimator reading an extracted document. Reply with \
         only a JSON object:\n\
         {{\"roof_area_sqft\": number or null, \"material\": \"tpo|epdm|pvc|modified_bitumen|built_up|metal|shingle|unknown\", \
         \"complexity_factors\": [\"...\"], \"summary\": \"...\", \"confidence\": 0.0}}\n\n\
         Known project metadata:\n{metadata}\n\
         Measurement candidates found in the text: {measurements}\n\n\
         Document text:\n{text}",
        metadata = if metadata_lines.is_empty() {
            "- none\n".to_string()
        } else {
            metadata_lines
        },
        measurements = if measurements.is_empty() {
            "none".to_string()
        } else {
            measurements.join(", ")
        },
    )
}

fn from_reply(reply: InterpretationReply, content: &ExtractedContent) -> Interpretation {
    Interpretation {
        roof_area_sqft: reply.roof_area_sqft.filter(|a| *a > 0.0),
        material: Interpretation::normalize_material(&reply.material),
        complexity_factors: reply
            .complexity_factors
            .into_iter()
            .filter(|f| !f.trim().is_empty())
            .take(10)
            .collect(),
        summary: if reply.summary.trim().is_empty() {
            deterministic_summary(content)
        } else {
            reply.summary.trim().to_string()
        },
        confidence: reply.confidence.clamp(0.0, 1.0),
        metadata: content.metadata.clone(),
    }
}

/// The no-model interpretation: best text measurement, unknown material,
/// and a summary built from the content itself.
pub fn fallback_interpretation(content: &ExtractedContent) -> Interpretation {
    let best_area = content
        .measurements
        .iter()
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|m| m.value_sqft);

    Interpretation {
        roof_area_sqft: best_area,
        material: "unknown".into(),
        complexity_factors: Vec::new(),
        summary: deterministic_summary(content),
        confidence: 0.2,
        metadata: content.metadata.clone(),
    }
}

/// First sentences of the text, bounded, with recognized identifiers
/// appended.
fn deterministic_summary(content: &ExtractedContent) -> String {
    let mut summary: String = content
        .text
        .split_inclusive(['.', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(3)
        .collect::<Vec<_>>()
        .join(" ");
    if summary.len() > 300 {
        let mut end = 300;
        while end > 0 && !summary.is_char_boundary(end) {
            end -= 1;
        }
        summary.truncate(end);
    }
    if summary.is_empty() {
        summary = "No readable text content.".to_string();
    }
    if let Some(project) = content.metadata.get(crate::models::DomainMetadata::PROJECT_NUMBER) {
        summary.push_str(&format!(" (project {project})"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DomainMetadata, ExtractionMethod, OcrMeasurement};

    fn content(text: &str, measurements: Vec<OcrMeasurement>) -> ExtractedContent {
        ExtractedContent {
            text: text.into(),
            images: Vec::new(),
            measurements,
            tables: Vec::new(),
            method: ExtractionMethod::Hybrid,
            confidence: 0.9,
            metadata: DomainMetadata::default(),
        }
    }

    #[test]
    fn test_fallback_picks_best_measurement() {
        let c = content(
            "Roof area 1,800 sq ft. Section sizes vary.",
            vec![
                OcrMeasurement {
                    value_sqft: 750.0,
                    source_span: "25' x 30'".into(),
                    confidence: 0.7,
                },
                OcrMeasurement {
                    value_sqft: 1800.0,
                    source_span: "1,800 sq ft".into(),
                    confidence: 0.9,
                },
            ],
        );
        let interp = fallback_interpretation(&c);
        assert_eq!(interp.roof_area_sqft, Some(1800.0));
        assert_eq!(interp.material, "unknown");
        assert!((interp.confidence - 0.2).abs() < 1e-9);
        assert!(interp.summary.contains("1,800 sq ft"));
    }

    #[test]
    fn test_fallback_with_no_measurements() {
        let c = content("", Vec::new());
        let interp = fallback_interpretation(&c);
        assert_eq!(interp.roof_area_sqft, None);
        assert_eq!(interp.summary, "No readable text content.");
    }

    #[test]
    fn test_reply_normalization() {
        let reply = InterpretationReply {
            roof_area_sqft: Some(-5.0),
            material: "TPO".into(),
            complexity_factors: vec!["  ".into(), "steep parapet".into()],
            summary: " flat roof ".into(),
            confidence: 1.7,
        };
        let interp = from_reply(reply, &content("x", Vec::new()));
        assert_eq!(interp.roof_area_sqft, None);
        assert_eq!(interp.material, "tpo");
        assert_eq!(interp.complexity_factors, vec!["steep parapet".to_string()]);
        assert_eq!(interp.summary, "flat roof");
        assert_eq!(interp.confidence, 1.0);
    }

    #[test]
    fn test_summary_appends_project_number() {
        let mut c = content("Inspection of the north roof. Ponding observed.", Vec::new());
        c.metadata
            .insert(DomainMetadata::PROJECT_NUMBER, "24-0117".into());
        let interp = fallback_interpretation(&c);
        assert!(interp.summary.contains("project 24-0117"));
    }
}
