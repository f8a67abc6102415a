//! Stage 3: hybrid roof measurement for blueprint documents.
//!
//! The CV path measures scaled boundary contours on rendered pages. When
//! its confidence falls below the configured threshold, or no scale
//! annotation is found, the LLM vision adapter gives a second opinion
//! and the two are reconciled by relative difference.

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::context::StageContext;
use super::cv;
use super::reconcile::verify_measurements;
use crate::error::{PipelineError, Result};
use crate::models::{
    ExtractedContent, MeasurementMethod, RegionMeasurement, RoofFeature, RoofMeasurementResult,
};

/// Pages submitted to the vision model.
const MAX_VISION_PAGES: usize = 3;

/// Relative difference below which CV and vision agree.
const AGREEMENT_BAND: f64 = 0.05;
/// Relative difference below which the disagreement is minor.
const MINOR_BAND: f64 = 0.20;

/// Measurement plus warnings destined for the estimate.
#[derive(Debug)]
pub struct MeasureOutcome {
    pub result: RoofMeasurementResult,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VisionArea {
    area_sqft: f64,
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct VisionReply {
    roof_areas: Vec<VisionArea>,
    #[serde(default)]
    overall_confidence: f64,
}

struct CvAggregate {
    regions: Vec<RegionMeasurement>,
    features: Vec<RoofFeature>,
    total_sqft: f64,
    confidence: f64,
    scale_found: bool,
}

/// Measure the roof from rendered blueprint pages.
pub async fn measure(ctx: &StageContext, content: &ExtractedContent) -> Result<MeasureOutcome> {
    let mut warnings = Vec::new();

    let cv_result = run_cv(ctx, content).await?;
    let threshold = ctx.settings.llm.confidence_fallback_threshold;

    let need_vision = cv_result.confidence < threshold || !cv_result.scale_found;
    let vision_result = if need_vision && !content.images.is_empty() {
        match run_vision(ctx, content).await {
            Ok(reply) => Some(reply),
            Err(e) if !cv_result.regions.is_empty() => {
                warn!("vision fallback unavailable, keeping CV result: {e}");
                warnings.push("vision cross-check unavailable".to_string());
                None
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    let (total, regions, confidence, method) =
        select_measurement(&cv_result, vision_result.as_ref(), &mut warnings);

    if total <= 0.0 {
        warnings.push("no measurable roof area found on blueprint pages".to_string());
    }

    // Reconcile against the text measurements from extraction.
    let ocr_total = content.ocr_total_sqft();
    let reconciliation = if ocr_total > 0.0 && total > 0.0 {
        Some(verify_measurements(ocr_total, total))
    } else {
        None
    };

    info!(
        total_sqft = total,
        method = method.as_str(),
        confidence,
        "measurement selected"
    );
    Ok(MeasureOutcome {
        result: RoofMeasurementResult {
            total_sqft: total,
            regions,
            features: cv_result.features,
            method,
            confidence,
            reconciliation,
        },
        warnings,
    })
}

async fn run_cv(ctx: &StageContext, content: &ExtractedContent) -> Result<CvAggregate> {
    let cfg = ctx.settings.cv.clone();
    let ocr = ctx.settings.ocr.clone();
    let images: Vec<_> = content
        .images
        .iter()
        .map(|img| (img.path.clone(), img.dpi))
        .collect();

    tokio::task::spawn_blocking(move || {
        let mut aggregate = CvAggregate {
            regions: Vec::new(),
            features: Vec::new(),
            total_sqft: 0.0,
            confidence: 0.0,
            scale_found: false,
        };
        let mut page_confidences = Vec::new();

        for (path, dpi) in &images {
            // OCR the rendered page to find its scale annotation.
            let page_text = match crate::tools::tesseract_ocr(path, &ocr.language, ocr.psm_mode) {
                Ok(text) => text,
                Err(e) => {
                    debug!("page ocr for scale detection failed: {e}");
                    String::new()
                }
            };
            let scale = cv::detect_scale(&page_text, *dpi);
            let scale_confidence = scale.as_ref().map(|s| s.confidence).unwrap_or(0.0);
            let ppf = scale.as_ref().map(|s| s.pixels_per_foot);
            aggregate.scale_found |= scale.is_some();

            let analysis = cv::analyze_page(path, ppf, &page_text, &cfg)?;
            // Page confidence is the weaker of scale and boundary
            // evidence, halved when the scale is missing entirely.
            let page_confidence = if scale.is_some() {
                scale_confidence.min(analysis.boundary_confidence)
            } else {
                analysis.boundary_confidence * 0.5
            };
            if !analysis.regions.is_empty() {
                page_confidences.push(page_confidence);
            }

            aggregate.total_sqft += analysis.regions.iter().map(|r| r.area_sqft).sum::<f64>();
            aggregate.regions.extend(analysis.regions);
            merge_features(&mut aggregate.features, analysis.features);
        }

        aggregate.confidence = page_confidences
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        if !aggregate.confidence.is_finite() {
            aggregate.confidence = 0.0;
        }
        Ok(aggregate)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("join: {e}")))?
}

async fn run_vision(ctx: &StageContext, content: &ExtractedContent) -> Result<VisionReply> {
    let prompt = "You are measuring a commercial roof from blueprint pages. Reply with \
                  only a JSON object of the form {\"roof_areas\": [{\"area_sqft\": 0.0, \
                  \"confidence\": 0.0}], \"overall_confidence\": 0.0}. Report each distinct \
                  roof region once, in square feet.";
    let paths: Vec<&std::path::Path> = content
        .images
        .iter()
        .take(MAX_VISION_PAGES)
        .map(|img| img.path.as_path())
        .collect();

    let reply = ctx
        .llm
        .complete_vision(prompt, &paths, ctx.settings.llm.max_tokens)
        .await?;
    crate::llm::extract_json::<VisionReply>(&reply)
}

/// Hybrid selection between the CV aggregate and the vision reply.
fn select_measurement(
    cv_result: &CvAggregate,
    vision: Option<&VisionReply>,
    warnings: &mut Vec<String>,
) -> (f64, Vec<RegionMeasurement>, f64, MeasurementMethod) {
    let vision_total: Option<(f64, f64)> = vision.and_then(|v| {
        let total: f64 = v.roof_areas.iter().map(|a| a.area_sqft).sum();
        if total > 0.0 {
            Some((total, v.overall_confidence.clamp(0.0, 1.0)))
        } else {
            None
        }
    });
    let cv_available = cv_result.total_sqft > 0.0;

    match (cv_available, vision_total) {
        (false, None) => (0.0, Vec::new(), 0.0, MeasurementMethod::Cv),
        (true, None) => (
            cv_result.total_sqft,
            cv_result.regions.clone(),
            cv_result.confidence,
            MeasurementMethod::Cv,
        ),
        (false, Some((total, confidence))) => (
            total,
            vision_regions(vision.unwrap()),
            confidence,
            MeasurementMethod::LlmVision,
        ),
        (true, Some((vision_sqft, vision_confidence))) => {
            let rel_diff = (cv_result.total_sqft - vision_sqft).abs()
                / cv_result.total_sqft.max(vision_sqft);
            let cv_wins = cv_result.confidence >= vision_confidence;

            if rel_diff >= MINOR_BAND {
                warnings.push(format!(
                    "major discrepancy between CV ({:.0} sq ft) and vision ({:.0} sq ft); manual review recommended",
                    cv_result.total_sqft, vision_sqft
                ));
                (
                    vision_sqft,
                    vision_regions(vision.unwrap()),
                    vision_confidence,
                    MeasurementMethod::Hybrid,
                )
            } else {
                if rel_diff >= AGREEMENT_BAND {
                    warnings.push(format!(
                        "minor discrepancy between CV ({:.0} sq ft) and vision ({:.0} sq ft)",
                        cv_result.total_sqft, vision_sqft
                    ));
                } else {
                    debug!(rel_diff, "cv and vision agree");
                }
                if cv_wins {
                    (
                        cv_result.total_sqft,
                        cv_result.regions.clone(),
                        cv_result.confidence,
                        MeasurementMethod::Hybrid,
                    )
                } else {
                    (
                        vision_sqft,
                        vision_regions(vision.unwrap()),
                        vision_confidence,
                        MeasurementMethod::Hybrid,
                    )
                }
            }
        }
    }
}

fn vision_regions(reply: &VisionReply) -> Vec<RegionMeasurement> {
    reply
        .roof_areas
        .iter()
        .filter(|a| a.area_sqft > 0.0)
        .map(|a| RegionMeasurement {
            area_sqft: a.area_sqft,
            method: MeasurementMethod::LlmVision,
            confidence: a.confidence.clamp(0.0, 1.0),
            bbox: None,
        })
        .collect()
}

fn merge_features(existing: &mut Vec<RoofFeature>, new: Vec<RoofFeature>) {
    for feature in new {
        match existing.iter_mut().find(|f| f.kind == feature.kind) {
            Some(found) => {
                found.count += feature.count;
                found.confidence = found.confidence.min(feature.confidence);
            }
            None => existing.push(feature),
        }
    }
}
