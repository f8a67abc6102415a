//! Stage 5: compose the final estimate from interpretation and
//! measurement.
//!
//! Pricing and feature impact are data tables shared with the tests.

use tracing::debug;

use crate::config::PricingConfig;
use crate::error::{PipelineError, Result};
use crate::models::{
    round2, Estimate, FeatureImpact, Interpretation, LaborEstimate, MaterialLine, Recommendation,
    RoofFeature, RoofMeasurementResult,
};

/// Cost contribution of one feature impact band, per counted feature.
#[derive(Debug, Clone, Copy)]
pub struct ImpactRow {
    pub impact: FeatureImpact,
    pub multiplier_per_count: f64,
    pub flat_per_count: f64,
}

/// Authoritative feature-impact table.
pub const FEATURE_IMPACT_TABLE: [ImpactRow; 3] = [
    ImpactRow {
        impact: FeatureImpact::High,
        multiplier_per_count: 0.10,
        flat_per_count: 500.0,
    },
    ImpactRow {
        impact: FeatureImpact::Medium,
        multiplier_per_count: 0.05,
        flat_per_count: 200.0,
    },
    ImpactRow {
        impact: FeatureImpact::Low,
        multiplier_per_count: 0.0,
        flat_per_count: 50.0,
    },
];

pub fn impact_row(impact: FeatureImpact) -> &'static ImpactRow {
    FEATURE_IMPACT_TABLE
        .iter()
        .find(|row| row.impact == impact)
        .expect("impact table covers all bands")
}

/// One timeline band: the first row whose thresholds are met wins.
#[derive(Debug, Clone, Copy)]
pub struct TimelineRow {
    /// Band applies when area is at least this.
    pub min_area_sqft: f64,
    /// Or when the count of high-impact features exceeds this.
    pub high_features_over: u32,
    pub band: &'static str,
}

/// Timeline bands, most demanding first.
pub const TIMELINE_TABLE: [TimelineRow; 5] = [
    TimelineRow {
        min_area_sqft: 15_000.0,
        high_features_over: 2,
        band: "8-12 days",
    },
    TimelineRow {
        min_area_sqft: 8_000.0,
        high_features_over: 1,
        band: "6-8 days",
    },
    TimelineRow {
        min_area_sqft: 4_000.0,
        high_features_over: 0,
        band: "4-6 days",
    },
    TimelineRow {
        min_area_sqft: 1_500.0,
        high_features_over: u32::MAX,
        band: "3-5 days",
    },
    TimelineRow {
        min_area_sqft: 0.0,
        high_features_over: u32::MAX,
        band: "2-4 days",
    },
];

fn high_feature_count(features: &[RoofFeature]) -> u32 {
    features
        .iter()
        .filter(|f| f.impact == FeatureImpact::High)
        .map(|f| f.count)
        .sum()
}

/// Pick the timeline band for an area and feature set.
pub fn timeline_band(area_sqft: f64, features: &[RoofFeature]) -> &'static str {
    let high = high_feature_count(features);
    TIMELINE_TABLE
        .iter()
        .find(|row| {
            area_sqft >= row.min_area_sqft
                || (row.high_features_over < u32::MAX && high > row.high_features_over)
        })
        .map(|row| row.band)
        .unwrap_or("2-4 days")
}

/// Inputs the orchestrator gathers before composing.
pub struct ComposeInput<'a> {
    pub document_id: &'a str,
    pub interpretation: &'a Interpretation,
    pub measurement: Option<&'a RoofMeasurementResult>,
    /// Confidences of completed stages, in order; zeros are skipped.
    pub stage_confidences: &'a [f64],
    pub stages_completed: Vec<String>,
    pub warnings: Vec<String>,
    pub elapsed_seconds: f64,
}

/// Compose and validate the final estimate.
pub fn compose(pricing: &PricingConfig, input: ComposeInput<'_>) -> Result<Estimate> {
    let mut warnings = input.warnings;

    let (area, features): (f64, &[RoofFeature]) = match input.measurement {
        Some(m) if m.total_sqft > 0.0 => (m.total_sqft, &m.features),
        _ => match input.interpretation.roof_area_sqft {
            Some(area) if area > 0.0 => (area, &[]),
            _ => {
                return Err(PipelineError::InsufficientData(
                    "no roof area from measurement or interpretation".into(),
                ))
            }
        },
    };

    // Per-region sums must agree with the total within 1% unless a
    // reconciliation override was recorded.
    if let Some(m) = input.measurement {
        let regions_total = m.regions_total_sqft();
        if !m.regions.is_empty() && m.reconciliation.is_none() {
            let drift = (regions_total - m.total_sqft).abs() / m.total_sqft.max(1.0);
            if drift > 0.01 {
                warnings.push(format!(
                    "region sum {:.0} sq ft differs from total {:.0} sq ft",
                    regions_total, m.total_sqft
                ));
            }
        }
        if let Some(rec) = &m.reconciliation {
            if rec.recommendation == Recommendation::ManualReview {
                warnings.push(format!(
                    "measurement discrepancy {:.1}% between text ({:.0} sq ft) and blueprint ({:.0} sq ft); manual review recommended",
                    rec.diff_percent, rec.ocr_total_sqft, rec.blueprint_total_sqft
                ));
            }
        }
    }

    let mut multiplier = 0.0;
    let mut flat = 0.0;
    for feature in features {
        let row = impact_row(feature.impact);
        multiplier += row.multiplier_per_count * feature.count as f64;
        flat += row.flat_per_count * feature.count as f64;
    }

    let base_cost = area * (pricing.material_per_sqft + pricing.labor_per_sqft);
    let adjusted_cost = round2(base_cost * (1.0 + multiplier) + flat);
    debug!(area, base_cost, multiplier, flat, adjusted_cost, "composed cost");

    let material_name = if input.interpretation.material == "unknown" {
        "roofing membrane".to_string()
    } else {
        format!("{} membrane", input.interpretation.material)
    };
    let materials = vec![MaterialLine {
        name: material_name,
        quantity: area,
        unit: "sq ft".into(),
        unit_cost: pricing.material_per_sqft,
    }];

    let hours = round2(area * pricing.labor_hours_per_sqft * (1.0 + multiplier));
    let labor = LaborEstimate {
        hours,
        rate: pricing.labor_rate,
        subtotal: round2(hours * pricing.labor_rate),
    };

    let confidence = input
        .stage_confidences
        .iter()
        .copied()
        .filter(|c| *c > 0.0)
        .product::<f64>()
        .clamp(0.1, 0.99);

    Ok(Estimate {
        document_id: input.document_id.to_string(),
        roof_area_sqft: area,
        estimated_cost: adjusted_cost,
        materials,
        labor,
        timeline: timeline_band(area, features).to_string(),
        confidence,
        warnings,
        stages_completed: input.stages_completed,
        elapsed_seconds: input.elapsed_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DomainMetadata, FeatureKind, MeasurementMethod};

    fn interpretation(area: Option<f64>) -> Interpretation {
        Interpretation {
            roof_area_sqft: area,
            material: "tpo".into(),
            complexity_factors: Vec::new(),
            summary: "flat commercial roof".into(),
            confidence: 0.9,
            metadata: DomainMetadata::default(),
        }
    }

    fn measurement(total: f64, features: Vec<RoofFeature>) -> RoofMeasurementResult {
        RoofMeasurementResult {
            total_sqft: total,
            regions: Vec::new(),
            features,
            method: MeasurementMethod::Cv,
            confidence: 0.9,
            reconciliation: None,
        }
    }

    #[test]
    fn test_plain_blueprint_cost() {
        // 2,500 sq ft at 8 + 4 dollars with no features.
        let m = measurement(2500.0, Vec::new());
        let interp = interpretation(None);
        let estimate = compose(
            &PricingConfig::default(),
            ComposeInput {
                document_id: "d1",
                interpretation: &interp,
                measurement: Some(&m),
                stage_confidences: &[0.9, 0.9],
                stages_completed: vec!["analyze".into()],
                warnings: Vec::new(),
                elapsed_seconds: 1.0,
            },
        )
        .unwrap();
        assert_eq!(estimate.roof_area_sqft, 2500.0);
        assert_eq!(estimate.estimated_cost, 30_000.0);
        assert_eq!(estimate.timeline, "3-5 days");
    }

    #[test]
    fn test_feature_multipliers_and_flats() {
        // One high (x1) and two drains (low, x2):
        // base = 1000 * 12 = 12000
        // adjusted = 12000 * 1.10 + (500 + 2*50) = 13200 + 600 = 13800
        let m = measurement(
            1000.0,
            vec![
                RoofFeature::new(FeatureKind::Equipment, 1, 0.8),
                RoofFeature::new(FeatureKind::Drain, 2, 0.9),
            ],
        );
        let interp = interpretation(None);
        let estimate = compose(
            &PricingConfig::default(),
            ComposeInput {
                document_id: "d1",
                interpretation: &interp,
                measurement: Some(&m),
                stage_confidences: &[1.0],
                stages_completed: Vec::new(),
                warnings: Vec::new(),
                elapsed_seconds: 1.0,
            },
        )
        .unwrap();
        assert_eq!(estimate.estimated_cost, 13_800.0);
    }

    #[test]
    fn test_interpretation_area_fallback() {
        let interp = interpretation(Some(1800.0));
        let estimate = compose(
            &PricingConfig::default(),
            ComposeInput {
                document_id: "d1",
                interpretation: &interp,
                measurement: None,
                stage_confidences: &[0.8],
                stages_completed: Vec::new(),
                warnings: Vec::new(),
                elapsed_seconds: 1.0,
            },
        )
        .unwrap();
        assert_eq!(estimate.roof_area_sqft, 1800.0);
        assert_eq!(estimate.estimated_cost, 21_600.0);
    }

    #[test]
    fn test_no_area_is_insufficient_data() {
        let interp = interpretation(None);
        let err = compose(
            &PricingConfig::default(),
            ComposeInput {
                document_id: "d1",
                interpretation: &interp,
                measurement: None,
                stage_confidences: &[0.8],
                stages_completed: Vec::new(),
                warnings: Vec::new(),
                elapsed_seconds: 1.0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }

    #[test]
    fn test_composition_is_deterministic() {
        let m = measurement(
            3333.33,
            vec![RoofFeature::new(FeatureKind::Walkway, 3, 0.7)],
        );
        let interp = interpretation(Some(3000.0));
        let make = || {
            compose(
                &PricingConfig::default(),
                ComposeInput {
                    document_id: "d1",
                    interpretation: &interp,
                    measurement: Some(&m),
                    stage_confidences: &[0.9, 0.8, 0.7],
                    stages_completed: vec!["analyze".into(), "extract".into()],
                    warnings: Vec::new(),
                    elapsed_seconds: 2.0,
                },
            )
            .unwrap()
        };
        let a = make();
        let b = make();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_confidence_product_clamped() {
        let m = measurement(1000.0, Vec::new());
        let interp = interpretation(None);
        let low = compose(
            &PricingConfig::default(),
            ComposeInput {
                document_id: "d1",
                interpretation: &interp,
                measurement: Some(&m),
                stage_confidences: &[0.1, 0.1, 0.1],
                stages_completed: Vec::new(),
                warnings: Vec::new(),
                elapsed_seconds: 1.0,
            },
        )
        .unwrap();
        assert_eq!(low.confidence, 0.1);

        let high = compose(
            &PricingConfig::default(),
            ComposeInput {
                document_id: "d1",
                interpretation: &interp,
                measurement: Some(&m),
                stage_confidences: &[1.0, 0.0],
                stages_completed: Vec::new(),
                warnings: Vec::new(),
                elapsed_seconds: 1.0,
            },
        )
        .unwrap();
        // Zero confidences are skipped, not multiplied in.
        assert_eq!(high.confidence, 0.99);
    }

    #[test]
    fn test_timeline_bands() {
        let none: Vec<RoofFeature> = Vec::new();
        let many_high = vec![RoofFeature::new(FeatureKind::Equipment, 3, 0.9)];
        assert_eq!(timeline_band(800.0, &none), "2-4 days");
        assert_eq!(timeline_band(2000.0, &none), "3-5 days");
        assert_eq!(timeline_band(5000.0, &none), "4-6 days");
        assert_eq!(timeline_band(9000.0, &none), "6-8 days");
        assert_eq!(timeline_band(20_000.0, &none), "8-12 days");
        // Three high-impact features force the longest band at any area.
        assert_eq!(timeline_band(800.0, &many_high), "8-12 days");
    }

    #[test]
    fn test_manual_review_reconciliation_warns() {
        let mut m = measurement(2500.0, Vec::new());
        m.reconciliation = Some(crate::pipeline::reconcile::verify_measurements(
            4421.0, 2500.0,
        ));
        let interp = interpretation(None);
        let estimate = compose(
            &PricingConfig::default(),
            ComposeInput {
                document_id: "d1",
                interpretation: &interp,
                measurement: Some(&m),
                stage_confidences: &[0.9, 0.3],
                stages_completed: Vec::new(),
                warnings: Vec::new(),
                elapsed_seconds: 1.0,
            },
        )
        .unwrap();
        assert!(estimate
            .warnings
            .iter()
            .any(|w| w.contains("manual review")));
        assert!(estimate.confidence <= 0.6);
    }
}
