//! Stage 3 output: roof measurements, features, and the OCR reconciliation
//! verdict.

use serde::{Deserialize, Serialize};

/// How a measurement was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMethod {
    Cv,
    LlmVision,
    Hybrid,
}

impl MeasurementMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cv => "cv",
            Self::LlmVision => "llm_vision",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Roof-top object kinds affecting cost and complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    ExhaustPort,
    Walkway,
    Equipment,
    Drain,
    Penetration,
    EquipmentPad,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExhaustPort => "exhaust_port",
            Self::Walkway => "walkway",
            Self::Equipment => "equipment",
            Self::Drain => "drain",
            Self::Penetration => "penetration",
            Self::EquipmentPad => "equipment_pad",
        }
    }

    /// Default cost impact of this feature kind.
    pub fn default_impact(&self) -> FeatureImpact {
        match self {
            Self::Equipment => FeatureImpact::High,
            Self::Walkway | Self::EquipmentPad | Self::Penetration => FeatureImpact::Medium,
            Self::ExhaustPort | Self::Drain => FeatureImpact::Low,
        }
    }
}

/// Cost impact band of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureImpact {
    Low,
    Medium,
    High,
}

/// A detected roof feature with its count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoofFeature {
    pub kind: FeatureKind,
    /// Detected count, at least 1.
    pub count: u32,
    pub impact: FeatureImpact,
    pub confidence: f64,
}

impl RoofFeature {
    pub fn new(kind: FeatureKind, count: u32, confidence: f64) -> Self {
        Self {
            kind,
            count: count.max(1),
            impact: kind.default_impact(),
            confidence,
        }
    }
}

/// One measured roof region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMeasurement {
    pub area_sqft: f64,
    pub method: MeasurementMethod,
    pub confidence: f64,
    /// Pixel-space bounding box (x, y, w, h) when known.
    pub bbox: Option<[f64; 4]>,
}

/// Reconciliation recommendation against OCR text measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    UseBlueprint,
    ManualReview,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseBlueprint => "use_blueprint",
            Self::ManualReview => "manual_review",
        }
    }
}

/// Verdict of comparing the blueprint measurement against OCR totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub ocr_total_sqft: f64,
    pub blueprint_total_sqft: f64,
    pub diff_percent: f64,
    pub verification_confidence: f64,
    pub recommendation: Recommendation,
}

/// Output of the roof measurement stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoofMeasurementResult {
    /// Authoritative total area in square feet, non-negative.
    pub total_sqft: f64,
    pub regions: Vec<RegionMeasurement>,
    pub features: Vec<RoofFeature>,
    pub method: MeasurementMethod,
    pub confidence: f64,
    pub reconciliation: Option<Reconciliation>,
}

impl RoofMeasurementResult {
    /// Sum of per-region areas. The invariant check in the composer
    /// requires this to be within 1% of `total_sqft`.
    pub fn regions_total_sqft(&self) -> f64 {
        self.regions.iter().map(|r| r.area_sqft).sum()
    }
}
