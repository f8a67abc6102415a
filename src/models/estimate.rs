//! The final persisted result: a structured roofing estimate.

use serde::{Deserialize, Serialize};

/// Round to two decimal places, the precision of every persisted dollar
/// figure.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One material line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialLine {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub unit_cost: f64,
}

/// Labor line of the estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborEstimate {
    pub hours: f64,
    pub rate: f64,
    pub subtotal: f64,
}

/// The final estimate persisted in `processing_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Link back to the source document.
    pub document_id: String,
    pub roof_area_sqft: f64,
    /// Non-negative, rounded to 2 dp.
    pub estimated_cost: f64,
    pub materials: Vec<MaterialLine>,
    pub labor: LaborEstimate,
    /// Human-readable band, e.g. "2-4 days".
    pub timeline: String,
    pub confidence: f64,
    pub warnings: Vec<String>,
    /// Stage names completed, in execution order.
    pub stages_completed: Vec<String>,
    /// Total wall-clock seconds across all stages.
    pub elapsed_seconds: f64,
}
