//! Stage 4 output: the LLM's structured reading of a document.

use serde::{Deserialize, Serialize};

use super::DomainMetadata;

/// Material vocabulary the interpreter is allowed to emit. Anything else
/// is normalized to "unknown".
pub const MATERIAL_VOCABULARY: &[&str] = &[
    "tpo",
    "epdm",
    "pvc",
    "modified_bitumen",
    "built_up",
    "metal",
    "shingle",
    "unknown",
];

/// Structured interpretation of extracted content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    /// Roof area in square feet, when the text supports one.
    pub roof_area_sqft: Option<f64>,
    /// Material classification from [`MATERIAL_VOCABULARY`].
    pub material: String,
    /// Short complexity factor phrases.
    pub complexity_factors: Vec<String>,
    /// Narrative summary for the estimate reader.
    pub summary: String,
    pub confidence: f64,
    /// Domain metadata passed through from extraction.
    pub metadata: DomainMetadata,
}

impl Interpretation {
    /// Clamp a material string to the bounded vocabulary.
    pub fn normalize_material(raw: &str) -> String {
        let lowered = raw.trim().to_lowercase().replace([' ', '-'], "_");
        if MATERIAL_VOCABULARY.contains(&lowered.as_str()) {
            lowered
        } else {
            "unknown".to_string()
        }
    }
}
