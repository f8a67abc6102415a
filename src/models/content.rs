//! Stage 2 output: normalized extracted content.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the text of a document was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// PDF text objects only.
    TextLayer,
    /// OCR only (no usable text layer).
    Ocr,
    /// Text layer merged with OCR output.
    Hybrid,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextLayer => "text_layer",
            Self::Ocr => "ocr",
            Self::Hybrid => "hybrid",
        }
    }
}

/// A page image rendered for downstream vision consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedImage {
    /// Zero-based page index.
    pub page_index: u32,
    /// Path under the job scratch directory.
    pub path: PathBuf,
    pub dpi: u32,
}

/// A numeric measurement candidate found in the merged text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrMeasurement {
    pub value_sqft: f64,
    /// The matched text span, for audit.
    pub source_span: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// A table recovered from the document, rows of cells.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<Vec<String>>,
}

/// Recognized project-level identifiers extracted from text.
///
/// The key set is bounded; the extractor's pattern table is the only
/// producer. Unknown keys are never inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainMetadata(pub BTreeMap<String, String>);

impl DomainMetadata {
    pub const PROJECT_NUMBER: &'static str = "project_number";
    pub const STORE_NUMBER: &'static str = "store_number";
    pub const LOCATION: &'static str = "location";
    pub const CLIENT_NAME: &'static str = "client_name";
    pub const DATE: &'static str = "date";

    pub fn insert(&mut self, key: &'static str, value: String) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Normalized output of the content extraction stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedContent {
    /// Merged text, possibly empty.
    pub text: String,
    pub images: Vec<ExtractedImage>,
    pub measurements: Vec<OcrMeasurement>,
    pub tables: Vec<Table>,
    pub method: ExtractionMethod,
    /// Overall extraction confidence in [0, 1].
    pub confidence: f64,
    pub metadata: DomainMetadata,
}

impl ExtractedContent {
    /// Sum of all OCR measurement candidates, in square feet.
    pub fn ocr_total_sqft(&self) -> f64 {
        self.measurements.iter().map(|m| m.value_sqft).sum()
    }
}
