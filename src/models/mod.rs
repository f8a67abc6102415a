//! Domain models for documents, extraction, measurement, and estimates.

mod content;
mod document;
mod estimate;
mod interpretation;
mod measurement;

pub use content::{
    DomainMetadata, ExtractedContent, ExtractedImage, ExtractionMethod, OcrMeasurement, Table,
};
pub use document::{Document, DocumentKind, ProcessingStatus};
pub use estimate::{round2, Estimate, LaborEstimate, MaterialLine};
pub use interpretation::Interpretation;
pub use measurement::{
    FeatureImpact, FeatureKind, MeasurementMethod, Recommendation, Reconciliation,
    RegionMeasurement, RoofFeature, RoofMeasurementResult,
};
