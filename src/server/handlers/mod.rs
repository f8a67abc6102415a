//! HTTP handlers for the ingest API.

mod blobs;
mod documents;
mod pipeline;

pub use blobs::put_blob;
pub use documents::{generate_url, get_document, list_documents, start_processing, upload};
pub use pipeline::{cancel, health, pipeline_results, pipeline_status};
