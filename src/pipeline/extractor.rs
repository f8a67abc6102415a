//! Stage 2: content extraction.
//!
//! The fast text path always runs, and an OCR pass always runs too: a
//! PDF that appears to contain text may yield encoded garbage, so the
//! two are merged for recall. Measurement candidates and domain
//! metadata come from table-driven pattern sets.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::context::StageContext;
use crate::config::OcrConfig;
use crate::error::{PipelineError, Result};
use crate::models::{
    DocumentKind, DomainMetadata, ExtractedContent, ExtractedImage, ExtractionMethod,
    OcrMeasurement, Table,
};
use crate::tools;

/// Pages rendered and OCRed per document.
const MAX_PAGES: u32 = 10;
/// Characters below which a text layer is considered unusable on its own.
const MIN_TEXT_CHARS: usize = 100;

/// One measurement pattern: compiled regex, value arity, and confidence.
struct MeasurementPattern {
    re: Regex,
    /// `true` when the regex captures two dimensions to multiply.
    dimensions: bool,
    confidence: f64,
}

/// Measurement candidates recognized in merged text. Compiled once and
/// reused across documents.
static MEASUREMENT_PATTERNS: LazyLock<Vec<MeasurementPattern>> = LazyLock::new(|| {
    vec![
        MeasurementPattern {
            re: Regex::new(
                r"(?i)\b(\d{1,3}(?:,\d{3})*(?:\.\d+)?)\s*(?:sq\.?\s*ft\.?|square\s+feet|sf\b)",
            )
            .unwrap(),
            dimensions: false,
            confidence: 0.9,
        },
        MeasurementPattern {
            re: Regex::new(r"(\d+(?:\.\d+)?)\s*'\s*[x×]\s*(\d+(?:\.\d+)?)\s*'").unwrap(),
            dimensions: true,
            confidence: 0.7,
        },
    ]
});

/// Recognized domain metadata keys and their patterns. This table is the
/// only producer of metadata keys.
static METADATA_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        (
            DomainMetadata::PROJECT_NUMBER,
            Regex::new(r"\b(\d{2}-\d{4})\b").unwrap(),
        ),
        (
            DomainMetadata::STORE_NUMBER,
            Regex::new(r"(?i)store\s*(?:no\.?|number|#)?\s*[:#]?\s*(\d{3,6})\b").unwrap(),
        ),
        (
            DomainMetadata::LOCATION,
            Regex::new(r"(?i)(?:location|address|site)\s*:\s*([^\r\n]{4,80})").unwrap(),
        ),
        (
            DomainMetadata::CLIENT_NAME,
            Regex::new(r"(?i)(?:client|owner|prepared\s+for)\s*:\s*([^\r\n]{2,60})").unwrap(),
        ),
        (
            DomainMetadata::DATE,
            Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{2,4})\b").unwrap(),
        ),
    ]
});

/// Column splitter for table recovery: two or more spaces.
static TABLE_SPLITTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

/// Run extraction for the document. CPU-heavy work happens on the
/// blocking pool.
pub async fn extract(ctx: &StageContext, kind: DocumentKind) -> Result<ExtractedContent> {
    let pdf_path = ctx.pdf_path.clone();
    let pages_dir = ctx.scratch_subdir("pages")?;
    let dpi = if kind == DocumentKind::Blueprint {
        300
    } else {
        200
    };
    let ocr = ctx.settings.ocr.clone();

    tokio::task::spawn_blocking(move || extract_blocking(&pdf_path, &pages_dir, dpi, &ocr))
        .await
        .map_err(|e| PipelineError::Internal(format!("join: {e}")))?
}

fn extract_blocking(
    pdf_path: &Path,
    pages_dir: &Path,
    dpi: u32,
    ocr: &OcrConfig,
) -> Result<ExtractedContent> {
    let info = tools::pdf_info(pdf_path)?;
    if info.encrypted {
        return Err(PipelineError::PasswordProtected);
    }
    if info.page_count == 0 {
        return Err(PipelineError::EmptyPdf);
    }

    // Fast path: the PDF's own text objects.
    let text_layer = tools::pdf_text(pdf_path).unwrap_or_default();
    let text_layer_usable = text_layer.trim().len() >= MIN_TEXT_CHARS;

    // OCR pass over rendered pages.
    let last_page = info.page_count.min(MAX_PAGES);
    if info.page_count > MAX_PAGES {
        debug!(
            pages = info.page_count,
            processed = MAX_PAGES,
            "page cap applied"
        );
    }
    let mut images = Vec::new();
    let mut ocr_text = String::new();
    let mut ocr_pages_ok = 0u32;
    match tools::render_pages(pdf_path, pages_dir, dpi, 1, last_page) {
        Ok(rendered) => {
            for (index, page_path) in rendered.iter().enumerate() {
                images.push(ExtractedImage {
                    page_index: index as u32,
                    path: page_path.clone(),
                    dpi,
                });
                match tools::tesseract_ocr(page_path, &ocr.language, ocr.psm_mode) {
                    Ok(text) => {
                        ocr_pages_ok += 1;
                        ocr_text.push_str(&text);
                        ocr_text.push('\n');
                    }
                    Err(e) => warn!(page = index, "ocr failed: {e}"),
                }
            }
        }
        Err(e) => {
            // Rendering failure is tolerable when a text layer exists.
            if !text_layer_usable {
                return Err(e);
            }
            warn!("page rendering failed, continuing on text layer: {e}");
        }
    }

    if !text_layer_usable && ocr_pages_ok == 0 {
        return Err(PipelineError::UnreadablePages);
    }

    let (text, method) = merge_text(&text_layer, &ocr_text, text_layer_usable);
    let measurements = extract_measurements(&text);
    let metadata = extract_metadata(&text);
    let tables = extract_tables(&text);

    let confidence = match method {
        ExtractionMethod::Hybrid => 0.9,
        ExtractionMethod::TextLayer => 0.85,
        ExtractionMethod::Ocr => 0.7,
    };

    Ok(ExtractedContent {
        text,
        images,
        measurements,
        tables,
        method,
        confidence,
        metadata,
    })
}

fn merge_text(text_layer: &str, ocr_text: &str, layer_usable: bool) -> (String, ExtractionMethod) {
    let ocr_usable = !ocr_text.trim().is_empty();
    match (layer_usable, ocr_usable) {
        (true, true) => (
            format!("{}\n{}", text_layer.trim_end(), ocr_text.trim()),
            ExtractionMethod::Hybrid,
        ),
        (true, false) => (text_layer.to_string(), ExtractionMethod::TextLayer),
        (false, true) => {
            // Keep a sparse text layer around anyway; it costs nothing.
            let mut merged = String::new();
            if !text_layer.trim().is_empty() {
                merged.push_str(text_layer.trim());
                merged.push('\n');
            }
            merged.push_str(ocr_text.trim());
            (merged, ExtractionMethod::Ocr)
        }
        (false, false) => (text_layer.to_string(), ExtractionMethod::TextLayer),
    }
}

/// Pull measurement candidates from merged text using the pattern table.
pub fn extract_measurements(text: &str) -> Vec<OcrMeasurement> {
    let mut found = Vec::new();
    for spec in MEASUREMENT_PATTERNS.iter() {
        for caps in spec.re.captures_iter(text) {
            let value = if spec.dimensions {
                let a: f64 = caps[1].parse().unwrap_or(0.0);
                let b: f64 = caps[2].parse().unwrap_or(0.0);
                a * b
            } else {
                caps[1].replace(',', "").parse().unwrap_or(0.0)
            };
            if value <= 0.0 {
                continue;
            }
            found.push(OcrMeasurement {
                value_sqft: value,
                source_span: caps[0].trim().to_string(),
                confidence: spec.confidence,
            });
        }
    }
    found
}

/// Populate recognized metadata keys from the pattern table.
pub fn extract_metadata(text: &str) -> DomainMetadata {
    let mut metadata = DomainMetadata::default();
    for (key, re) in METADATA_PATTERNS.iter() {
        if let Some(caps) = re.captures(text) {
            metadata.insert(*key, caps[1].trim().to_string());
        }
    }
    metadata
}

/// Recover simple columnar tables: consecutive lines with two or more
/// multi-space column gaps.
pub fn extract_tables(text: &str) -> Vec<Table> {
    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();

    for line in text.lines() {
        let cells: Vec<String> = TABLE_SPLITTER
            .split(line.trim())
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string())
            .collect();
        if cells.len() >= 3 {
            current.push(cells);
        } else {
            if current.len() >= 2 {
                tables.push(Table {
                    rows: std::mem::take(&mut current),
                });
            }
            current.clear();
        }
    }
    if current.len() >= 2 {
        tables.push(Table { rows: current });
    }
    tables
}
