//! Upload validation: streaming size cap, PDF structure checks, and
//! filename sanitization.

use std::io::Read;
use std::path::Path;

use crate::error::{PipelineError, Result};

const PDF_MAGIC: &[u8] = b"%PDF-";
/// Bytes of the file tail scanned for the trailer tokens.
const TRAILER_WINDOW: usize = 2048;
const MAX_FILENAME_BYTES: usize = 255;

/// Incremental validator fed by an upload stream.
///
/// Size is enforced per chunk so an oversized body is rejected without
/// buffering it; the magic check fires as soon as five bytes have been
/// seen, the trailer check at `finish`.
#[derive(Debug)]
pub struct StreamValidator {
    cap: u64,
    seen: u64,
    head: Vec<u8>,
    tail: Vec<u8>,
}

impl StreamValidator {
    pub fn new(cap: u64) -> Self {
        Self {
            cap,
            seen: 0,
            head: Vec::with_capacity(PDF_MAGIC.len()),
            tail: Vec::with_capacity(TRAILER_WINDOW),
        }
    }

    /// Feed one chunk. Fails fast on the size cap and on a bad magic.
    pub fn update(&mut self, chunk: &[u8]) -> Result<()> {
        self.seen += chunk.len() as u64;
        if self.seen > self.cap {
            return Err(PipelineError::TooLarge {
                size: self.seen,
                cap: self.cap,
            });
        }

        if self.head.len() < PDF_MAGIC.len() {
            let need = PDF_MAGIC.len() - self.head.len();
            self.head.extend_from_slice(&chunk[..need.min(chunk.len())]);
            if self.head.len() >= PDF_MAGIC.len() && !self.head.starts_with(PDF_MAGIC) {
                return Err(PipelineError::InvalidPdf("missing %PDF- magic".into()));
            }
        }

        // Keep a rolling window of the last TRAILER_WINDOW bytes.
        if chunk.len() >= TRAILER_WINDOW {
            self.tail.clear();
            self.tail
                .extend_from_slice(&chunk[chunk.len() - TRAILER_WINDOW..]);
        } else {
            let overflow = (self.tail.len() + chunk.len()).saturating_sub(TRAILER_WINDOW);
            self.tail.drain(..overflow);
            self.tail.extend_from_slice(chunk);
        }
        Ok(())
    }

    /// Complete validation, returning the byte count.
    pub fn finish(self) -> Result<u64> {
        if self.head.len() < PDF_MAGIC.len() || !self.head.starts_with(PDF_MAGIC) {
            return Err(PipelineError::InvalidPdf("missing %PDF- magic".into()));
        }
        let eof = find_subslice(&self.tail, b"%%EOF")
            .ok_or_else(|| PipelineError::InvalidPdf("missing %%EOF trailer".into()))?;
        match find_subslice(&self.tail, b"startxref") {
            Some(sx) if sx < eof => Ok(self.seen),
            _ => Err(PipelineError::InvalidPdf(
                "missing startxref before %%EOF".into(),
            )),
        }
    }

    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|w| w == needle)
}

/// Validate an already-stored file by streaming it through the validator
/// in bounded chunks. Returns the byte count.
pub fn validate_file(path: &Path, cap: u64) -> Result<u64> {
    let mut file = std::fs::File::open(path)?;
    let mut validator = StreamValidator::new(cap);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        validator.update(&buf[..n])?;
    }
    validator.finish()
}

/// Sanitize a client-supplied filename.
///
/// Strips path components, control characters, and leading dots, coerces
/// to a safe alphabet, preserves the `.pdf` extension, and bounds length
/// to 255 bytes.
pub fn sanitize_filename(declared: &str) -> Result<String> {
    // Drop any directory components, whichever separator convention.
    let base = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(declared)
        .trim();
    let base = base.trim_start_matches('.');

    let mut cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .replace(' ', "_");

    let lower = cleaned.to_lowercase();
    let stem_ok = lower
        .strip_suffix(".pdf")
        .map(|stem| !stem.is_empty())
        .unwrap_or(false);
    if !stem_ok {
        return Err(PipelineError::Validation(format!(
            "filename must end in .pdf: {declared:?}"
        )));
    }

    while cleaned.len() > MAX_FILENAME_BYTES {
        // Trim the stem, keeping the extension.
        let stem_end = cleaned.len() - 4;
        let mut cut = stem_end - 1;
        while cut > 0 && !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            return Err(PipelineError::Validation("filename too long".into()));
        }
        cleaned = format!("{}{}", &cleaned[..cut], &cleaned[stem_end..]);
    }

    Ok(cleaned)
}
