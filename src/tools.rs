//! External tool adapters: poppler utilities and Tesseract OCR.
//!
//! All PDF rendering and OCR goes through system binaries invoked with
//! bounded scratch space. A missing binary surfaces as an upstream error
//! so the broker retries once an operator installs it.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{PipelineError, Result};

/// Check whether a binary is on PATH.
pub fn binary_available(name: &str) -> bool {
    which::which(name).is_ok()
}

fn run_for_stdout(mut cmd: Command, tool: &str) -> Result<String> {
    match cmd.output() {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PipelineError::Upstream(format!("{tool} failed: {stderr}")))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::Upstream(
            format!("{tool} not found on PATH"),
        )),
        Err(e) => Err(PipelineError::Upstream(format!("{tool}: {e}"))),
    }
}

fn run_for_status(mut cmd: Command, tool: &str) -> Result<()> {
    match cmd.status() {
        Ok(s) if s.success() => Ok(()),
        Ok(_) => Err(PipelineError::Upstream(format!("{tool} exited nonzero"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::Upstream(
            format!("{tool} not found on PATH"),
        )),
        Err(e) => Err(PipelineError::Upstream(format!("{tool}: {e}"))),
    }
}

/// PDF metadata from `pdfinfo`.
#[derive(Debug, Clone, Default)]
pub struct PdfInfo {
    pub page_count: u32,
    pub encrypted: bool,
}

/// Read page count and encryption status.
pub fn pdf_info(path: &Path) -> Result<PdfInfo> {
    let mut cmd = Command::new("pdfinfo");
    cmd.arg(path);
    let stdout = run_for_stdout(cmd, "pdfinfo")?;

    let mut info = PdfInfo::default();
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Pages:") {
            info.page_count = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Encrypted:") {
            info.encrypted = rest.trim().starts_with("yes");
        }
    }
    Ok(info)
}

/// Extract the text layer with `pdftotext -layout`.
pub fn pdf_text(path: &Path) -> Result<String> {
    let mut cmd = Command::new("pdftotext");
    cmd.arg("-layout").arg(path).arg("-");
    run_for_stdout(cmd, "pdftotext")
}

/// Render pages to PNG with `pdftoppm` at the given DPI. Returns the
/// generated image paths in page order.
pub fn render_pages(
    pdf_path: &Path,
    output_dir: &Path,
    dpi: u32,
    first: u32,
    last: u32,
) -> Result<Vec<PathBuf>> {
    let prefix = output_dir.join("page");
    let mut cmd = Command::new("pdftoppm");
    cmd.args([
        "-png",
        "-r",
        &dpi.to_string(),
        "-f",
        &first.to_string(),
        "-l",
        &last.to_string(),
    ])
    .arg(pdf_path)
    .arg(&prefix);
    run_for_status(cmd, "pdftoppm")?;

    let mut pages = Vec::new();
    for page in first..=last {
        if let Some(path) = find_page_image(output_dir, page) {
            pages.push(path);
        }
    }
    if pages.is_empty() {
        return Err(PipelineError::UnreadablePages);
    }
    Ok(pages)
}

/// pdftoppm zero-pads page numbers to the digit count of the last page.
fn find_page_image(dir: &Path, page: u32) -> Option<PathBuf> {
    for digits in [1, 2, 3, 4] {
        let candidate = dir.join(format!("page-{page:0width$}.png", width = digits));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Run Tesseract over an image file, returning the recognized text.
pub fn tesseract_ocr(image_path: &Path, language: &str, psm_mode: u32) -> Result<String> {
    let mut cmd = Command::new("tesseract");
    cmd.arg(image_path)
        .arg("stdout")
        .args(["-l", language])
        .args(["--psm", &psm_mode.to_string()]);
    run_for_stdout(cmd, "tesseract")
}
