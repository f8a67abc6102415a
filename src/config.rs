//! Configuration for the API and the pipeline worker.
//!
//! Settings load from an optional TOML file with environment overrides for
//! the deployment-sensitive values. Every knob has a default so the binary
//! runs with no config file at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Hard ceiling an administrator cannot raise the upload cap past.
pub const MAX_FILE_SIZE_CEILING: u64 = 200 * 1024 * 1024;

/// Per-stage soft timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_analyze_timeout")]
    pub analyze: u64,
    #[serde(default = "default_extract_timeout")]
    pub extract: u64,
    #[serde(default = "default_measure_timeout")]
    pub measure: u64,
    #[serde(default = "default_interpret_timeout")]
    pub interpret: u64,
    #[serde(default = "default_compose_timeout")]
    pub compose: u64,
}

fn default_analyze_timeout() -> u64 {
    30
}
fn default_extract_timeout() -> u64 {
    180
}
fn default_measure_timeout() -> u64 {
    240
}
fn default_interpret_timeout() -> u64 {
    120
}
fn default_compose_timeout() -> u64 {
    10
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            analyze: default_analyze_timeout(),
            extract: default_extract_timeout(),
            measure: default_measure_timeout(),
            interpret: default_interpret_timeout(),
            compose: default_compose_timeout(),
        }
    }
}

/// Broker-level retry policy around one full processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum delivery attempts before dead-letter.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in seconds.
    #[serde(default = "default_retry_base")]
    pub base_seconds: u64,
    /// Backoff cap in seconds.
    #[serde(default = "default_retry_cap")]
    pub cap_seconds: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base() -> u64 {
    2
}
fn default_retry_cap() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_seconds: default_retry_base(),
            cap_seconds: default_retry_cap(),
        }
    }
}

/// Pricing inputs for the estimate composer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_material_per_sqft")]
    pub material_per_sqft: f64,
    #[serde(default = "default_labor_per_sqft")]
    pub labor_per_sqft: f64,
    /// Labor hours per square foot, used for the labor line item.
    #[serde(default = "default_labor_hours_per_sqft")]
    pub labor_hours_per_sqft: f64,
    /// Hourly labor rate in dollars.
    #[serde(default = "default_labor_rate")]
    pub labor_rate: f64,
}

fn default_material_per_sqft() -> f64 {
    8.00
}
fn default_labor_per_sqft() -> f64 {
    4.00
}
fn default_labor_hours_per_sqft() -> f64 {
    0.02
}
fn default_labor_rate() -> f64 {
    75.0
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            material_per_sqft: default_material_per_sqft(),
            labor_per_sqft: default_labor_per_sqft(),
            labor_hours_per_sqft: default_labor_hours_per_sqft(),
            labor_rate: default_labor_rate(),
        }
    }
}

/// Tunables for the blueprint computer-vision path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvConfig {
    #[serde(default = "default_canny_low")]
    pub canny_low: f32,
    #[serde(default = "default_canny_high")]
    pub canny_high: f32,
    /// Minimum contour area in pixels to consider a roof boundary.
    #[serde(default = "default_min_contour_area")]
    pub min_contour_area: f64,
    #[serde(default = "default_aspect_min")]
    pub aspect_min: f64,
    #[serde(default = "default_aspect_max")]
    pub aspect_max: f64,
    /// Minimum solidity (area / convex hull area) for a roof boundary.
    #[serde(default = "default_min_solidity")]
    pub min_solidity: f64,
}

fn default_canny_low() -> f32 {
    50.0
}
fn default_canny_high() -> f32 {
    150.0
}
fn default_min_contour_area() -> f64 {
    5000.0
}
fn default_aspect_min() -> f64 {
    0.3
}
fn default_aspect_max() -> f64 {
    3.0
}
fn default_min_solidity() -> f64 {
    0.6
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            canny_low: default_canny_low(),
            canny_high: default_canny_high(),
            min_contour_area: default_min_contour_area(),
            aspect_min: default_aspect_min(),
            aspect_max: default_aspect_max(),
            min_solidity: default_min_solidity(),
        }
    }
}

/// LLM adapter configuration (Ollama-compatible endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Model used for vision calls (page images).
    #[serde(default = "default_llm_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    /// Character budget for prompt content truncation.
    #[serde(default = "default_llm_max_content_chars")]
    pub max_content_chars: usize,
    /// Per-call timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    /// Below this CV confidence, the measurer consults LLM vision.
    #[serde(default = "default_vision_fallback_threshold")]
    pub confidence_fallback_threshold: f64,
    /// Sustained adapter calls per minute (token bucket).
    #[serde(default = "default_llm_rate_per_minute")]
    pub rate_per_minute: u32,
}

fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_llm_vision_model() -> String {
    "llava:13b".to_string()
}
fn default_llm_max_tokens() -> u32 {
    1024
}
fn default_llm_max_content_chars() -> usize {
    24_000
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_vision_fallback_threshold() -> f64 {
    0.7
}
fn default_llm_rate_per_minute() -> u32 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            vision_model: default_llm_vision_model(),
            max_tokens: default_llm_max_tokens(),
            max_content_chars: default_llm_max_content_chars(),
            timeout_seconds: default_llm_timeout(),
            confidence_fallback_threshold: default_vision_fallback_threshold(),
            rate_per_minute: default_llm_rate_per_minute(),
        }
    }
}

/// OCR configuration (system tesseract binary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_language")]
    pub language: String,
    /// Tesseract page segmentation mode.
    #[serde(default = "default_ocr_psm")]
    pub psm_mode: u32,
}

fn default_ocr_language() -> String {
    "eng".to_string()
}
fn default_ocr_psm() -> u32 {
    3
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: default_ocr_language(),
            psm_mode: default_ocr_psm(),
        }
    }
}

/// Worker, lease, and janitor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Parallel in-flight jobs per worker process.
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    /// Queue poll interval in seconds when idle.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Lease duration stamped at Phase A.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Lease refresh interval during Phase B.
    #[serde(default = "default_lease_refresh_seconds")]
    pub lease_refresh_seconds: u64,
    /// Janitor sweep interval.
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_seconds: u64,
    /// Hard wall-clock cap on one job.
    #[serde(default = "default_job_cap_seconds")]
    pub job_cap_seconds: u64,
    /// Broker visibility timeout for claimed jobs.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
}

fn default_worker_concurrency() -> usize {
    4
}
fn default_poll_interval() -> u64 {
    2
}
fn default_lease_seconds() -> u64 {
    600
}
fn default_lease_refresh_seconds() -> u64 {
    60
}
fn default_janitor_interval() -> u64 {
    300
}
fn default_job_cap_seconds() -> u64 {
    1800
}
fn default_visibility_timeout() -> u64 {
    1800
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            poll_interval_seconds: default_poll_interval(),
            lease_seconds: default_lease_seconds(),
            lease_refresh_seconds: default_lease_refresh_seconds(),
            janitor_interval_seconds: default_janitor_interval(),
            job_cap_seconds: default_job_cap_seconds(),
            visibility_timeout_seconds: default_visibility_timeout(),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the database, blobs, and scratch space.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upload size cap in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Secret used to sign presigned upload URLs.
    #[serde(default = "default_presign_secret")]
    pub presign_secret: String,
    /// Presigned URL lifetime in seconds.
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_seconds: u64,
    #[serde(default)]
    pub stage_timeouts_seconds: StageTimeouts,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub cv: CvConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_max_file_size() -> u64 {
    104_857_600
}
fn default_presign_secret() -> String {
    "change-me".to_string()
}
fn default_presign_ttl() -> u64 {
    900
}

impl Default for Settings {
    fn default() -> Self {
        // serde defaults are the single source of truth
        toml::from_str("").expect("empty settings must deserialize")
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults when the
    /// file is absent. `BRANT_DATA_DIR` and `BRANT_LLM_ENDPOINT` override.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings: Settings = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    PipelineError::Validation(format!("cannot read config {}: {e}", p.display()))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| PipelineError::Validation(format!("bad config: {e}")))?
            }
            None => Settings::default(),
        };

        if let Ok(dir) = std::env::var("BRANT_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Ok(endpoint) = std::env::var("BRANT_LLM_ENDPOINT") {
            settings.llm.endpoint = endpoint;
        }
        if let Ok(secret) = std::env::var("BRANT_PRESIGN_SECRET") {
            settings.presign_secret = secret;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings no deployment should run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size_bytes > MAX_FILE_SIZE_CEILING {
            return Err(PipelineError::Validation(format!(
                "max_file_size_bytes {} exceeds ceiling {}",
                self.max_file_size_bytes, MAX_FILE_SIZE_CEILING
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(PipelineError::Validation(
                "worker concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Validation(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("brant.db")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }

    pub fn stage_timeout(&self, stage: &str) -> Duration {
        let secs = match stage {
            "analyze" => self.stage_timeouts_seconds.analyze,
            "extract" => self.stage_timeouts_seconds.extract,
            "measure" => self.stage_timeouts_seconds.measure,
            "interpret" => self.stage_timeouts_seconds.interpret,
            "compose" => self.stage_timeouts_seconds.compose,
            _ => 60,
        };
        Duration::from_secs(secs)
    }
}
