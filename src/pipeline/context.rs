//! Per-job execution context shared by all stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::Settings;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::models::Document;

/// Everything a stage needs: configuration, adapters, the document under
/// work, and scratch space that vanishes with the job.
pub struct StageContext {
    pub settings: Arc<Settings>,
    pub llm: LlmClient,
    pub document: Document,
    /// Local path of the downloaded PDF.
    pub pdf_path: PathBuf,
    /// Job-scoped scratch directory, removed on drop (success, failure,
    /// or cancellation alike).
    scratch: TempDir,
}

impl StageContext {
    pub fn new(
        settings: Arc<Settings>,
        llm: LlmClient,
        document: Document,
        pdf_path: PathBuf,
    ) -> Result<Self> {
        std::fs::create_dir_all(settings.scratch_dir())?;
        let scratch = TempDir::with_prefix_in("job-", settings.scratch_dir())?;
        Ok(Self {
            settings,
            llm,
            document,
            pdf_path,
            scratch,
        })
    }

    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    /// A fresh subdirectory under the job scratch space.
    pub fn scratch_subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.scratch.path().join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
