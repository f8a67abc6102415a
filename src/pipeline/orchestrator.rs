//! Pipeline orchestrator: the three-phase commit around stage execution.
//!
//! Phase A claims the document row under a write transaction. Phase B
//! runs the stages with no row lock held, refreshing the lease and
//! checking cancellation at every stage boundary. Phase C commits the
//! estimate (or the terminal failure) under a second write transaction
//! guarded by lease identity, so a late or overtaken worker can never
//! clobber another's result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{analyzer, composer, extractor, interpreter, measurer, stage_spec, StageContext};
use crate::blobstore::BlobStore;
use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::llm::LlmClient;
use crate::models::{Document, DocumentKind, Estimate, ProcessingStatus};
use crate::queue::{Job, JobQueue};
use crate::repository::{AcquireOutcome, CommitOutcome, DocumentRepository};

/// Phase A claim retries before giving the job back to the broker.
const ACQUIRE_ATTEMPTS: u32 = 5;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(200);

/// Drives one document through the pipeline per delivered job.
pub struct Orchestrator {
    settings: Arc<Settings>,
    repo: Arc<DocumentRepository>,
    queue: Arc<JobQueue>,
    blobs: BlobStore,
    llm: LlmClient,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        repo: Arc<DocumentRepository>,
        queue: Arc<JobQueue>,
        blobs: BlobStore,
        llm: LlmClient,
    ) -> Self {
        Self {
            settings,
            repo,
            queue,
            blobs,
            llm,
        }
    }

    /// Handle one delivered job. `Ok(())` means the job is settled and
    /// must be acked; `Err` means a retryable failure the caller should
    /// nack for redelivery.
    pub async fn process_job(&self, job: &Job) -> Result<()> {
        let lease_id = uuid::Uuid::new_v4().to_string();

        // Phase A: acquire.
        let document = match self.acquire_with_retry(&job.document_id, &lease_id).await? {
            Some(doc) => doc,
            None => return Ok(()),
        };
        info!(
            document_id = %document.id,
            attempt = document.attempt_count,
            "acquired document"
        );

        // Phase B under the hard wall-clock cap, then Phase C.
        let cap = Duration::from_secs(self.settings.worker.job_cap_seconds);
        let started = Instant::now();
        let outcome = match timeout(cap, self.execute(job, &document, &lease_id)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Failed(format!(
                "job exceeded wall-clock cap of {}s",
                cap.as_secs()
            ))),
        };

        match outcome {
            Ok(estimate) => {
                match self
                    .repo
                    .commit_estimate(&document.id, &lease_id, &estimate)?
                {
                    CommitOutcome::Committed => {
                        info!(
                            document_id = %document.id,
                            cost = estimate.estimated_cost,
                            elapsed = started.elapsed().as_secs_f64(),
                            "estimate committed"
                        );
                    }
                    CommitOutcome::Overtaken => {
                        warn!(document_id = %document.id, "overtaken at commit, results discarded");
                    }
                }
                Ok(())
            }
            Err(PipelineError::Cancelled) => {
                info!(document_id = %document.id, "cancellation observed at stage boundary");
                self.repo.commit_cancelled(&document.id, &lease_id)?;
                self.apply_retention(&document);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(document_id = %document.id, "retryable failure: {e}");
                // Free the row so broker redelivery is not blocked on
                // the lease.
                self.repo.release_for_retry(&document.id, &lease_id)?;
                Err(e)
            }
            Err(e) => {
                error!(document_id = %document.id, kind = e.kind(), "terminal failure: {e}");
                self.repo
                    .commit_failure(&document.id, &lease_id, e.kind(), &e.to_string())?;
                self.apply_retention(&document);
                Ok(())
            }
        }
    }

    async fn acquire_with_retry(
        &self,
        document_id: &str,
        lease_id: &str,
    ) -> Result<Option<Document>> {
        let lease_seconds = self.settings.worker.lease_seconds;
        let mut last_err = None;
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            match self.repo.acquire(document_id, lease_id, lease_seconds) {
                Ok(AcquireOutcome::Acquired(doc)) => return Ok(Some(doc)),
                Ok(AcquireOutcome::HeldElsewhere) => {
                    debug!(document_id, "duplicate delivery, live lease elsewhere");
                    return Ok(None);
                }
                Ok(AcquireOutcome::NotClaimable(status)) => {
                    debug!(document_id, status = status.as_str(), "not claimable");
                    return Ok(None);
                }
                Err(PipelineError::NotFound(_)) => {
                    warn!(document_id, "job references unknown document");
                    return Ok(None);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < ACQUIRE_ATTEMPTS {
                        tokio::time::sleep(ACQUIRE_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| PipelineError::Internal("acquire failed".into())))
    }

    /// Phase B: download, stage execution, estimate composition. Holds
    /// no row lock; the lease refresher is the only writer.
    async fn execute(&self, job: &Job, document: &Document, lease_id: &str) -> Result<Estimate> {
        let pdf_path = self.blobs.download(&document.blob_ref)?;
        let ctx = StageContext::new(
            self.settings.clone(),
            self.llm.clone(),
            document.clone(),
            pdf_path,
        )?;

        // Background lease refresh; flags us overtaken if the lease is
        // lost so the next boundary aborts.
        let overtaken = Arc::new(AtomicBool::new(false));
        let refresher = self.spawn_lease_refresher(document.id.clone(), lease_id, &overtaken);

        let result = self.run_stages(job, &ctx, &overtaken).await;
        refresher.abort();
        result
    }

    fn spawn_lease_refresher(
        &self,
        document_id: String,
        lease_id: &str,
        overtaken: &Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let repo = self.repo.clone();
        let lease_id = lease_id.to_string();
        let overtaken = overtaken.clone();
        let every = Duration::from_secs(self.settings.worker.lease_refresh_seconds);
        let lease_seconds = self.settings.worker.lease_seconds;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                match repo.refresh_lease(&document_id, &lease_id, lease_seconds) {
                    Ok(true) => debug!(document_id = %document_id, "lease refreshed"),
                    Ok(false) => {
                        warn!(document_id = %document_id, "lease lost");
                        overtaken.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => warn!(document_id = %document_id, "lease refresh failed: {e}"),
                }
            }
        })
    }

    /// Stage boundary: abort on lost lease, observe cancellation, report
    /// progress.
    fn stage_boundary(&self, job: &Job, ctx: &StageContext, overtaken: &AtomicBool, stage: &str) -> Result<()> {
        if overtaken.load(Ordering::SeqCst) {
            return Err(PipelineError::Conflict("lease lost during execution".into()));
        }
        if self.repo.is_cancel_requested(&ctx.document.id)? {
            return Err(PipelineError::Cancelled);
        }
        let spec = stage_spec(stage);
        if let Err(e) = self.queue.set_progress(job.id, spec.name, spec.progress) {
            debug!("progress report failed: {e}");
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        job: &Job,
        ctx: &StageContext,
        overtaken: &AtomicBool,
    ) -> Result<Estimate> {
        let started = Instant::now();
        let mut stages_completed: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // Stage 1: analyze.
        self.stage_boundary(job, ctx, overtaken, "analyze")?;
        let kind = self
            .run_timed("analyze", analyzer::classify(ctx))
            .await?;
        stages_completed.push("analyze".into());

        // Stage 2: extract.
        self.stage_boundary(job, ctx, overtaken, "extract")?;
        let content = self
            .run_timed("extract", extractor::extract(ctx, kind))
            .await?;
        stages_completed.push("extract".into());

        // Stage 3: measure, blueprint branch only.
        let measurement = if kind == DocumentKind::Blueprint {
            self.stage_boundary(job, ctx, overtaken, "measure")?;
            let outcome = self
                .run_timed("measure", measurer::measure(ctx, &content))
                .await?;
            stages_completed.push("measure".into());
            warnings.extend(outcome.warnings);
            Some(outcome.result)
        } else {
            None
        };

        // Stage 4: interpret.
        self.stage_boundary(job, ctx, overtaken, "interpret")?;
        let interpretation = self
            .run_timed("interpret", interpreter::interpret(ctx, &content))
            .await?;
        stages_completed.push("interpret".into());

        // Stage 5: compose.
        self.stage_boundary(job, ctx, overtaken, "compose")?;
        let mut stage_confidences = vec![content.confidence];
        if let Some(m) = &measurement {
            if m.total_sqft > 0.0 {
                stage_confidences.push(m.confidence);
            }
            if let Some(rec) = &m.reconciliation {
                stage_confidences.push(rec.verification_confidence);
            }
        }
        stage_confidences.push(interpretation.confidence);

        let estimate = composer::compose(
            &self.settings.pricing,
            composer::ComposeInput {
                document_id: &ctx.document.id,
                interpretation: &interpretation,
                measurement: measurement.as_ref(),
                stage_confidences: &stage_confidences,
                stages_completed: {
                    let mut s = stages_completed.clone();
                    s.push("compose".into());
                    s
                },
                warnings,
                elapsed_seconds: started.elapsed().as_secs_f64(),
            },
        )?;

        // Final boundary so a cancel landing during compose still wins.
        self.stage_boundary(job, ctx, overtaken, "compose")?;
        Ok(estimate)
    }

    async fn run_timed<T>(
        &self,
        stage: &'static str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.settings.stage_timeout(stage);
        let started = Instant::now();
        match timeout(limit, fut).await {
            Ok(result) => {
                debug!(stage, elapsed = started.elapsed().as_secs_f64(), "stage finished");
                result
            }
            Err(_) => Err(PipelineError::StageTimeout {
                stage,
                seconds: limit.as_secs(),
            }),
        }
    }

    /// Terminal FAILED and CANCELLED documents release their stored
    /// blob per the retention policy.
    fn apply_retention(&self, document: &Document) {
        if let Err(e) = self.blobs.delete(&document.blob_ref) {
            warn!(document_id = %document.id, "retention delete failed: {e}");
        }
    }

    /// One janitor sweep: recover expired leases and claims, and
    /// reconcile dead-lettered jobs to FAILED rows.
    pub fn janitor_sweep(&self) -> Result<()> {
        let recovered = self
            .repo
            .recover_expired_leases(self.settings.retry.max_attempts)?;
        for (document_id, status) in &recovered {
            info!(document_id = %document_id, status = status.as_str(), "lease recovered");
            if *status == ProcessingStatus::Pending {
                // Give the recovered document a fresh delivery.
                self.queue.enqueue(document_id)?;
            }
        }

        let requeued = self.queue.recover_expired_claims()?;
        if requeued > 0 {
            info!(requeued, "expired queue claims returned");
        }

        for (job_id, document_id, last_error) in self.queue.dead_lettered()? {
            let message = last_error.unwrap_or_else(|| "retries exhausted".to_string());
            if self
                .repo
                .fail_document(&document_id, "upstream_error", &message)?
            {
                info!(document_id = %document_id, "dead-lettered job reconciled to failed");
            }
            self.queue.resolve_dead_letter(job_id)?;
        }
        Ok(())
    }
}
