//! Worker process: claims jobs from the queue and runs the pipeline
//! with bounded concurrency. A janitor task sweeps expired leases and
//! dead letters in the background.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::pipeline::Orchestrator;
use crate::queue::{JobQueue, NackOutcome};
use crate::repository::DocumentRepository;

pub struct PipelineWorker {
    settings: Arc<Settings>,
    repo: Arc<DocumentRepository>,
    queue: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
}

impl PipelineWorker {
    pub fn new(
        settings: Arc<Settings>,
        repo: Arc<DocumentRepository>,
        queue: Arc<JobQueue>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            settings,
            repo,
            queue,
            orchestrator,
        }
    }

    /// Run the poll loop until ctrl-c. In-flight jobs finish before the
    /// process exits.
    pub async fn run(&self) -> anyhow::Result<()> {
        let concurrency = self.settings.worker.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let poll = Duration::from_secs(self.settings.worker.poll_interval_seconds);
        let visibility = Duration::from_secs(self.settings.worker.visibility_timeout_seconds);

        info!(concurrency, "pipeline worker started");
        let janitor = self.spawn_janitor();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested, draining in-flight jobs");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    let permit = permit.expect("semaphore never closed");
                    match self.queue.claim(visibility) {
                        Ok(Some(job)) => {
                            let orchestrator = self.orchestrator.clone();
                            let queue = self.queue.clone();
                            let repo = self.repo.clone();
                            let retry = self.settings.retry.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                let document_id = job.document_id.clone();
                                match orchestrator.process_job(&job).await {
                                    Ok(()) => {
                                        if let Err(e) = queue.ack(job.id) {
                                            warn!(document_id = %document_id, "ack failed: {e}");
                                        }
                                    }
                                    Err(e) => {
                                        match queue.nack(job.id, &e.to_string(), &retry) {
                                            Ok(NackOutcome::Requeued(delay)) => {
                                                info!(
                                                    document_id = %document_id,
                                                    delay_seconds = delay,
                                                    "job requeued: {e}"
                                                );
                                            }
                                            Ok(NackOutcome::DeadLettered) => {
                                                warn!(document_id = %document_id, "job dead-lettered: {e}");
                                                if let Err(fail_err) = repo.fail_document(
                                                    &document_id,
                                                    e.kind(),
                                                    &e.to_string(),
                                                ) {
                                                    error!(
                                                        document_id = %document_id,
                                                        "failed to mark document failed: {fail_err}"
                                                    );
                                                }
                                            }
                                            Err(nack_err) => {
                                                error!(document_id = %document_id, "nack failed: {nack_err}");
                                            }
                                        }
                                    }
                                }
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            tokio::time::sleep(poll).await;
                        }
                        Err(e) => {
                            drop(permit);
                            warn!("queue claim failed: {e}");
                            tokio::time::sleep(poll).await;
                        }
                    }
                }
            }
        }

        // Wait for permits to drain before returning.
        let _ = semaphore.acquire_many(concurrency as u32).await;
        janitor.abort();
        info!("pipeline worker stopped");
        Ok(())
    }

    fn spawn_janitor(&self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let every = Duration::from_secs(self.settings.worker.janitor_interval_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = orchestrator.janitor_sweep() {
                    warn!("janitor sweep failed: {e}");
                }
            }
        })
    }
}
