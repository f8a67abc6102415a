//! Command-line interface: serve, worker, janitor, migrate, process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::blobstore::BlobStore;
use crate::config::Settings;
use crate::llm::LlmClient;
use crate::pipeline::Orchestrator;
use crate::queue::JobQueue;
use crate::repository::{self, DocumentRepository};
use crate::server;
use crate::worker::PipelineWorker;

#[derive(Debug, Parser)]
#[command(name = "brant", about = "Commercial roofing estimate pipeline", version)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true, env = "BRANT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the ingest API server.
    Serve {
        /// Bind host override.
        #[arg(long)]
        host: Option<String>,
        /// Bind port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the pipeline worker.
    Worker,
    /// Run one janitor sweep and exit.
    Janitor,
    /// Create or update the database schema.
    Migrate,
    /// Run the pipeline inline on a local PDF and print the estimate.
    Process {
        /// Path to the PDF file.
        file: PathBuf,
    },
}

/// Parse arguments and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            let settings = Arc::new(settings);
            ensure_schema(&settings)?;
            server::serve(settings).await
        }
        Command::Worker => {
            let settings = Arc::new(settings);
            ensure_schema(&settings)?;
            let (repo, queue, orchestrator) = build_worker_parts(&settings)?;
            PipelineWorker::new(settings, repo, queue, orchestrator)
                .run()
                .await
        }
        Command::Janitor => {
            let settings = Arc::new(settings);
            ensure_schema(&settings)?;
            let (_repo, _queue, orchestrator) = build_worker_parts(&settings)?;
            orchestrator.janitor_sweep()?;
            info!("janitor sweep complete");
            Ok(())
        }
        Command::Migrate => {
            std::fs::create_dir_all(&settings.data_dir)?;
            let tables = repository::run_migrations(&settings.db_path())?;
            for table in tables {
                println!("{table}");
            }
            Ok(())
        }
        Command::Process { file } => {
            let settings = Arc::new(settings);
            ensure_schema(&settings)?;
            process_inline(&settings, &file).await
        }
    }
}

fn ensure_schema(settings: &Settings) -> anyhow::Result<()> {
    std::fs::create_dir_all(&settings.data_dir)?;
    repository::run_migrations(&settings.db_path())?;
    Ok(())
}

fn build_worker_parts(
    settings: &Arc<Settings>,
) -> anyhow::Result<(Arc<DocumentRepository>, Arc<JobQueue>, Arc<Orchestrator>)> {
    let repo = Arc::new(DocumentRepository::new(&settings.db_path())?);
    let queue = Arc::new(JobQueue::new(&settings.db_path())?);
    let public_base = format!("http://{}:{}", settings.host, settings.port);
    let blobs = BlobStore::new(
        settings.blobs_dir(),
        settings.presign_secret.clone(),
        public_base,
    )?;
    let llm = LlmClient::new(settings.llm.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        repo.clone(),
        queue.clone(),
        blobs,
        llm,
    ));
    Ok((repo, queue, orchestrator))
}

/// One-shot pipeline run for a local file, bypassing the API.
async fn process_inline(settings: &Arc<Settings>, file: &std::path::Path) -> anyhow::Result<()> {
    use crate::models::Document;
    use crate::validate::{sanitize_filename, validate_file};

    let (repo, queue, orchestrator) = build_worker_parts(settings)?;
    let blobs = BlobStore::new(
        settings.blobs_dir(),
        settings.presign_secret.clone(),
        format!("http://{}:{}", settings.host, settings.port),
    )?;

    let declared = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document.pdf");
    let filename = sanitize_filename(declared)?;
    let size_bytes = validate_file(file, settings.max_file_size_bytes)?;

    let document_id = uuid::Uuid::new_v4().to_string();
    let blob_name = BlobStore::object_name(&document_id, &filename);
    let dest = blobs.prepare_write(&blob_name)?;
    std::fs::copy(file, &dest)?;

    let mut doc = Document::new(filename, blob_name, size_bytes, document_id.clone());
    doc.id = document_id;
    let (doc, _) = repo.create_or_get(&doc)?;
    queue.enqueue(&doc.id)?;

    let job = queue
        .claim(Duration::from_secs(settings.worker.visibility_timeout_seconds))
        .ok()
        .flatten()
        .ok_or_else(|| anyhow::anyhow!("no job claimed"))?;
    orchestrator.process_job(&job).await?;
    queue.ack(job.id)?;

    match repo.get_estimate(&doc.id)? {
        Some(estimate) => {
            println!("{}", serde_json::to_string_pretty(&estimate)?);
            Ok(())
        }
        None => {
            let doc = repo.get_required(&doc.id)?;
            anyhow::bail!(
                "processing did not complete: status={} error={:?}",
                doc.status.as_str(),
                doc.error_message
            )
        }
    }
}
