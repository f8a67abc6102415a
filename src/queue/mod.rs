//! Durable job queue backed by the same SQLite database.
//!
//! Delivery is at-least-once: claims carry a visibility timeout and
//! expire back to the queue if a worker dies. Duplicate suppression is
//! the orchestrator's Phase A status check, not the queue's job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, Row};

use crate::config::RetryConfig;
use crate::error::Result;
use crate::repository::{parse_datetime, to_option};

/// Queue name carried in every job row.
pub const QUEUE_NAME: &str = "brant.pipeline.jobs";

/// A delivered job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub document_id: String,
    /// Delivery attempt, 1-based after the first claim.
    pub attempt: u32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// What happened to a nacked job.
#[derive(Debug, PartialEq, Eq)]
pub enum NackOutcome {
    /// Requeued with a backoff delay in seconds.
    Requeued(u64),
    DeadLettered,
}

/// Compute the backoff delay for the given completed attempt count:
/// exponential from `base`, capped, with up to ±20% jitter.
pub fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = retry.base_seconds.saturating_mul(1u64 << exp);
    let capped = raw.min(retry.cap_seconds) as f64;
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}

/// SQLite-backed job queue.
pub struct JobQueue {
    db_path: PathBuf,
}

impl JobQueue {
    pub fn new(db_path: &Path) -> Result<Self> {
        let queue = Self {
            db_path: db_path.to_path_buf(),
        };
        queue.init_schema()?;
        Ok(queue)
    }

    fn connect(&self) -> Result<Connection> {
        crate::repository::connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                document_id TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                stage TEXT,
                progress REAL NOT NULL DEFAULT 0.0,
                enqueued_at TEXT NOT NULL,
                visible_at TEXT NOT NULL,
                claimed_at TEXT,
                claim_expires_at TEXT,
                last_error TEXT
            );

            -- At most one open job per document.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_open_document
                ON pipeline_jobs(document_id)
                WHERE status IN ('queued', 'claimed');
            CREATE INDEX IF NOT EXISTS idx_jobs_claimable
                ON pipeline_jobs(status, visible_at);
        "#,
        )?;
        Ok(())
    }

    /// Enqueue a job for a document. Idempotent: a document with an open
    /// job keeps its existing one. Returns `(job_id, created)`.
    pub fn enqueue(&self, document_id: &str) -> Result<(i64, bool)> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<(i64, bool)> = (|| {
            if let Some(existing) = to_option(conn.query_row(
                "SELECT id FROM pipeline_jobs WHERE document_id = ? AND status IN ('queued', 'claimed')",
                params![document_id],
                |row| row.get::<_, i64>(0),
            ))? {
                return Ok((existing, false));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                r#"
                INSERT INTO pipeline_jobs (queue, document_id, enqueued_at, visible_at)
                VALUES (?, ?, ?, ?)
                "#,
                params![QUEUE_NAME, document_id, now, now],
            )?;
            Ok((conn.last_insert_rowid(), true))
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Atomically claim the oldest visible job, stamping a visibility
    /// timeout. Returns None when the queue is empty.
    pub fn claim(&self, visibility: Duration) -> Result<Option<Job>> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Option<Job>> = (|| {
            let now = Utc::now();
            let job = to_option(conn.query_row(
                r#"
                SELECT id, document_id, attempt, enqueued_at FROM pipeline_jobs
                WHERE status = 'queued' AND visible_at <= ?
                ORDER BY id ASC
                LIMIT 1
                "#,
                params![now.to_rfc3339()],
                row_to_job,
            ))?;

            let mut job = match job {
                Some(j) => j,
                None => return Ok(None),
            };

            let expires = now + chrono::Duration::seconds(visibility.as_secs() as i64);
            conn.execute(
                r#"
                UPDATE pipeline_jobs
                SET status = 'claimed', attempt = attempt + 1,
                    claimed_at = ?, claim_expires_at = ?
                WHERE id = ?
                "#,
                params![now.to_rfc3339(), expires.to_rfc3339(), job.id],
            )?;
            job.attempt += 1;
            Ok(Some(job))
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Acknowledge a job as finished (success or terminal failure both
    /// ack; the document row carries the outcome).
    pub fn ack(&self, job_id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pipeline_jobs SET status = 'done', claim_expires_at = NULL WHERE id = ?",
            params![job_id],
        )?;
        Ok(())
    }

    /// Negative-acknowledge: requeue with exponential backoff, or
    /// dead-letter once the attempt cap is reached.
    pub fn nack(&self, job_id: i64, error: &str, retry: &RetryConfig) -> Result<NackOutcome> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<NackOutcome> = (|| {
            let attempt: u32 = conn.query_row(
                "SELECT attempt FROM pipeline_jobs WHERE id = ?",
                params![job_id],
                |row| row.get::<_, i64>(0).map(|a| a as u32),
            )?;

            if attempt >= retry.max_attempts {
                conn.execute(
                    "UPDATE pipeline_jobs SET status = 'dead', last_error = ?, claim_expires_at = NULL WHERE id = ?",
                    params![error, job_id],
                )?;
                return Ok(NackOutcome::DeadLettered);
            }

            let delay = backoff_delay(attempt, retry);
            let visible = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            conn.execute(
                r#"
                UPDATE pipeline_jobs
                SET status = 'queued', visible_at = ?, last_error = ?,
                    claimed_at = NULL, claim_expires_at = NULL
                WHERE id = ?
                "#,
                params![visible.to_rfc3339(), error, job_id],
            )?;
            Ok(NackOutcome::Requeued(delay.as_secs()))
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Record the stage and progress of a claimed job, surfaced by the
    /// status endpoint.
    pub fn set_progress(&self, job_id: i64, stage: &str, progress: f64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pipeline_jobs SET stage = ?, progress = ? WHERE id = ?",
            params![stage, progress.clamp(0.0, 1.0), job_id],
        )?;
        Ok(())
    }

    /// Latest stage/progress for a document's most recent job.
    pub fn latest_progress(&self, document_id: &str) -> Result<Option<(Option<String>, f64)>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            r#"
            SELECT stage, progress FROM pipeline_jobs
            WHERE document_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
            params![document_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))
    }

    /// Return expired claims to the queue (worker died mid-flight).
    /// At-least-once redelivery; Phase A filters true duplicates.
    pub fn recover_expired_claims(&self) -> Result<u64> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            r#"
            UPDATE pipeline_jobs
            SET status = 'queued', visible_at = ?, claimed_at = NULL, claim_expires_at = NULL
            WHERE status = 'claimed' AND claim_expires_at < ?
            "#,
            params![now, now],
        )?;
        Ok(updated as u64)
    }

    /// Document ids sitting in the dead-letter state, for janitor
    /// reconciliation to FAILED rows.
    pub fn dead_lettered(&self) -> Result<Vec<(i64, String, Option<String>)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, last_error FROM pipeline_jobs WHERE status = 'dead'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark a dead-lettered job as reconciled.
    pub fn resolve_dead_letter(&self, job_id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pipeline_jobs SET status = 'done' WHERE id = ? AND status = 'dead'",
            params![job_id],
        )?;
        Ok(())
    }

    /// Depth of the queue (visible + claimed), for the health endpoint.
    pub fn depth(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pipeline_jobs WHERE status IN ('queued', 'claimed')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn finish_tx<T>(conn: &Connection, result: &Result<T>) {
    if result.is_ok() {
        let _ = conn.execute("COMMIT", []);
    } else {
        let _ = conn.execute("ROLLBACK", []);
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        document_id: row.get(1)?,
        attempt: row.get::<_, i64>(2)? as u32,
        enqueued_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue() -> (JobQueue, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let queue = JobQueue::new(&dir.path().join("test.db")).unwrap();
        (queue, dir)
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_seconds: 2,
            cap_seconds: 60,
        }
    }

    #[test]
    fn test_enqueue_is_idempotent_per_document() {
        let (queue, _dir) = queue();
        let (first, created) = queue.enqueue("doc-1").unwrap();
        assert!(created);
        let (second, created) = queue.enqueue("doc-1").unwrap();
        assert!(!created);
        assert_eq!(first, second);

        // A different document gets its own job.
        let (third, created) = queue.enqueue("doc-2").unwrap();
        assert!(created);
        assert_ne!(first, third);
    }

    #[test]
    fn test_claim_is_fifo_and_exclusive() {
        let (queue, _dir) = queue();
        queue.enqueue("doc-1").unwrap();
        queue.enqueue("doc-2").unwrap();

        let first = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(first.document_id, "doc-1");
        assert_eq!(first.attempt, 1);

        let second = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(second.document_id, "doc-2");

        assert!(queue.claim(Duration::from_secs(60)).unwrap().is_none());
    }

    #[test]
    fn test_ack_allows_reenqueue() {
        let (queue, _dir) = queue();
        let (job_id, _) = queue.enqueue("doc-1").unwrap();
        let job = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(job.id, job_id);
        queue.ack(job.id).unwrap();

        let (next, created) = queue.enqueue("doc-1").unwrap();
        assert!(created);
        assert_ne!(next, job_id);
    }

    #[test]
    fn test_nack_requeues_with_delay_then_dead_letters() {
        let (queue, _dir) = queue();
        queue.enqueue("doc-1").unwrap();

        let job = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        let outcome = queue.nack(job.id, "ocr unavailable", &retry()).unwrap();
        assert!(matches!(outcome, NackOutcome::Requeued(_)));

        // Backoff delay keeps it invisible right now.
        assert!(queue.claim(Duration::from_secs(60)).unwrap().is_none());

        // Burn the remaining attempts directly.
        let conn = queue.connect().unwrap();
        conn.execute(
            "UPDATE pipeline_jobs SET visible_at = ?, attempt = 3",
            params![(Utc::now() - chrono::Duration::seconds(1)).to_rfc3339()],
        )
        .unwrap();
        drop(conn);

        let outcome = queue.nack(job.id, "still down", &retry()).unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);

        let dead = queue.dead_lettered().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "doc-1");
        queue.resolve_dead_letter(dead[0].0).unwrap();
        assert!(queue.dead_lettered().unwrap().is_empty());
    }

    #[test]
    fn test_expired_claim_is_redelivered() {
        let (queue, _dir) = queue();
        queue.enqueue("doc-1").unwrap();

        let job = queue.claim(Duration::from_secs(0)).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(queue.recover_expired_claims().unwrap(), 1);

        let redelivered = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.attempt, 2);
    }

    #[test]
    fn test_backoff_is_exponential_capped_and_jittered() {
        let cfg = retry();
        for attempt in 1..=10 {
            let d = backoff_delay(attempt, &cfg).as_secs_f64();
            let ideal = (cfg.base_seconds * (1u64 << (attempt - 1).min(16)))
                .min(cfg.cap_seconds) as f64;
            assert!(d >= ideal * 0.8 - 1e-9, "attempt {attempt}: {d} < {ideal}*0.8");
            assert!(d <= ideal * 1.2 + 1e-9, "attempt {attempt}: {d} > {ideal}*1.2");
        }
    }

    #[test]
    fn test_progress_reporting() {
        let (queue, _dir) = queue();
        queue.enqueue("doc-1").unwrap();
        let job = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        queue.set_progress(job.id, "measure", 0.6).unwrap();

        let (stage, progress) = queue.latest_progress("doc-1").unwrap().unwrap();
        assert_eq!(stage.as_deref(), Some("measure"));
        assert!((progress - 0.6).abs() < 1e-9);
        assert!(queue.latest_progress("doc-404").unwrap().is_none());
    }
}
