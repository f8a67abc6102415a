//! Document store: rows, status transitions, leases, and results.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use tracing::warn;

use super::{parse_datetime, parse_datetime_opt, to_option, Result};
use crate::error::PipelineError;
use crate::models::{Document, DocumentKind, Estimate, ProcessingStatus};

/// Outcome of a Phase A acquire attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The claim succeeded; process the document.
    Acquired(Document),
    /// Another worker holds a live lease; acknowledge without running.
    HeldElsewhere,
    /// The document is not claimable (terminal, cancelled, or missing).
    NotClaimable(ProcessingStatus),
}

/// Outcome of a Phase C commit attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Status or lease changed underneath us; results were discarded.
    Overtaken,
}

/// SQLite-backed repository for document rows and processing results.
pub struct DocumentRepository {
    db_path: PathBuf,
}

impl DocumentRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                blob_ref TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                kind_hint TEXT,
                project_key TEXT,
                request_token TEXT NOT NULL UNIQUE,
                lease_id TEXT,
                lease_expiry TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Present iff the document reached COMPLETED.
            CREATE TABLE IF NOT EXISTS processing_results (
                document_id TEXT PRIMARY KEY REFERENCES documents(id),
                estimate_json TEXT NOT NULL,
                completed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_status
                ON documents(status);
            CREATE INDEX IF NOT EXISTS idx_documents_status_lease
                ON documents(status, lease_expiry);
            CREATE INDEX IF NOT EXISTS idx_documents_created
                ON documents(created_at);
        "#,
        )?;
        Ok(())
    }

    /// Insert a new document, or return the existing row when the
    /// request token has been seen before (idempotent start_processing).
    ///
    /// Returns `(document, created)`.
    pub fn create_or_get(&self, doc: &Document) -> Result<(Document, bool)> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<(Document, bool)> = (|| {
            if let Some(existing) = to_option(conn.query_row(
                "SELECT * FROM documents WHERE request_token = ?",
                params![doc.request_token],
                row_to_document,
            ))? {
                return Ok((existing, false));
            }

            conn.execute(
                r#"
                INSERT INTO documents (
                    id, filename, blob_ref, size_bytes, status, kind_hint,
                    project_key, request_token, attempt_count,
                    cancel_requested, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
                "#,
                params![
                    doc.id,
                    doc.filename,
                    doc.blob_ref,
                    doc.size_bytes as i64,
                    doc.status.as_str(),
                    doc.kind_hint.map(|k| k.as_str()),
                    doc.project_key,
                    doc.request_token,
                    doc.created_at.to_rfc3339(),
                    doc.updated_at.to_rfc3339(),
                ],
            )?;
            Ok((doc.clone(), true))
        })();

        finish_tx(&conn, &result);
        result
    }

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM documents WHERE id = ?",
            params![id],
            row_to_document,
        ))
    }

    /// Like `get`, but a missing id is an error.
    pub fn get_required(&self, id: &str) -> Result<Document> {
        self.get(id)?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    pub fn list(&self, status: Option<ProcessingStatus>, limit: u32) -> Result<Vec<Document>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM documents
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )?;
        let docs = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], row_to_document)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    /// Phase A: atomically claim a PENDING document for processing.
    ///
    /// A PROCESSING row with an expired lease may be re-acquired; a live
    /// lease means another worker owns the document.
    pub fn acquire(&self, id: &str, lease_id: &str, lease_seconds: u64) -> Result<AcquireOutcome> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<AcquireOutcome> = (|| {
            let doc = match to_option(conn.query_row(
                "SELECT * FROM documents WHERE id = ?",
                params![id],
                row_to_document,
            ))? {
                Some(d) => d,
                None => return Err(PipelineError::NotFound(id.to_string())),
            };

            let now = Utc::now();
            let claimable = match doc.status {
                ProcessingStatus::Pending => true,
                ProcessingStatus::Processing => doc.lease_is_stale(now),
                _ => false,
            };
            if !claimable {
                return Ok(match doc.status {
                    ProcessingStatus::Processing => AcquireOutcome::HeldElsewhere,
                    other => AcquireOutcome::NotClaimable(other),
                });
            }

            let expiry = now + Duration::seconds(lease_seconds as i64);
            let updated = monotonic_now(&doc.updated_at, now);
            conn.execute(
                r#"
                UPDATE documents
                SET status = 'processing', lease_id = ?, lease_expiry = ?,
                    attempt_count = attempt_count + 1, updated_at = ?
                WHERE id = ?
                "#,
                params![lease_id, expiry.to_rfc3339(), updated.to_rfc3339(), id],
            )?;

            let mut claimed = doc;
            claimed.status = ProcessingStatus::Processing;
            claimed.lease_id = Some(lease_id.to_string());
            claimed.lease_expiry = Some(expiry);
            claimed.attempt_count += 1;
            claimed.updated_at = updated;
            Ok(AcquireOutcome::Acquired(claimed))
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Extend a held lease. Touches only `lease_expiry` and `updated_at`.
    /// Returns false if the lease is no longer ours.
    pub fn refresh_lease(&self, id: &str, lease_id: &str, lease_seconds: u64) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now();
        let expiry = now + Duration::seconds(lease_seconds as i64);
        let updated = conn.execute(
            r#"
            UPDATE documents
            SET lease_expiry = ?, updated_at = ?
            WHERE id = ? AND lease_id = ? AND status = 'processing'
            "#,
            params![expiry.to_rfc3339(), now.to_rfc3339(), id, lease_id],
        )?;
        Ok(updated == 1)
    }

    /// Stale-tolerant read of the cancellation flag.
    pub fn is_cancel_requested(&self, id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let flag: Option<i64> = to_option(conn.query_row(
            "SELECT cancel_requested FROM documents WHERE id = ?",
            params![id],
            |row| row.get(0),
        ))?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Client cancel request. PENDING cancels immediately; PROCESSING
    /// sets the flag for the worker to observe at the next stage
    /// boundary. Terminal states are a conflict.
    pub fn request_cancel(&self, id: &str) -> Result<ProcessingStatus> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<ProcessingStatus> = (|| {
            let doc = match to_option(conn.query_row(
                "SELECT * FROM documents WHERE id = ?",
                params![id],
                row_to_document,
            ))? {
                Some(d) => d,
                None => return Err(PipelineError::NotFound(id.to_string())),
            };

            let now = Utc::now();
            let updated = monotonic_now(&doc.updated_at, now);
            match doc.status {
                ProcessingStatus::Pending => {
                    conn.execute(
                        "UPDATE documents SET status = 'cancelled', cancel_requested = 1, updated_at = ? WHERE id = ?",
                        params![updated.to_rfc3339(), id],
                    )?;
                    Ok(ProcessingStatus::Cancelled)
                }
                ProcessingStatus::Processing => {
                    conn.execute(
                        "UPDATE documents SET cancel_requested = 1, updated_at = ? WHERE id = ?",
                        params![updated.to_rfc3339(), id],
                    )?;
                    Ok(ProcessingStatus::Processing)
                }
                other => Err(PipelineError::Conflict(format!(
                    "cannot cancel a {} document",
                    other.as_str()
                ))),
            }
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Phase C: persist the estimate and complete the document, guarded
    /// by status and lease identity.
    pub fn commit_estimate(
        &self,
        id: &str,
        lease_id: &str,
        estimate: &Estimate,
    ) -> Result<CommitOutcome> {
        let json = serde_json::to_string(estimate)?;
        self.guarded_commit(id, lease_id, |conn, now| {
            conn.execute(
                "INSERT OR REPLACE INTO processing_results (document_id, estimate_json, completed_at) VALUES (?, ?, ?)",
                params![id, json, now.to_rfc3339()],
            )?;
            conn.execute(
                r#"
                UPDATE documents
                SET status = 'completed', lease_id = NULL, lease_expiry = NULL,
                    error_kind = NULL, error_message = NULL, updated_at = ?
                WHERE id = ?
                "#,
                params![now.to_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    /// Phase C': record a terminal failure under the same locking rules.
    pub fn commit_failure(
        &self,
        id: &str,
        lease_id: &str,
        error_kind: &str,
        message: &str,
    ) -> Result<CommitOutcome> {
        self.guarded_commit(id, lease_id, |conn, now| {
            conn.execute(
                r#"
                UPDATE documents
                SET status = 'failed', lease_id = NULL, lease_expiry = NULL,
                    error_kind = ?, error_message = ?, updated_at = ?
                WHERE id = ?
                "#,
                params![error_kind, message, now.to_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    /// Terminal CANCELLED commit after the worker observed the flag.
    pub fn commit_cancelled(&self, id: &str, lease_id: &str) -> Result<CommitOutcome> {
        self.guarded_commit(id, lease_id, |conn, now| {
            conn.execute(
                r#"
                UPDATE documents
                SET status = 'cancelled', lease_id = NULL, lease_expiry = NULL,
                    updated_at = ?
                WHERE id = ?
                "#,
                params![now.to_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    fn guarded_commit<F>(&self, id: &str, lease_id: &str, apply: F) -> Result<CommitOutcome>
    where
        F: FnOnce(&Connection, DateTime<Utc>) -> Result<()>,
    {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<CommitOutcome> = (|| {
            let doc = match to_option(conn.query_row(
                "SELECT * FROM documents WHERE id = ?",
                params![id],
                row_to_document,
            ))? {
                Some(d) => d,
                None => return Err(PipelineError::NotFound(id.to_string())),
            };

            if doc.status != ProcessingStatus::Processing
                || doc.lease_id.as_deref() != Some(lease_id)
            {
                warn!(document_id = %id, status = doc.status.as_str(), "commit overtaken");
                return Ok(CommitOutcome::Overtaken);
            }

            let now = monotonic_now(&doc.updated_at, Utc::now());
            apply(&conn, now)?;
            Ok(CommitOutcome::Committed)
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Load the persisted estimate for a COMPLETED document.
    pub fn get_estimate(&self, id: &str) -> Result<Option<Estimate>> {
        let conn = self.connect()?;
        let json: Option<String> = to_option(conn.query_row(
            "SELECT estimate_json FROM processing_results WHERE document_id = ?",
            params![id],
            |row| row.get(0),
        ))?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    /// Return a claimed document to PENDING ahead of a broker retry, so
    /// redelivery is not blocked waiting for the lease to expire.
    pub fn release_for_retry(&self, id: &str, lease_id: &str) -> Result<CommitOutcome> {
        self.guarded_commit(id, lease_id, |conn, now| {
            conn.execute(
                r#"
                UPDATE documents
                SET status = 'pending', lease_id = NULL, lease_expiry = NULL,
                    updated_at = ?
                WHERE id = ?
                "#,
                params![now.to_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    /// Janitor/dead-letter path: fail a document that no worker holds.
    /// Only non-terminal rows are touched; a live lease is left alone.
    pub fn fail_document(&self, id: &str, error_kind: &str, message: &str) -> Result<bool> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<bool> = (|| {
            let doc = match to_option(conn.query_row(
                "SELECT * FROM documents WHERE id = ?",
                params![id],
                row_to_document,
            ))? {
                Some(d) => d,
                None => return Ok(false),
            };

            let now = Utc::now();
            let failable = match doc.status {
                ProcessingStatus::Pending => true,
                ProcessingStatus::Processing => doc.lease_is_stale(now),
                _ => false,
            };
            if !failable {
                return Ok(false);
            }

            let updated = monotonic_now(&doc.updated_at, now);
            conn.execute(
                r#"
                UPDATE documents
                SET status = 'failed', lease_id = NULL, lease_expiry = NULL,
                    error_kind = ?, error_message = ?, updated_at = ?
                WHERE id = ?
                "#,
                params![error_kind, message, updated.to_rfc3339(), id],
            )?;
            Ok(true)
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Janitor sweep: return expired-lease PROCESSING documents to
    /// PENDING, or fail them when the attempt counter is at the cap.
    ///
    /// Returns `(document_id, new_status)` per recovered row.
    pub fn recover_expired_leases(
        &self,
        max_attempts: u32,
    ) -> Result<Vec<(String, ProcessingStatus)>> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Vec<(String, ProcessingStatus)>> = (|| {
            let now = Utc::now();
            let mut stmt = conn.prepare(
                r#"
                SELECT * FROM documents
                WHERE status = 'processing' AND lease_expiry IS NOT NULL
                  AND lease_expiry < ?
                "#,
            )?;
            let stale: Vec<Document> = stmt
                .query_map(params![now.to_rfc3339()], row_to_document)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut recovered = Vec::with_capacity(stale.len());
            for doc in stale {
                let updated = monotonic_now(&doc.updated_at, now);
                let new_status = if doc.attempt_count >= max_attempts {
                    conn.execute(
                        r#"
                        UPDATE documents
                        SET status = 'failed', lease_id = NULL, lease_expiry = NULL,
                            error_kind = 'stage_timeout_error',
                            error_message = 'worker lease expired with attempts exhausted',
                            updated_at = ?
                        WHERE id = ?
                        "#,
                        params![updated.to_rfc3339(), doc.id],
                    )?;
                    ProcessingStatus::Failed
                } else {
                    conn.execute(
                        r#"
                        UPDATE documents
                        SET status = 'pending', lease_id = NULL, lease_expiry = NULL,
                            updated_at = ?
                        WHERE id = ?
                        "#,
                        params![updated.to_rfc3339(), doc.id],
                    )?;
                    ProcessingStatus::Pending
                };
                recovered.push((doc.id, new_status));
            }
            Ok(recovered)
        })();

        finish_tx(&conn, &result);
        result
    }

    /// Count documents per status, for the health endpoint.
    pub fn status_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM documents GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

/// updated_at is monotonic non-decreasing per document even under clock
/// slew.
fn monotonic_now(previous: &DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(*previous)
}

fn finish_tx<T>(conn: &Connection, result: &Result<T>) {
    if result.is_ok() {
        let _ = conn.execute("COMMIT", []);
    } else {
        let _ = conn.execute("ROLLBACK", []);
    }
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let status_raw: String = row.get("status")?;
    let kind_raw: Option<String> = row.get("kind_hint")?;
    Ok(Document {
        id: row.get("id")?,
        filename: row.get("filename")?,
        blob_ref: row.get("blob_ref")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        status: ProcessingStatus::parse(&status_raw).unwrap_or(ProcessingStatus::Failed),
        kind_hint: kind_raw.map(|k| DocumentKind::parse(&k)),
        project_key: row.get("project_key")?,
        request_token: row.get("request_token")?,
        lease_id: row.get("lease_id")?,
        lease_expiry: parse_datetime_opt(row.get("lease_expiry")?),
        attempt_count: row.get::<_, i64>("attempt_count")? as u32,
        cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
        error_kind: row.get("error_kind")?,
        error_message: row.get("error_message")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Estimate, LaborEstimate};
    use tempfile::tempdir;

    fn repo() -> (DocumentRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = DocumentRepository::new(&dir.path().join("test.db")).unwrap();
        (repo, dir)
    }

    fn new_doc(token: &str) -> Document {
        Document::new(
            "roof.pdf".into(),
            format!("uploads/{token}/roof.pdf"),
            2048,
            token.into(),
        )
    }

    fn sample_estimate(document_id: &str) -> Estimate {
        Estimate {
            document_id: document_id.into(),
            roof_area_sqft: 2500.0,
            estimated_cost: 30000.0,
            materials: Vec::new(),
            labor: LaborEstimate {
                hours: 50.0,
                rate: 75.0,
                subtotal: 3750.0,
            },
            timeline: "4-6 days".into(),
            confidence: 0.9,
            warnings: Vec::new(),
            stages_completed: Vec::new(),
            elapsed_seconds: 10.0,
        }
    }

    #[test]
    fn test_create_is_idempotent_on_token() {
        let (repo, _dir) = repo();
        let doc = new_doc("tok-1");
        let (first, created) = repo.create_or_get(&doc).unwrap();
        assert!(created);

        let dup = new_doc("tok-1");
        let (second, created) = repo.create_or_get(&dup).unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
    }

    #[test]
    fn test_acquire_then_commit() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-2")).unwrap();

        let outcome = repo.acquire(&doc.id, "lease-a", 600).unwrap();
        let claimed = match outcome {
            AcquireOutcome::Acquired(d) => d,
            other => panic!("expected acquire, got {other:?}"),
        };
        assert_eq!(claimed.status, ProcessingStatus::Processing);
        assert_eq!(claimed.attempt_count, 1);

        let estimate = sample_estimate(&doc.id);
        let commit = repo.commit_estimate(&doc.id, "lease-a", &estimate).unwrap();
        assert_eq!(commit, CommitOutcome::Committed);

        let reloaded = repo.get_required(&doc.id).unwrap();
        assert_eq!(reloaded.status, ProcessingStatus::Completed);
        assert!(reloaded.lease_id.is_none());
        assert_eq!(repo.get_estimate(&doc.id).unwrap().unwrap(), estimate);
    }

    #[test]
    fn test_duplicate_delivery_sees_live_lease() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-3")).unwrap();

        assert!(matches!(
            repo.acquire(&doc.id, "lease-a", 600).unwrap(),
            AcquireOutcome::Acquired(_)
        ));
        assert!(matches!(
            repo.acquire(&doc.id, "lease-b", 600).unwrap(),
            AcquireOutcome::HeldElsewhere
        ));
    }

    #[test]
    fn test_stale_lease_can_be_reacquired() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-4")).unwrap();

        // Zero-length lease expires immediately.
        assert!(matches!(
            repo.acquire(&doc.id, "lease-a", 0).unwrap(),
            AcquireOutcome::Acquired(_)
        ));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = repo.acquire(&doc.id, "lease-b", 600).unwrap();
        match second {
            AcquireOutcome::Acquired(d) => assert_eq!(d.attempt_count, 2),
            other => panic!("expected re-acquire, got {other:?}"),
        }
    }

    #[test]
    fn test_commit_with_wrong_lease_is_overtaken() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-5")).unwrap();
        repo.acquire(&doc.id, "lease-a", 600).unwrap();

        let estimate = sample_estimate(&doc.id);
        let commit = repo.commit_estimate(&doc.id, "lease-b", &estimate).unwrap();
        assert_eq!(commit, CommitOutcome::Overtaken);

        // No results row was written.
        assert!(repo.get_estimate(&doc.id).unwrap().is_none());
        assert_eq!(
            repo.get_required(&doc.id).unwrap().status,
            ProcessingStatus::Processing
        );
    }

    #[test]
    fn test_completed_is_never_reacquired() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-6")).unwrap();
        repo.acquire(&doc.id, "lease-a", 600).unwrap();
        repo.commit_estimate(&doc.id, "lease-a", &sample_estimate(&doc.id))
            .unwrap();

        assert!(matches!(
            repo.acquire(&doc.id, "lease-b", 600).unwrap(),
            AcquireOutcome::NotClaimable(ProcessingStatus::Completed)
        ));
    }

    #[test]
    fn test_cancel_pending_is_immediate() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-7")).unwrap();
        assert_eq!(
            repo.request_cancel(&doc.id).unwrap(),
            ProcessingStatus::Cancelled
        );
        assert!(matches!(
            repo.acquire(&doc.id, "lease-a", 600).unwrap(),
            AcquireOutcome::NotClaimable(ProcessingStatus::Cancelled)
        ));
    }

    #[test]
    fn test_cancel_processing_sets_flag() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-8")).unwrap();
        repo.acquire(&doc.id, "lease-a", 600).unwrap();

        assert_eq!(
            repo.request_cancel(&doc.id).unwrap(),
            ProcessingStatus::Processing
        );
        assert!(repo.is_cancel_requested(&doc.id).unwrap());

        let commit = repo.commit_cancelled(&doc.id, "lease-a").unwrap();
        assert_eq!(commit, CommitOutcome::Committed);
        assert_eq!(
            repo.get_required(&doc.id).unwrap().status,
            ProcessingStatus::Cancelled
        );
    }

    #[test]
    fn test_cancel_terminal_conflicts() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-9")).unwrap();
        repo.acquire(&doc.id, "lease-a", 600).unwrap();
        repo.commit_estimate(&doc.id, "lease-a", &sample_estimate(&doc.id))
            .unwrap();

        assert!(matches!(
            repo.request_cancel(&doc.id).unwrap_err(),
            PipelineError::Conflict(_)
        ));
    }

    #[test]
    fn test_janitor_returns_stale_to_pending() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-10")).unwrap();
        repo.acquire(&doc.id, "lease-a", 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let recovered = repo.recover_expired_leases(3).unwrap();
        assert_eq!(recovered, vec![(doc.id.clone(), ProcessingStatus::Pending)]);
        let reloaded = repo.get_required(&doc.id).unwrap();
        assert_eq!(reloaded.status, ProcessingStatus::Pending);
        assert_eq!(reloaded.attempt_count, 1);
    }

    #[test]
    fn test_janitor_fails_at_attempt_cap() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-11")).unwrap();
        for _ in 0..3 {
            repo.acquire(&doc.id, "lease", 0).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
            repo.recover_expired_leases(3).unwrap();
        }

        let reloaded = repo.get_required(&doc.id).unwrap();
        assert_eq!(reloaded.status, ProcessingStatus::Failed);
        assert_eq!(reloaded.error_kind.as_deref(), Some("stage_timeout_error"));
    }

    #[test]
    fn test_refresh_lease_requires_ownership() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-12")).unwrap();
        repo.acquire(&doc.id, "lease-a", 600).unwrap();

        assert!(repo.refresh_lease(&doc.id, "lease-a", 600).unwrap());
        assert!(!repo.refresh_lease(&doc.id, "lease-b", 600).unwrap());
    }

    #[test]
    fn test_updated_at_monotonic() {
        let (repo, _dir) = repo();
        let (doc, _) = repo.create_or_get(&new_doc("tok-13")).unwrap();
        let created = repo.get_required(&doc.id).unwrap();
        repo.acquire(&doc.id, "lease-a", 600).unwrap();
        let after = repo.get_required(&doc.id).unwrap();
        assert!(after.updated_at >= created.updated_at);
        assert!(after.updated_at >= after.created_at);
    }
}
