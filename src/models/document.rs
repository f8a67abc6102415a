//! Document records and the processing status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a document. Transitions are enforced by
/// [`ProcessingStatus::can_transition`]; the repository refuses anything
/// the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// The pure transition predicate. Exhaustive on both ends so a new
    /// status variant cannot be added without deciding its edges.
    pub fn can_transition(from: Self, to: Self) -> bool {
        use ProcessingStatus::*;
        match (from, to) {
            (Pending, Processing) => true,
            (Processing, Completed) => true,
            (Processing, Failed) => true,
            (Pending, Cancelled) | (Processing, Cancelled) => true,
            // Lease recovery returns an abandoned claim to the queue.
            (Processing, Pending) => true,
            // Attempt cap exhaustion on a stale PENDING row.
            (Pending, Failed) => true,
            (Pending, Pending)
            | (Pending, Completed)
            | (Processing, Processing)
            | (Completed, _)
            | (Failed, _)
            | (Cancelled, _) => false,
        }
    }

    /// Terminal states never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Document kind decided by the analyzer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Blueprint,
    InspectionReport,
    ExistingEstimate,
    Photo,
    Unknown,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blueprint => "blueprint",
            Self::InspectionReport => "inspection_report",
            Self::ExistingEstimate => "existing_estimate",
            Self::Photo => "photo",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "blueprint" => Self::Blueprint,
            "inspection_report" => Self::InspectionReport,
            "existing_estimate" => Self::ExistingEstimate,
            "photo" => Self::Photo,
            _ => Self::Unknown,
        }
    }
}

/// The authoritative processing unit. Created by the ingest API, mutated
/// only through the repository's transactional operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Opaque unique identifier (UUID v4).
    pub id: String,
    /// Sanitized original filename.
    pub filename: String,
    /// Blob reference: object name in the blob store.
    pub blob_ref: String,
    /// Content length in bytes.
    pub size_bytes: u64,
    pub status: ProcessingStatus,
    /// Client-supplied kind hint, if any.
    pub kind_hint: Option<DocumentKind>,
    /// Optional project grouping key.
    pub project_key: Option<String>,
    /// Idempotency key for start_processing dedupe.
    pub request_token: String,
    /// Worker claim identity, set while PROCESSING.
    pub lease_id: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    /// Set by a client cancel request; observed at stage boundaries.
    pub cancel_requested: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a new pending document record.
    pub fn new(filename: String, blob_ref: String, size_bytes: u64, request_token: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename,
            blob_ref,
            size_bytes,
            status: ProcessingStatus::Pending,
            kind_hint: None,
            project_key: None,
            request_token,
            lease_id: None,
            lease_expiry: None,
            attempt_count: 0,
            cancel_requested: false,
            error_kind: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the current lease (if any) has expired.
    pub fn lease_is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expiry {
            Some(expiry) => expiry < now,
            None => true,
        }
    }
}
