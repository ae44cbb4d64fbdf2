use chrono::{DateTime, Utc};
use std::fmt;

pub mod db;
pub mod error;
pub mod queue;
pub mod runner;
pub mod schema;
pub mod telemetry;
pub mod worker;

pub use db::{DbHandle, DbParams, ResultSet, SqlValue};
pub use error::QueueError;
pub use queue::UploadQueue;

/// Immutable fields supplied by the caller at enqueue time. Everything
/// else on the row (`id`, `status`, timestamps) is owned by the queue.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source_uri: String,
    pub file_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    /// Serialized structured payload, stored verbatim and passed through
    /// unchanged. The queue never inspects it.
    pub metadata: String,
}

/// One persisted row of the `uploads` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UploadRecord {
    pub id: i64,
    pub source_uri: String,
    pub file_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub metadata: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upload lifecycle status. The four uppercase strings are part of the
/// on-disk contract; any other persisted value is treated as corrupt and
/// excluded from status-filtered queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Status {
    Queued,
    Uploading,
    Done,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Uploading => "UPLOADING",
            Status::Done => "DONE",
            Status::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
