use crate::db::{DbHandle, DbParams, ResultSet, SqlValue};
use crate::error::{QueueError, Result};
use crate::{schema, Status, UploadRecord, UploadRequest};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::debug;

const COLUMNS: &str = "id, source_uri, file_name, latitude, longitude, accuracy, \
     metadata, status, created_at, updated_at";

/// The public face of the queue: composes single guarded statements against
/// the storage gateway. Holds no state beyond the shared handle, so any
/// number of instances may coexist in one process.
#[derive(Clone)]
pub struct UploadQueue {
    db: DbHandle,
}

impl UploadQueue {
    /// Opens (or creates) the default store under `dir` and ensures the
    /// schema exists.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(dir, DbParams::default()).await
    }

    pub async fn open_with(dir: impl AsRef<Path>, params: DbParams) -> Result<Self> {
        let db = DbHandle::open(dir, params)?;
        Self::with_handle(db).await
    }

    /// Builds a queue over an already-open handle, sharing its connection.
    /// Schema bootstrap runs here, before the first queue operation, and is
    /// idempotent.
    pub async fn with_handle(db: DbHandle) -> Result<Self> {
        schema::ensure_schema(&db).await?;
        Ok(UploadQueue { db })
    }

    /// The stable open/attach identity of the backing store.
    pub fn db_params(&self) -> &DbParams {
        self.db.params()
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    /// Raw statement passthrough (schema bootstrap, tests, out-of-band
    /// repair). Bypasses the state machine; the caller owns the invariants.
    pub async fn execute_sql(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        self.db.execute(sql, params).await
    }

    /// Inserts a new `QUEUED` record and resolves with its assigned id.
    /// Repeated enqueues of the same `source_uri` are independent records;
    /// the same file may legitimately be re-captured or re-selected.
    pub async fn enqueue(&self, req: UploadRequest) -> Result<i64> {
        if req.source_uri.is_empty() {
            return Err(QueueError::InvalidRequest("source_uri must be non-empty"));
        }
        if req.file_name.is_empty() {
            return Err(QueueError::InvalidRequest("file_name must be non-empty"));
        }

        debug!(source_uri = %req.source_uri, file_name = %req.file_name, "enqueueing upload");
        let now = Utc::now();
        let id = sqlx::query_scalar(
            "INSERT INTO uploads \
                (source_uri, file_name, latitude, longitude, accuracy, metadata, \
                 status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
             RETURNING id",
        )
        .bind(&req.source_uri)
        .bind(&req.file_name)
        .bind(req.latitude)
        .bind(req.longitude)
        .bind(req.accuracy)
        .bind(&req.metadata)
        .bind(Status::Queued)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        Ok(id)
    }

    /// Counts all records, or only those matching `filter` exactly. The
    /// exact match means rows carrying a corrupt status string are never
    /// counted by a filtered call; they still show up unfiltered.
    pub async fn length(&self, filter: Option<Status>) -> Result<i64> {
        let count = match filter {
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM uploads")
                    .fetch_one(self.db.pool())
                    .await?
            }
            Some(status) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM uploads WHERE status = ?1")
                    .bind(status)
                    .fetch_one(self.db.pool())
                    .await?
            }
        };

        Ok(count)
    }

    /// Records with the given status in insertion order, oldest first
    /// (ties broken by id).
    pub async fn find_all_by_status(&self, status: Status) -> Result<Vec<UploadRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM uploads WHERE status = ?1 \
             ORDER BY created_at ASC, id ASC"
        );

        Ok(sqlx::query_as(&sql)
            .bind(status)
            .fetch_all(self.db.pool())
            .await?)
    }

    /// Claims the oldest `QUEUED` record, transitioning it to `UPLOADING`,
    /// or resolves to `None` when nothing is queued. The claim is one
    /// guarded update, so two concurrent claimants can never both win the
    /// same record.
    pub async fn dequeue_next(&self) -> Result<Option<UploadRecord>> {
        let sql = format!(
            "UPDATE uploads SET status = ?1, updated_at = ?2 \
             WHERE status = ?3 AND id = \
                (SELECT id FROM uploads WHERE status = ?3 \
                 ORDER BY created_at ASC, id ASC LIMIT 1) \
             RETURNING {COLUMNS}"
        );

        let claimed: Option<UploadRecord> = sqlx::query_as(&sql)
            .bind(Status::Uploading)
            .bind(Utc::now())
            .bind(Status::Queued)
            .fetch_optional(self.db.pool())
            .await?;

        if let Some(record) = &claimed {
            debug!(id = record.id, file_name = %record.file_name, "claimed upload");
        }

        Ok(claimed)
    }

    /// `UPLOADING -> DONE`. The record stays on disk until an explicit
    /// purge; completion alone never deletes it.
    pub async fn mark_done(&self, id: i64) -> Result<()> {
        self.transition(id, Status::Uploading, Status::Done).await
    }

    /// `UPLOADING -> FAILED`. Re-entry into the queue is caller-driven via
    /// [`requeue`](Self::requeue); whether repeated failures should stop
    /// being requeued is a policy decision above this layer.
    pub async fn mark_failed(&self, id: i64) -> Result<()> {
        self.transition(id, Status::Uploading, Status::Failed).await
    }

    /// `FAILED -> QUEUED` retry re-entry.
    pub async fn requeue(&self, id: i64) -> Result<()> {
        self.transition(id, Status::Failed, Status::Queued).await
    }

    /// Deletes a record that is still `QUEUED`, bypassing `DONE`. Records
    /// in any other state are left untouched.
    pub async fn remove(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM uploads WHERE id = ?1 AND status = ?2")
            .bind(id)
            .bind(Status::Queued)
            .execute(self.db.pool())
            .await?;

        if res.rows_affected() == 1 {
            return Ok(());
        }

        Err(self.transition_failure(id, "(removed)").await?)
    }

    /// Unconditionally deletes every record, resolving with the count
    /// removed. Test/reset use, not crash recovery.
    pub async fn empty(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM uploads")
            .execute(self.db.pool())
            .await?;

        debug!(removed = res.rows_affected(), "emptied upload queue");
        Ok(res.rows_affected())
    }

    /// Recovery primitive: flips `UPLOADING` records whose last transition
    /// is older than `older_than` back to `QUEUED`, returning how many were
    /// requeued. When to run this, and with what grace threshold, is the
    /// consumer's startup policy.
    pub async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE uploads SET status = ?1, updated_at = ?2 \
             WHERE status = ?3 AND updated_at < ?4",
        )
        .bind(Status::Queued)
        .bind(Utc::now())
        .bind(Status::Uploading)
        .bind(older_than)
        .execute(self.db.pool())
        .await?;

        if res.rows_affected() > 0 {
            debug!(requeued = res.rows_affected(), "requeued stale uploads");
        }

        Ok(res.rows_affected())
    }

    /// One guarded status update. Zero rows affected means the guard did
    /// not hold; the follow-up read is diagnostic only and distinguishes a
    /// missing row from a wrong (possibly corrupt) current status.
    async fn transition(&self, id: i64, from: Status, to: Status) -> Result<()> {
        let res = sqlx::query(
            "UPDATE uploads SET status = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(id)
        .bind(from)
        .execute(self.db.pool())
        .await?;

        if res.rows_affected() == 1 {
            return Ok(());
        }

        Err(self.transition_failure(id, to.as_str()).await?)
    }

    async fn transition_failure(&self, id: i64, to: &'static str) -> Result<QueueError> {
        let current: Option<String> = sqlx::query_scalar("SELECT status FROM uploads WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(match current {
            None => QueueError::NotFound(id),
            Some(from) => QueueError::InvalidTransition { id, from, to },
        })
    }
}
