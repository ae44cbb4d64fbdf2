use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Failure taxonomy for queue operations. Every error carries enough
/// diagnostic detail for the caller to decide whether to retry, log, or
/// abandon; none of them are fatal to the process.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQL engine failure (I/O, quota exceeded, malformed
    /// statement). Carries the native diagnostic, never swallowed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Attempted state change outside the defined lifecycle edges. The
    /// record is left unchanged. `from` is the raw stored status string so
    /// corrupt values are visible to the caller.
    #[error("invalid transition for record {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: &'static str,
    },

    /// Operation referenced an id with no backing row.
    #[error("no upload record with id {0}")]
    NotFound(i64),

    /// Enqueue input violated a field constraint.
    #[error("invalid upload request: {0}")]
    InvalidRequest(&'static str),
}
