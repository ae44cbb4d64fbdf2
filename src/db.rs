use crate::error::Result;
use futures::TryStreamExt;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Either;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// SQLite page size used to translate the byte quota into a page count.
const PAGE_SIZE: u64 = 4096;

/// Identity of the backing store. These four values are the sole contract
/// needed to open the same physical database across process restarts; they
/// must stay stable unless a deliberate migration is performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbParams {
    pub short_name: &'static str,
    pub version: &'static str,
    pub display_name: &'static str,
    /// Maximum storage quota in bytes, enforced via `max_page_count`.
    pub max_size: u64,
}

impl Default for DbParams {
    fn default() -> Self {
        DbParams {
            short_name: "uploadq",
            version: "1.0",
            display_name: "Upload Queue",
            max_size: 5 * 1024 * 1024,
        }
    }
}

/// Result of one raw statement: the rows it produced (empty for DML/DDL)
/// and the number of rows it changed.
#[derive(Default)]
pub struct ResultSet {
    pub rows: Vec<SqliteRow>,
    pub rows_affected: u64,
}

// SqliteRow has no Debug impl, so report the shape of the result rather
// than its contents.
impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("rows", &self.rows.len())
            .field("rows_affected", &self.rows_affected)
            .finish()
    }
}

/// A bound statement parameter for the raw passthrough.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// Process-shared handle to the single logical database connection. Cheap
/// to clone; any number of queue instances may share one handle without
/// reopening the file.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<SqlitePool>,
    params: DbParams,
}

impl DbHandle {
    /// Prepares a handle on `<dir>/<short_name>.db`. The connection is
    /// lazy: the file is opened (and created if missing) by the first
    /// statement executed through the pool, not here.
    pub fn open(dir: impl AsRef<Path>, params: DbParams) -> Result<Self> {
        let path = dir.as_ref().join(format!("{}.db", params.short_name));
        debug!(path = %path.display(), "opening upload store");

        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Transient writers back off instead of failing with SQLITE_BUSY.
            .busy_timeout(Duration::from_secs(5))
            .pragma("page_size", PAGE_SIZE.to_string())
            .pragma("max_page_count", (params.max_size / PAGE_SIZE).to_string());

        // One connection: statements execute in submission order and each
        // statement commits atomically on its own. There is deliberately no
        // cross-statement transaction surface.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(opts);

        Ok(DbHandle {
            pool: Arc::new(pool),
            params,
        })
    }

    pub fn params(&self) -> &DbParams {
        &self.params
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Executes one statement with bound parameters, collecting any rows it
    /// yields and the affected-row count. This is the gateway's single
    /// primitive; a malformed statement resolves as a storage error, never
    /// a panic.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Integer(v) => query.bind(*v),
                SqlValue::Real(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
            };
        }

        let mut result = ResultSet::default();
        // fetch_many is the only sqlx 0.7 surface that yields both the row
        // stream and the affected-row count from one statement submission.
        #[allow(deprecated)]
        let mut stream = query.fetch_many(&*self.pool);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => result.rows_affected += done.rows_affected(),
                Either::Right(row) => result.rows.push(row),
            }
        }

        Ok(result)
    }
}
