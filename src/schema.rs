use crate::db::DbHandle;
use crate::error::Result;
use sqlx::Executor;

/// Ensures the `uploads` table and its status index exist. Safe to run on
/// every queue instantiation, including concurrent first-use from several
/// instances sharing the connection: rerunning `CREATE ... IF NOT EXISTS`
/// is a no-op.
pub async fn ensure_schema(db: &DbHandle) -> Result<()> {
    db.pool().execute(include_str!("schema.sql")).await?;
    Ok(())
}
