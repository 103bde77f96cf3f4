//! Cross-process mutual exclusion for the import pipeline.
//!
//! Imports run for hours and the API layer may run as several replicas, so
//! the mutex lives in Postgres as a session-scoped advisory lock. The lock
//! is held on a dedicated pooled connection for the entire run: if the
//! owning process dies, the session closes and Postgres drops the lock,
//! which bounds how long a leak can last.

use crate::util::db::Db;
use anyhow::Result;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tracing::{debug, warn};

/// Advisory lock key for the import pipeline. Advisory locks share one
/// numeric namespace per database: this value must stay unique across every
/// subsystem that takes advisory locks on this datastore.
pub const IMPORT_LOCK_KEY: i64 = 7_435_121_904_001;

/// Holder of the pipeline advisory lock.
///
/// Not `Clone`: exactly one value owns the underlying session.
pub struct SyncLock {
    conn: Option<PoolConnection<Postgres>>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self { conn: None }
    }

    /// Non-blocking acquire. Returns whether *this* caller now holds the
    /// lock; `false` means another import is active and is not an error.
    pub async fn acquire(&mut self, db: &Db) -> Result<bool> {
        if self.conn.is_some() {
            return Ok(true);
        }
        let mut conn = db.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(IMPORT_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            debug!(key = IMPORT_LOCK_KEY, "advisory lock acquired");
            self.conn = Some(conn);
        }
        Ok(acquired)
    }

    pub fn is_held(&self) -> bool {
        self.conn.is_some()
    }

    /// Unconditionally release. Failure to release is logged but non-fatal:
    /// the session-scoped lock dies with the connection we are dropping.
    pub async fn release(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(IMPORT_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(true) => debug!(key = IMPORT_LOCK_KEY, "advisory lock released"),
            Ok(false) => warn!(key = IMPORT_LOCK_KEY, "advisory lock was not held at release"),
            Err(e) => warn!(
                key = IMPORT_LOCK_KEY,
                error = %e,
                "failed to release advisory lock; session close will drop it"
            ),
        }
    }

    /// Acquire, run `op`, release on every path. `Ok(None)` means the lock
    /// was busy and `op` never ran.
    pub async fn with_lock<T, F, Fut>(db: &Db, op: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut lock = SyncLock::new();
        if !lock.acquire(db).await? {
            return Ok(None);
        }
        let result = op().await;
        lock.release().await;
        result.map(Some)
    }
}

impl Default for SyncLock {
    fn default() -> Self {
        Self::new()
    }
}
