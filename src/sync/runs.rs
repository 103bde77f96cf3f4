//! Run records and the live status row.
//!
//! Every pipeline execution gets one append-only row in `sync_logs`,
//! finalized exactly once with a terminal status and a summary payload.
//! `sync_status` is a singleton row mirroring the run currently visible to
//! operators; the checkpoint store updates its progress fields as the run
//! advances.

use crate::sync::cancel::CancelReason;
use crate::sync::metrics::ValidationSnapshot;
use crate::util::db::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Cancelling => "CANCELLING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the status endpoint reports, straight from `sync_status`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LiveStatus {
    pub status: String,
    pub run_id: Option<Uuid>,
    pub progress: i16,
    pub current_operation: Option<String>,
    pub last_error: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub processed_records: i64,
    pub valid_records: i64,
    pub invalid_records: i64,
    pub estimated_duration_secs: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LiveStatus {
    pub fn is_running(&self) -> bool {
        matches!(self.status.as_str(), "RUNNING" | "CANCELLING")
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub summary: Option<serde_json::Value>,
}

/// How a run ended, for [`RunStore::finalize`].
pub enum RunOutcome {
    Completed,
    Cancelled(CancelReason),
    Failed { code: String, message: String },
}

impl RunOutcome {
    fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Cancelled(_) => RunStatus::Cancelled,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    fn error_parts(&self) -> (Option<&str>, Option<String>) {
        match self {
            RunOutcome::Completed => (None, None),
            RunOutcome::Cancelled(reason) => {
                (Some(reason.error_code()), Some(reason.message().to_string()))
            }
            RunOutcome::Failed { code, message } => (Some(code), Some(message.clone())),
        }
    }
}

#[derive(Clone)]
pub struct RunStore {
    db: Db,
}

impl RunStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Open a run record and point the status singleton at it.
    pub async fn create(&self, run_id: Uuid, estimated_duration_secs: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_logs (run_id, status, started_at)
             VALUES ($1, 'RUNNING', now())",
        )
        .persistent(false)
        .bind(run_id)
        .execute(&self.db.pool)
        .await
        .context("creating run record")?;

        sqlx::query(
            "INSERT INTO sync_status
                 (id, status, run_id, progress, current_operation,
                  estimated_duration_secs, started_at, updated_at)
             VALUES (1, 'RUNNING', $1, 0, 'Starting', $2, now(), now())
             ON CONFLICT (id) DO UPDATE SET
                 status = 'RUNNING',
                 run_id = EXCLUDED.run_id,
                 progress = 0,
                 current_operation = 'Starting',
                 last_error = NULL,
                 processed_records = 0,
                 valid_records = 0,
                 invalid_records = 0,
                 estimated_duration_secs = EXCLUDED.estimated_duration_secs,
                 started_at = now(),
                 updated_at = now()",
        )
        .persistent(false)
        .bind(run_id)
        .bind(estimated_duration_secs)
        .execute(&self.db.pool)
        .await
        .context("pointing sync_status at new run")?;
        Ok(())
    }

    /// Flip the visible status to CANCELLING while the pipeline drains to
    /// its next safe point. The run record itself stays RUNNING until
    /// [`RunStore::finalize`].
    pub async fn mark_cancelling(&self, run_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE sync_status SET status = 'CANCELLING', updated_at = now()
             WHERE id = 1 AND run_id = $1",
        )
        .persistent(false)
        .bind(run_id)
        .execute(&self.db.pool)
        .await
        .context("marking run cancelling")?;
        Ok(())
    }

    /// Close the run record with its terminal status and summary payload,
    /// and mirror the outcome into the status singleton.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        summary: serde_json::Value,
    ) -> Result<()> {
        let status = outcome.status();
        let (error_code, error_message) = outcome.error_parts();
        sqlx::query(
            "UPDATE sync_logs
             SET status = $2, finished_at = now(), error_code = $3,
                 error_message = $4, summary = $5
             WHERE run_id = $1",
        )
        .persistent(false)
        .bind(run_id)
        .bind(status.as_str())
        .bind(error_code)
        .bind(error_message.as_deref())
        .bind(&summary)
        .execute(&self.db.pool)
        .await
        .context("finalizing run record")?;

        let progress_sql = if matches!(outcome, RunOutcome::Completed) {
            "UPDATE sync_status
             SET status = $2, progress = 100, current_operation = 'Done',
                 last_error = NULL, last_sync_time = now(), updated_at = now()
             WHERE id = 1 AND run_id = $1"
        } else {
            "UPDATE sync_status
             SET status = $2, last_error = $3, updated_at = now()
             WHERE id = 1 AND run_id = $1"
        };
        let mut query = sqlx::query(progress_sql)
            .persistent(false)
            .bind(run_id)
            .bind(status.as_str());
        if !matches!(outcome, RunOutcome::Completed) {
            query = query.bind(error_message);
        }
        query
            .execute(&self.db.pool)
            .await
            .context("mirroring run outcome into sync_status")?;
        Ok(())
    }

    /// Write the run's final validation counters into the status row. The
    /// periodic checkpoint saves keep these live; this closes the gap
    /// between the last save and the end of the run.
    pub async fn record_validation(&self, run_id: Uuid, snap: &ValidationSnapshot) -> Result<()> {
        sqlx::query(
            "UPDATE sync_status
             SET processed_records = $2, valid_records = $3, invalid_records = $4,
                 updated_at = now()
             WHERE id = 1 AND run_id = $1",
        )
        .persistent(false)
        .bind(run_id)
        .bind(snap.total_records_processed as i64)
        .bind(snap.valid_records as i64)
        .bind(snap.invalid_records as i64)
        .execute(&self.db.pool)
        .await
        .context("recording final validation counters")?;
        Ok(())
    }

    pub async fn live_status(&self) -> Result<Option<LiveStatus>> {
        let row = sqlx::query_as::<_, LiveStatus>(
            "SELECT status, run_id, progress, current_operation,
                    last_error, last_sync_time,
                    processed_records, valid_records, invalid_records,
                    estimated_duration_secs, started_at, updated_at
             FROM sync_status WHERE id = 1",
        )
        .persistent(false)
        .fetch_optional(&self.db.pool)
        .await
        .context("reading live status")?;
        Ok(row)
    }

    /// The run currently open in `sync_logs`, if any.
    pub async fn active_run(&self) -> Result<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRecord>(
            "SELECT run_id, status, started_at, finished_at, error_code, error_message, summary
             FROM sync_logs WHERE status = 'RUNNING'
             ORDER BY started_at DESC LIMIT 1",
        )
        .persistent(false)
        .fetch_optional(&self.db.pool)
        .await
        .context("looking up active run")?;
        Ok(row)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRecord>(
            "SELECT run_id, status, started_at, finished_at, error_code, error_message, summary
             FROM sync_logs WHERE run_id = $1",
        )
        .persistent(false)
        .bind(run_id)
        .fetch_optional(&self.db.pool)
        .await
        .context("looking up run record")?;
        Ok(row)
    }

    /// Close RUNNING rows left behind by a process that died without
    /// finalizing. Safe only while holding the cross-process lock: a row
    /// that is RUNNING while we hold the lock cannot belong to a live run.
    pub async fn reconcile_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_logs
             SET status = 'FAILED', finished_at = now(),
                 error_code = 'EC-001',
                 error_message = 'run never finalized; importer process exited'
             WHERE status = 'RUNNING'",
        )
        .persistent(false)
        .execute(&self.db.pool)
        .await
        .context("reconciling stale run records")?;
        let stale = result.rows_affected();
        if stale > 0 {
            tracing::warn!(stale, "closed stale run records from a dead process");
        }
        Ok(stale)
    }

    /// Mean wall-clock seconds of recent completed runs; None until the
    /// first full run succeeds.
    pub async fn estimated_duration_secs(&self) -> Result<Option<i64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(EXTRACT(EPOCH FROM (finished_at - started_at)))::float8
             FROM (SELECT started_at, finished_at FROM sync_logs
                   WHERE status = 'COMPLETED' AND finished_at IS NOT NULL
                   ORDER BY finished_at DESC LIMIT 5) recent",
        )
        .persistent(false)
        .fetch_one(&self.db.pool)
        .await
        .context("estimating run duration")?;
        Ok(avg.map(|secs| secs.round() as i64))
    }

    /// Row counts per imported entity table, embedded into run summaries.
    pub async fn entity_counts(&self) -> Result<serde_json::Value> {
        let (clubs, players, club_members, year_stats, tournaments): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT (SELECT count(*) FROM clubs),
                        (SELECT count(*) FROM players),
                        (SELECT count(*) FROM club_members),
                        (SELECT count(*) FROM player_year_stats),
                        (SELECT count(*) FROM tournaments)",
            )
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        let (chief_judges, history, judges, games, statistics): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT (SELECT count(*) FROM tournament_chief_judges),
                        (SELECT count(*) FROM player_tournament_history),
                        (SELECT count(*) FROM judges),
                        (SELECT count(*) FROM games),
                        (SELECT count(*) FROM game_statistics)",
            )
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(serde_json::json!({
            "clubs": clubs,
            "players": players,
            "club_members": club_members,
            "player_year_stats": year_stats,
            "tournaments": tournaments,
            "tournament_chief_judges": chief_judges,
            "player_tournament_history": history,
            "judges": judges,
            "games": games,
            "game_statistics": statistics,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Cancelling.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn outcome_maps_to_status_and_error_parts() {
        assert_eq!(RunOutcome::Completed.status(), RunStatus::Completed);
        let (code, msg) = RunOutcome::Completed.error_parts();
        assert!(code.is_none() && msg.is_none());

        let cancelled = RunOutcome::Cancelled(CancelReason::Timeout);
        assert_eq!(cancelled.status(), RunStatus::Cancelled);
        assert_eq!(cancelled.error_parts().0, Some("EC-008"));

        let failed = RunOutcome::Failed {
            code: "EC-001".to_string(),
            message: "db down".to_string(),
        };
        assert_eq!(failed.status(), RunStatus::Failed);
        assert_eq!(failed.error_parts().0, Some("EC-001"));
    }
}
