//! Durable, resumable pipeline position.
//!
//! The checkpoint is a singleton row: created on the first save of a run,
//! overwritten on every subsequent save, deleted only when the whole
//! pipeline completes. Saves happen at a bounded cadence (per batch, not per
//! record) so crash recovery loses at most one batch of work.

use crate::sync::metrics::ValidationMetrics;
use crate::sync::SyncPhase;
use crate::util::db::Db;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub current_phase: SyncPhase,
    /// Batch (page) offset within the current phase.
    pub current_batch: i32,
    /// Cursor of the last entity durably committed; resume scans after it.
    pub last_processed_id: Option<i64>,
    /// Ordered, duplicate-free ids committed in the current phase's batch
    /// window. Cross-checked on resume so an upsert whose checkpoint write
    /// raced a crash is not re-emitted.
    pub processed_ids: Vec<i64>,
    /// Mirror of `processed_ids` for constant-time membership checks; some
    /// phases walk hundreds of thousands of units.
    #[serde(skip)]
    processed_set: HashSet<i64>,
    /// 0-100, monotonically non-decreasing within a run.
    pub progress: i16,
}

impl Checkpoint {
    pub fn start_of(phase: SyncPhase) -> Self {
        Self {
            current_phase: phase,
            current_batch: 0,
            last_processed_id: None,
            processed_ids: Vec::new(),
            processed_set: HashSet::new(),
            progress: 0,
        }
    }

    /// Record a durably committed unit. Returns false (and changes nothing)
    /// if the id was already recorded.
    pub fn mark_processed(&mut self, id: i64) -> bool {
        if !self.processed_set.insert(id) {
            return false;
        }
        self.processed_ids.push(id);
        self.last_processed_id = Some(id);
        true
    }

    pub fn contains(&self, id: i64) -> bool {
        self.processed_set.contains(&id)
    }

    /// Enter the next phase: per-phase cursor state resets, progress stays.
    pub fn advance_phase(&mut self, next: SyncPhase) {
        self.current_phase = next;
        self.current_batch = 0;
        self.last_processed_id = None;
        self.processed_ids.clear();
        self.processed_set.clear();
    }

    /// Monotone within a run; regressions are clamped away.
    pub fn set_progress(&mut self, pct: i16) {
        self.progress = self.progress.max(pct.clamp(0, 100));
    }
}

pub struct CheckpointStore {
    db: Db,
    metrics: Option<Arc<ValidationMetrics>>,
}

impl CheckpointStore {
    pub fn new(db: Db) -> Self {
        Self { db, metrics: None }
    }

    /// Mirror live validation counters into `sync_status` on every save.
    pub fn with_metrics(mut self, metrics: Arc<ValidationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Upsert the singleton checkpoint and mirror progress into the live
    /// status row for the dashboard. Two writes, best-effort atomic: the
    /// checkpoint write is the one that matters for correctness.
    #[instrument(skip(self, cp), fields(phase = %cp.current_phase, batch = cp.current_batch))]
    pub async fn save(&self, cp: &Checkpoint, current_operation: &str) -> Result<()> {
        let ids = serde_json::to_value(&cp.processed_ids).context("serializing processed_ids")?;
        sqlx::query(
            "INSERT INTO sync_checkpoints
                 (id, current_phase, current_batch, last_processed_id, processed_ids, progress, updated_at)
             VALUES (1, $1, $2, $3, $4, $5, now())
             ON CONFLICT (id) DO UPDATE SET
                 current_phase = EXCLUDED.current_phase,
                 current_batch = EXCLUDED.current_batch,
                 last_processed_id = EXCLUDED.last_processed_id,
                 processed_ids = EXCLUDED.processed_ids,
                 progress = EXCLUDED.progress,
                 updated_at = now()",
        )
        .persistent(false)
        .bind(cp.current_phase.as_str())
        .bind(cp.current_batch)
        .bind(cp.last_processed_id)
        .bind(&ids)
        .bind(cp.progress)
        .execute(&self.db.pool)
        .await
        .context("saving checkpoint")?;

        if let Some(metrics) = &self.metrics {
            let snap = metrics.snapshot();
            sqlx::query(
                "UPDATE sync_status
                 SET progress = $1, current_operation = $2, processed_records = $3,
                     valid_records = $4, invalid_records = $5, updated_at = now()
                 WHERE id = 1",
            )
            .persistent(false)
            .bind(cp.progress)
            .bind(current_operation)
            .bind(snap.total_records_processed as i64)
            .bind(snap.valid_records as i64)
            .bind(snap.invalid_records as i64)
            .execute(&self.db.pool)
            .await
            .context("mirroring checkpoint into sync_status")?;
        } else {
            sqlx::query(
                "UPDATE sync_status SET progress = $1, current_operation = $2, updated_at = now()
                 WHERE id = 1",
            )
            .persistent(false)
            .bind(cp.progress)
            .bind(current_operation)
            .execute(&self.db.pool)
            .await
            .context("mirroring checkpoint into sync_status")?;
        }
        Ok(())
    }

    /// Load the current checkpoint, if any. A stored phase name this build
    /// no longer recognizes is a resume inconsistency and fails loudly.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let row: Option<(String, i32, Option<i64>, serde_json::Value, i16)> = sqlx::query_as(
            "SELECT current_phase, current_batch, last_processed_id, processed_ids, progress
             FROM sync_checkpoints WHERE id = 1",
        )
        .persistent(false)
        .fetch_optional(&self.db.pool)
        .await
        .context("loading checkpoint")?;

        let Some((phase_raw, current_batch, last_processed_id, ids_raw, progress)) = row else {
            return Ok(None);
        };
        let Some(current_phase) = SyncPhase::parse(&phase_raw) else {
            bail!("checkpoint references unknown phase {phase_raw:?}; refusing to resume");
        };
        let processed_ids: Vec<i64> =
            serde_json::from_value(ids_raw).context("deserializing processed_ids")?;
        let processed_set = processed_ids.iter().copied().collect();
        Ok(Some(Checkpoint {
            current_phase,
            current_batch,
            last_processed_id,
            processed_ids,
            processed_set,
            progress,
        }))
    }

    /// Delete the checkpoint. Never errors if absent.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_checkpoints WHERE id = 1")
            .persistent(false)
            .execute(&self.db.pool)
            .await
            .context("clearing checkpoint")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_processed_is_ordered_and_duplicate_free() {
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);
        assert!(cp.mark_processed(10));
        assert!(cp.mark_processed(12));
        assert!(!cp.mark_processed(10));
        assert_eq!(cp.processed_ids, vec![10, 12]);
        assert_eq!(cp.last_processed_id, Some(12));
        assert!(cp.contains(12));
        assert!(!cp.contains(11));
    }

    #[test]
    fn membership_tracks_the_ordered_ids() {
        let mut cp = Checkpoint::start_of(SyncPhase::Games);
        for id in (0..500).map(|n| n * 3) {
            assert!(cp.mark_processed(id));
        }
        assert!(cp.contains(297));
        assert!(!cp.contains(298));
        assert_eq!(cp.processed_ids.len(), 500);

        cp.advance_phase(SyncPhase::Statistics);
        assert!(!cp.contains(297));
        assert!(cp.mark_processed(297));
    }

    #[test]
    fn progress_is_monotone_and_clamped() {
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);
        cp.set_progress(40);
        cp.set_progress(20);
        assert_eq!(cp.progress, 40);
        cp.set_progress(120);
        assert_eq!(cp.progress, 100);
    }

    #[test]
    fn advance_phase_resets_cursor_state_but_not_progress() {
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);
        cp.mark_processed(5);
        cp.current_batch = 3;
        cp.set_progress(10);
        cp.advance_phase(SyncPhase::Players);
        assert_eq!(cp.current_phase, SyncPhase::Players);
        assert_eq!(cp.current_batch, 0);
        assert_eq!(cp.last_processed_id, None);
        assert!(cp.processed_ids.is_empty());
        assert_eq!(cp.progress, 10);
    }
}
