//! Skipped-entity ledger: the durable audit trail for partial failure.
//!
//! One row per unit of work (a player, a page) that could not be completed
//! even after retries. Rows are never deleted by the pipeline; status moves
//! PENDING -> RETRYING -> COMPLETED/FAILED only through explicit retry
//! requests. Re-recording the same failing unit updates the existing row
//! and bumps `retry_count` instead of accumulating duplicates.

use crate::sync::SyncPhase;
use crate::util::db::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipStatus {
    Pending,
    Retrying,
    Completed,
    Failed,
}

impl SkipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipStatus::Pending => "PENDING",
            SkipStatus::Retrying => "RETRYING",
            SkipStatus::Completed => "COMPLETED",
            SkipStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<SkipStatus> {
        [
            SkipStatus::Pending,
            SkipStatus::Retrying,
            SkipStatus::Completed,
            SkipStatus::Failed,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
    }
}

/// Identifies a failed unit: an entity id or a page number, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRef {
    Entity { kind: &'static str, id: i64 },
    Page(i32),
}

impl UnitRef {
    pub fn entity_type(&self) -> &'static str {
        match self {
            UnitRef::Entity { kind, .. } => kind,
            UnitRef::Page(_) => "page",
        }
    }

    pub fn entity_id(&self) -> Option<i64> {
        match self {
            UnitRef::Entity { id, .. } => Some(*id),
            UnitRef::Page(_) => None,
        }
    }

    pub fn page_number(&self) -> Option<i32> {
        match self {
            UnitRef::Entity { .. } => None,
            UnitRef::Page(n) => Some(*n),
        }
    }
}

impl std::fmt::Display for UnitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitRef::Entity { kind, id } => write!(f, "{kind} {id}"),
            UnitRef::Page(n) => write!(f, "page {n}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SkippedEntity {
    pub id: i64,
    pub phase: String,
    pub entity_type: String,
    pub entity_id: Option<i64>,
    pub page_number: Option<i32>,
    pub error_code: String,
    pub error_message: String,
    pub retry_count: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SkipSummaryRow {
    pub phase: String,
    pub status: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct SkippedLedger {
    db: Db,
}

impl SkippedLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a PENDING row for a retry-exhausted or permanent failure.
    /// Idempotent per unit: conflicts update in place and bump retry_count.
    pub async fn record_skip(
        &self,
        phase: SyncPhase,
        unit: UnitRef,
        error_code: &str,
        error_message: &str,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO skipped_entities
                 (phase, entity_type, entity_id, page_number, error_code, error_message,
                  retry_count, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, 0, 'PENDING', now())
             ON CONFLICT (phase, entity_type, COALESCE(entity_id, -1), COALESCE(page_number, -1))
             DO UPDATE SET
                 error_code = EXCLUDED.error_code,
                 error_message = EXCLUDED.error_message,
                 retry_count = skipped_entities.retry_count + 1,
                 status = 'PENDING'
             RETURNING id",
        )
        .persistent(false)
        .bind(phase.as_str())
        .bind(unit.entity_type())
        .bind(unit.entity_id())
        .bind(unit.page_number())
        .bind(error_code)
        .bind(error_message)
        .fetch_one(&self.db.pool)
        .await
        .with_context(|| format!("recording skip for {unit} in {phase}"))?;
        tracing::warn!(
            phase = %phase,
            unit = %unit,
            error_code,
            error_message,
            "unit skipped"
        );
        Ok(id)
    }

    pub async fn mark_retrying(&self, id: i64) -> Result<()> {
        self.set_status(id, SkipStatus::Retrying, None).await
    }

    pub async fn mark_completed(&self, id: i64) -> Result<()> {
        self.set_status(id, SkipStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, id: i64, error_message: &str) -> Result<()> {
        self.set_status(id, SkipStatus::Failed, Some(error_message))
            .await
    }

    async fn set_status(&self, id: i64, status: SkipStatus, error: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE skipped_entities
             SET status = $2,
                 error_message = COALESCE($3, error_message),
                 retry_count = retry_count + CASE WHEN $2 = 'RETRYING' THEN 1 ELSE 0 END
             WHERE id = $1",
        )
        .persistent(false)
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.db.pool)
        .await
        .with_context(|| format!("updating skipped entity {id} to {}", status.as_str()))?;
        Ok(())
    }

    pub async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<SkippedEntity>> {
        let rows = sqlx::query_as::<_, SkippedEntity>(
            "SELECT * FROM skipped_entities WHERE id = ANY($1) ORDER BY id",
        )
        .persistent(false)
        .bind(ids)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_by_phase(
        &self,
        phase: SyncPhase,
        status: Option<SkipStatus>,
    ) -> Result<Vec<SkippedEntity>> {
        let rows = sqlx::query_as::<_, SkippedEntity>(
            "SELECT * FROM skipped_entities
             WHERE phase = $1 AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at, id",
        )
        .persistent(false)
        .bind(phase.as_str())
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_by_player(&self, entity_id: i64) -> Result<Vec<SkippedEntity>> {
        let rows = sqlx::query_as::<_, SkippedEntity>(
            "SELECT * FROM skipped_entities WHERE entity_id = $1 ORDER BY created_at, id",
        )
        .persistent(false)
        .bind(entity_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_by_page(
        &self,
        phase: SyncPhase,
        page_number: i32,
    ) -> Result<Option<SkippedEntity>> {
        let row = sqlx::query_as::<_, SkippedEntity>(
            "SELECT * FROM skipped_entities WHERE phase = $1 AND page_number = $2",
        )
        .persistent(false)
        .bind(phase.as_str())
        .bind(page_number)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_all(&self) -> Result<Vec<SkippedEntity>> {
        let rows = sqlx::query_as::<_, SkippedEntity>(
            "SELECT * FROM skipped_entities ORDER BY created_at, id",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    /// Counts grouped by phase and status, for operator remediation and the
    /// run record's final payload.
    pub async fn summary(&self) -> Result<Vec<SkipSummaryRow>> {
        let rows = sqlx::query_as::<_, SkipSummaryRow>(
            "SELECT phase, status, count(*) AS count
             FROM skipped_entities
             GROUP BY phase, status
             ORDER BY phase, status",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    /// Pages still pending/failed, embedded into the run record on
    /// completion so the dashboard can surface holes in the import.
    pub async fn open_page_skips(&self) -> Result<Vec<SkippedEntity>> {
        let rows = sqlx::query_as::<_, SkippedEntity>(
            "SELECT * FROM skipped_entities
             WHERE entity_type = 'page' AND status IN ('PENDING', 'FAILED')
             ORDER BY phase, page_number",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_ref_is_entity_xor_page() {
        let player = UnitRef::Entity {
            kind: "player",
            id: 42,
        };
        assert_eq!(player.entity_id(), Some(42));
        assert_eq!(player.page_number(), None);
        assert_eq!(player.entity_type(), "player");

        let page = UnitRef::Page(7);
        assert_eq!(page.entity_id(), None);
        assert_eq!(page.page_number(), Some(7));
        assert_eq!(page.entity_type(), "page");
    }

    #[test]
    fn display_reads_naturally() {
        assert_eq!(
            UnitRef::Entity {
                kind: "club",
                id: 3
            }
            .to_string(),
            "club 3"
        );
        assert_eq!(UnitRef::Page(12).to_string(), "page 12");
    }
}
