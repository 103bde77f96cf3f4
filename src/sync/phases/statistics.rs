//! STATISTICS phase: optional per-game statistics, last in the pipeline.

use crate::scrape::GameStatsRecord;
use crate::sync::error::SyncError;
use crate::sync::phase::{KeyedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct GameStatistics;

fn validate(record: &GameStatsRecord) -> Result<(), String> {
    if matches!(record.moves, Some(m) if m < 0) {
        return Err(format!(
            "game {} statistics carry a negative move count",
            record.game_external_id
        ));
    }
    if matches!(record.duration_minutes, Some(d) if d < 0) {
        return Err(format!(
            "game {} statistics carry a negative duration",
            record.game_external_id
        ));
    }
    Ok(())
}

pub async fn ensure_game_stats(db: &Db, record: &GameStatsRecord) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO game_statistics (game_external_id, moves, opening_code, duration_minutes)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (game_external_id) DO UPDATE SET
             moves = EXCLUDED.moves,
             opening_code = EXCLUDED.opening_code,
             duration_minutes = EXCLUDED.duration_minutes",
    )
    .persistent(false)
    .bind(record.game_external_id)
    .bind(record.moves)
    .bind(record.opening_code.as_deref())
    .bind(record.duration_minutes)
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[async_trait]
impl KeyedUnits for GameStatistics {
    fn phase(&self) -> SyncPhase {
        SyncPhase::Statistics
    }

    fn entity_type(&self) -> &'static str {
        "game"
    }

    fn batch_size(&self) -> i64 {
        250
    }

    async fn unit_ids(
        &self,
        ctx: &PhaseServices,
        after: Option<i64>,
    ) -> Result<Vec<i64>, SyncError> {
        let ids = sqlx::query_scalar(
            "SELECT external_id FROM games WHERE external_id > $1
             ORDER BY external_id LIMIT $2",
        )
        .persistent(false)
        .bind(after.unwrap_or(0))
        .bind(self.batch_size())
        .fetch_all(&ctx.db.pool)
        .await?;
        Ok(ids)
    }

    async fn process(&self, ctx: &PhaseServices, game_id: i64) -> Result<(), SyncError> {
        // Many games have no statistics page at all.
        let Some(record) = ctx.source.game_statistics(game_id).await? else {
            return Ok(());
        };
        if let Err(reason) = validate(&record) {
            ctx.metrics.record_invalid();
            return Err(SyncError::validation(reason));
        }
        ensure_game_stats(&ctx.db, &record).await?;
        ctx.metrics.record_valid();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_counters_are_rejected() {
        let mut s = GameStatsRecord {
            game_external_id: 1,
            moves: Some(42),
            opening_code: Some("B12".to_string()),
            duration_minutes: Some(95),
        };
        assert!(validate(&s).is_ok());
        s.moves = Some(-1);
        assert!(validate(&s).is_err());
        s.moves = None;
        s.duration_minutes = Some(-10);
        assert!(validate(&s).is_err());
    }
}
