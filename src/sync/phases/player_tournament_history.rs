//! PLAYER_TOURNAMENT_HISTORY phase: per-player tournament results.

use crate::scrape::PlayerTournamentRecord;
use crate::sync::error::SyncError;
use crate::sync::phase::{KeyedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct PlayerTournamentHistory;

/// Guarded by the tournament existing; a result for a tournament the
/// TOURNAMENTS phase skipped is counted invalid and logged, not fatal.
pub async fn ensure_history_row(
    db: &Db,
    record: &PlayerTournamentRecord,
) -> Result<bool, SyncError> {
    let result = sqlx::query(
        "INSERT INTO player_tournament_history
             (player_external_id, tournament_external_id, place, score, rating_change)
         SELECT $1, $2, $3, $4, $5
         WHERE EXISTS (SELECT 1 FROM tournaments WHERE external_id = $2)
         ON CONFLICT (player_external_id, tournament_external_id) DO UPDATE SET
             place = EXCLUDED.place,
             score = EXCLUDED.score,
             rating_change = EXCLUDED.rating_change",
    )
    .persistent(false)
    .bind(record.player_external_id)
    .bind(record.tournament_external_id)
    .bind(record.place)
    .bind(record.score)
    .bind(record.rating_change)
    .execute(&db.pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl KeyedUnits for PlayerTournamentHistory {
    fn phase(&self) -> SyncPhase {
        SyncPhase::PlayerTournamentHistory
    }

    fn entity_type(&self) -> &'static str {
        "player"
    }

    async fn unit_ids(
        &self,
        ctx: &PhaseServices,
        after: Option<i64>,
    ) -> Result<Vec<i64>, SyncError> {
        let ids = sqlx::query_scalar(
            "SELECT external_id FROM players WHERE external_id > $1
             ORDER BY external_id LIMIT $2",
        )
        .persistent(false)
        .bind(after.unwrap_or(0))
        .bind(self.batch_size())
        .fetch_all(&ctx.db.pool)
        .await?;
        Ok(ids)
    }

    async fn process(&self, ctx: &PhaseServices, player_id: i64) -> Result<(), SyncError> {
        let history = ctx.source.player_tournament_history(player_id).await?;
        for record in &history {
            if record.player_external_id != player_id {
                ctx.metrics.record_invalid();
                continue;
            }
            if let Some(place) = record.place {
                if place <= 0 {
                    ctx.metrics.record_invalid();
                    tracing::warn!(
                        player = player_id,
                        tournament = record.tournament_external_id,
                        place,
                        "history row rejected: place must be positive"
                    );
                    continue;
                }
            }
            if ensure_history_row(&ctx.db, record).await? {
                ctx.metrics.record_valid();
            } else {
                ctx.metrics.record_invalid();
                tracing::warn!(
                    player = player_id,
                    tournament = record.tournament_external_id,
                    "history row names a tournament that was never imported"
                );
            }
        }
        Ok(())
    }
}
