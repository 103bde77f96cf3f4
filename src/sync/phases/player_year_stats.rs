//! PLAYER_YEAR_STATS phase: yearly aggregates for every imported player.

use crate::scrape::PlayerYearStatsRecord;
use crate::sync::error::SyncError;
use crate::sync::phase::{KeyedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct PlayerYearStats;

fn validate(record: &PlayerYearStatsRecord) -> Result<(), String> {
    if !(1900..=2100).contains(&record.year) {
        return Err(format!(
            "player {} stats carry implausible year {}",
            record.player_external_id, record.year
        ));
    }
    let counts = [
        record.games_played,
        record.wins,
        record.draws,
        record.losses,
    ];
    if counts.iter().any(|c| *c < 0) {
        return Err(format!(
            "player {} year {} has negative counters",
            record.player_external_id, record.year
        ));
    }
    if record.wins + record.draws + record.losses > record.games_played {
        return Err(format!(
            "player {} year {}: results exceed games played",
            record.player_external_id, record.year
        ));
    }
    Ok(())
}

pub async fn ensure_year_stats(db: &Db, record: &PlayerYearStatsRecord) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO player_year_stats
             (player_external_id, year, games_played, wins, draws, losses,
              rating_start, rating_end)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (player_external_id, year) DO UPDATE SET
             games_played = EXCLUDED.games_played,
             wins = EXCLUDED.wins,
             draws = EXCLUDED.draws,
             losses = EXCLUDED.losses,
             rating_start = EXCLUDED.rating_start,
             rating_end = EXCLUDED.rating_end",
    )
    .persistent(false)
    .bind(record.player_external_id)
    .bind(record.year)
    .bind(record.games_played)
    .bind(record.wins)
    .bind(record.draws)
    .bind(record.losses)
    .bind(record.rating_start)
    .bind(record.rating_end)
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[async_trait]
impl KeyedUnits for PlayerYearStats {
    fn phase(&self) -> SyncPhase {
        SyncPhase::PlayerYearStats
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
        let stats = ctx.source.player_year_stats(player_id).await?;
        for record in &stats {
            if record.player_external_id != player_id {
                ctx.metrics.record_invalid();
                continue;
            }
            match validate(record) {
                Ok(()) => {
                    ensure_year_stats(&ctx.db, record).await?;
                    ctx.metrics.record_valid();
                }
                Err(reason) => {
                    ctx.metrics.record_invalid();
                    tracing::warn!(player = player_id, %reason, "year stats row rejected");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(year: i32, games: i32, w: i32, d: i32, l: i32) -> PlayerYearStatsRecord {
        PlayerYearStatsRecord {
            player_external_id: 1,
            year,
            games_played: games,
            wins: w,
            draws: d,
            losses: l,
            rating_start: None,
            rating_end: None,
        }
    }

    #[test]
    fn results_must_fit_in_games_played() {
        assert!(validate(&stats(2024, 20, 8, 6, 6)).is_ok());
        assert!(validate(&stats(2024, 10, 8, 6, 6)).is_err());
        assert!(validate(&stats(2024, 10, -1, 0, 0)).is_err());
        assert!(validate(&stats(1800, 10, 5, 0, 5)).is_err());
    }
}
