//! GAMES phase: per-tournament game listings.
//!
//! The unit here is a tournament, not a game: the portal only exposes games
//! as paged listings under a tournament, so one unit walks all of that
//! tournament's pages. A page failure therefore fails the tournament unit
//! as a whole and lands it in the ledger once.

use crate::scrape::GameRecord;
use crate::sync::error::SyncError;
use crate::sync::phase::{KeyedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct TournamentGames;

const RESULTS: [&str; 3] = ["1-0", "0-1", "1/2-1/2"];

fn validate(record: &GameRecord) -> Result<(), String> {
    if record.external_id <= 0 {
        return Err(format!("game has non-positive id {}", record.external_id));
    }
    if !RESULTS.contains(&record.result.as_str()) {
        return Err(format!(
            "game {} has unrecognized result {:?}",
            record.external_id, record.result
        ));
    }
    if record.white_external_id == record.black_external_id {
        return Err(format!(
            "game {} lists the same player on both sides",
            record.external_id
        ));
    }
    Ok(())
}

/// Guarded by both players existing. Games between unimported players are
/// counted invalid rather than breaking referential integrity.
pub async fn ensure_game(db: &Db, record: &GameRecord) -> Result<bool, SyncError> {
    let result = sqlx::query(
        "INSERT INTO games
             (external_id, tournament_external_id, round, white_external_id,
              black_external_id, result, played_at)
         SELECT $1, $2, $3, $4, $5, $6, $7
         WHERE EXISTS (SELECT 1 FROM players WHERE external_id = $4)
           AND EXISTS (SELECT 1 FROM players WHERE external_id = $5)
         ON CONFLICT (external_id) DO UPDATE SET
             round = EXCLUDED.round,
             result = EXCLUDED.result,
             played_at = EXCLUDED.played_at",
    )
    .persistent(false)
    .bind(record.external_id)
    .bind(record.tournament_external_id)
    .bind(record.round)
    .bind(record.white_external_id)
    .bind(record.black_external_id)
    .bind(record.result.as_str())
    .bind(record.played_at)
    .execute(&db.pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl KeyedUnits for TournamentGames {
    fn phase(&self) -> SyncPhase {
        SyncPhase::Games
    }

    fn entity_type(&self) -> &'static str {
        "tournament"
    }

    fn batch_size(&self) -> i64 {
        // Each unit fans out into page fetches; smaller batches keep the
        // checkpoint cursor close to the work actually done.
        25
    }

    async fn unit_ids(
        &self,
        ctx: &PhaseServices,
        after: Option<i64>,
    ) -> Result<Vec<i64>, SyncError> {
        let ids = sqlx::query_scalar(
            "SELECT external_id FROM tournaments WHERE external_id > $1
             ORDER BY external_id LIMIT $2",
        )
        .persistent(false)
        .bind(after.unwrap_or(0))
        .bind(self.batch_size())
        .fetch_all(&ctx.db.pool)
        .await?;
        Ok(ids)
    }

    async fn process(&self, ctx: &PhaseServices, tournament_id: i64) -> Result<(), SyncError> {
        let mut page = 0;
        loop {
            ctx.cancel.check()?;
            let listing = ctx.source.games_page(tournament_id, page).await?;
            for game in &listing.items {
                match validate(game) {
                    Ok(()) => {
                        if ensure_game(&ctx.db, game).await? {
                            ctx.metrics.record_valid();
                        } else {
                            ctx.metrics.record_invalid();
                            tracing::warn!(
                                tournament = tournament_id,
                                game = game.external_id,
                                "game references players that were never imported"
                            );
                        }
                    }
                    Err(reason) => {
                        ctx.metrics.record_invalid();
                        tracing::warn!(tournament = tournament_id, %reason, "game rejected");
                    }
                }
            }
            if listing.is_last() {
                return Ok(());
            }
            page += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(result: &str, white: i64, black: i64) -> GameRecord {
        GameRecord {
            external_id: 77,
            tournament_external_id: 3,
            round: Some(1),
            white_external_id: white,
            black_external_id: black,
            result: result.to_string(),
            played_at: None,
        }
    }

    #[test]
    fn only_standard_results_pass() {
        assert!(validate(&game("1-0", 1, 2)).is_ok());
        assert!(validate(&game("0-1", 1, 2)).is_ok());
        assert!(validate(&game("1/2-1/2", 1, 2)).is_ok());
        assert!(validate(&game("0.5-0.5", 1, 2)).is_err());
        assert!(validate(&game("*", 1, 2)).is_err());
    }

    #[test]
    fn player_cannot_face_themselves() {
        assert!(validate(&game("1-0", 4, 4)).is_err());
    }
}
