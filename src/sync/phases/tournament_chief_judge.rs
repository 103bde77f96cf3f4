//! TOURNAMENT_CHIEF_JUDGE phase: one optional judge per tournament.
//!
//! Runs before the JUDGES listing phase, so a chief judge the listing has
//! not reached yet is inserted as a name-only stub; the JUDGES phase later
//! overwrites the stub with the full record.

use crate::scrape::ChiefJudgeRecord;
use crate::sync::error::SyncError;
use crate::sync::phase::{KeyedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct TournamentChiefJudge;

pub async fn ensure_chief_judge(db: &Db, record: &ChiefJudgeRecord) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO judges (external_id, full_name)
         VALUES ($1, $2)
         ON CONFLICT (external_id) DO NOTHING",
    )
    .persistent(false)
    .bind(record.judge_external_id)
    .bind(record.judge_name.trim())
    .execute(&db.pool)
    .await?;

    sqlx::query(
        "INSERT INTO tournament_chief_judges (tournament_external_id, judge_external_id)
         VALUES ($1, $2)
         ON CONFLICT (tournament_external_id) DO UPDATE SET
             judge_external_id = EXCLUDED.judge_external_id",
    )
    .persistent(false)
    .bind(record.tournament_external_id)
    .bind(record.judge_external_id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[async_trait]
impl KeyedUnits for TournamentChiefJudge {
    fn phase(&self) -> SyncPhase {
        SyncPhase::TournamentChiefJudge
    }

    fn entity_type(&self) -> &'static str {
        "tournament"
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
        // Absence is the common case and not an error.
        let Some(record) = ctx.source.tournament_chief_judge(tournament_id).await? else {
            return Ok(());
        };
        if record.judge_external_id <= 0 || record.judge_name.trim().is_empty() {
            ctx.metrics.record_invalid();
            return Err(SyncError::validation(format!(
                "tournament {tournament_id} names an unidentifiable chief judge"
            )));
        }
        ensure_chief_judge(&ctx.db, &record).await?;
        ctx.metrics.record_valid();
        Ok(())
    }
}
