//! CLUB_MEMBERS phase: membership rows for every imported club.

use crate::scrape::ClubMemberRecord;
use crate::sync::error::SyncError;
use crate::sync::phase::{KeyedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct ClubMembers;

/// Membership insert guarded by the player existing; a row naming a player
/// the PLAYERS phase never produced is counted invalid, not fatal.
pub async fn ensure_member(db: &Db, record: &ClubMemberRecord) -> Result<bool, SyncError> {
    let result = sqlx::query(
        "INSERT INTO club_members (club_external_id, player_external_id, joined_year)
         SELECT $1, $2, $3
         WHERE EXISTS (SELECT 1 FROM players WHERE external_id = $2)
         ON CONFLICT (club_external_id, player_external_id) DO UPDATE SET
             joined_year = EXCLUDED.joined_year",
    )
    .persistent(false)
    .bind(record.club_external_id)
    .bind(record.player_external_id)
    .bind(record.joined_year)
    .execute(&db.pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl KeyedUnits for ClubMembers {
    fn phase(&self) -> SyncPhase {
        SyncPhase::ClubMembers
    }

    fn entity_type(&self) -> &'static str {
        "club"
    }

    async fn unit_ids(
        &self,
        ctx: &PhaseServices,
        after: Option<i64>,
    ) -> Result<Vec<i64>, SyncError> {
        let ids = sqlx::query_scalar(
            "SELECT external_id FROM clubs WHERE external_id > $1
             ORDER BY external_id LIMIT $2",
        )
        .persistent(false)
        .bind(after.unwrap_or(0))
        .bind(self.batch_size())
        .fetch_all(&ctx.db.pool)
        .await?;
        Ok(ids)
    }

    async fn process(&self, ctx: &PhaseServices, club_id: i64) -> Result<(), SyncError> {
        let members = ctx.source.club_members(club_id).await?;
        for member in &members {
            if member.club_external_id != club_id {
                ctx.metrics.record_invalid();
                continue;
            }
            if ensure_member(&ctx.db, member).await? {
                ctx.metrics.record_valid();
            } else {
                ctx.metrics.record_invalid();
                tracing::warn!(
                    club = club_id,
                    player = member.player_external_id,
                    "membership names a player that was never imported"
                );
            }
        }
        Ok(())
    }
}
