//! CLUBS phase: paged club listings into the `clubs` table.

use crate::scrape::{ClubRecord, Page};
use crate::sync::error::SyncError;
use crate::sync::phase::{PagedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct ClubListing;

fn validate(record: &ClubRecord) -> Result<(), String> {
    if record.external_id <= 0 {
        return Err(format!("club has non-positive id {}", record.external_id));
    }
    if record.name.trim().is_empty() {
        return Err(format!("club {} has an empty name", record.external_id));
    }
    Ok(())
}

pub async fn ensure_club(db: &Db, record: &ClubRecord) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO clubs (external_id, name, city, region, updated_at)
         VALUES ($1, $2, $3, $4, now())
         ON CONFLICT (external_id) DO UPDATE SET
             name = EXCLUDED.name,
             city = EXCLUDED.city,
             region = EXCLUDED.region,
             updated_at = now()",
    )
    .persistent(false)
    .bind(record.external_id)
    .bind(record.name.trim())
    .bind(record.city.as_deref())
    .bind(record.region.as_deref())
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[async_trait]
impl PagedUnits for ClubListing {
    type Item = ClubRecord;

    fn phase(&self) -> SyncPhase {
        SyncPhase::Clubs
    }

    fn entity_type(&self) -> &'static str {
        "club"
    }

    async fn fetch_page(
        &self,
        ctx: &PhaseServices,
        page: i32,
    ) -> Result<Page<ClubRecord>, SyncError> {
        ctx.source.clubs_page(page).await
    }

    fn item_id(&self, item: &ClubRecord) -> i64 {
        item.external_id
    }

    async fn apply(&self, ctx: &PhaseServices, item: &ClubRecord) -> Result<(), SyncError> {
        if let Err(reason) = validate(item) {
            ctx.metrics.record_invalid();
            return Err(SyncError::validation(reason));
        }
        ensure_club(&ctx.db, item).await?;
        ctx.metrics.record_valid();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn club(id: i64, name: &str) -> ClubRecord {
        ClubRecord {
            external_id: id,
            name: name.to_string(),
            city: None,
            region: None,
        }
    }

    #[test]
    fn rejects_blank_name_and_bad_id() {
        assert!(validate(&club(1, "Rook & Pawn")).is_ok());
        assert!(validate(&club(1, "   ")).is_err());
        assert!(validate(&club(0, "Rook & Pawn")).is_err());
    }
}
