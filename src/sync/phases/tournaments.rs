//! TOURNAMENTS phase: paged tournament listings.

use crate::scrape::{Page, TournamentRecord};
use crate::sync::error::SyncError;
use crate::sync::phase::{PagedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct TournamentListing;

fn validate(record: &TournamentRecord) -> Result<(), String> {
    if record.external_id <= 0 {
        return Err(format!(
            "tournament has non-positive id {}",
            record.external_id
        ));
    }
    if record.name.trim().is_empty() {
        return Err(format!(
            "tournament {} has an empty name",
            record.external_id
        ));
    }
    if let (Some(start), Some(end)) = (record.start_date, record.end_date) {
        if end < start {
            return Err(format!(
                "tournament {} ends before it starts ({start} > {end})",
                record.external_id
            ));
        }
    }
    Ok(())
}

pub async fn ensure_tournament(db: &Db, record: &TournamentRecord) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO tournaments
             (external_id, name, location, start_date, end_date, category, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, now())
         ON CONFLICT (external_id) DO UPDATE SET
             name = EXCLUDED.name,
             location = EXCLUDED.location,
             start_date = EXCLUDED.start_date,
             end_date = EXCLUDED.end_date,
             category = EXCLUDED.category,
             updated_at = now()",
    )
    .persistent(false)
    .bind(record.external_id)
    .bind(record.name.trim())
    .bind(record.location.as_deref())
    .bind(record.start_date)
    .bind(record.end_date)
    .bind(record.category.as_deref())
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[async_trait]
impl PagedUnits for TournamentListing {
    type Item = TournamentRecord;

    fn phase(&self) -> SyncPhase {
        SyncPhase::Tournaments
    }

    fn entity_type(&self) -> &'static str {
        "tournament"
    }

    async fn fetch_page(
        &self,
        ctx: &PhaseServices,
        page: i32,
    ) -> Result<Page<TournamentRecord>, SyncError> {
        ctx.source.tournaments_page(page).await
    }

    fn item_id(&self, item: &TournamentRecord) -> i64 {
        item.external_id
    }

    async fn apply(&self, ctx: &PhaseServices, item: &TournamentRecord) -> Result<(), SyncError> {
        if let Err(reason) = validate(item) {
            ctx.metrics.record_invalid();
            return Err(SyncError::validation(reason));
        }
        ensure_tournament(&ctx.db, item).await?;
        ctx.metrics.record_valid();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn end_date_cannot_precede_start() {
        let mut t = TournamentRecord {
            external_id: 5,
            name: "Spring Open".to_string(),
            location: None,
            start_date: NaiveDate::from_ymd_opt(2025, 4, 10),
            end_date: NaiveDate::from_ymd_opt(2025, 4, 12),
            category: None,
        };
        assert!(validate(&t).is_ok());
        t.end_date = NaiveDate::from_ymd_opt(2025, 4, 9);
        assert!(validate(&t).is_err());
    }
}
