//! PLAYERS phase: paged id listings, one detail fetch per player.

use crate::scrape::{Page, PlayerRecord};
use crate::sync::error::SyncError;
use crate::sync::phase::{PagedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;
use chrono::Datelike;

pub struct PlayerListing;

fn validate(record: &PlayerRecord) -> Result<(), String> {
    if record.external_id <= 0 {
        return Err(format!(
            "player has non-positive id {}",
            record.external_id
        ));
    }
    if record.full_name.trim().is_empty() {
        return Err(format!("player {} has an empty name", record.external_id));
    }
    if let Some(year) = record.birth_year {
        let this_year = chrono::Utc::now().year();
        if year < 1900 || year > this_year {
            return Err(format!(
                "player {} has implausible birth year {year}",
                record.external_id
            ));
        }
    }
    if let Some(rating) = record.rating {
        if !(0..=4000).contains(&rating) {
            return Err(format!(
                "player {} has out-of-range rating {rating}",
                record.external_id
            ));
        }
    }
    Ok(())
}

pub async fn ensure_player(db: &Db, record: &PlayerRecord) -> Result<(), SyncError> {
    // club_external_id is kept only when the club is already imported; a
    // dangling reference degrades to NULL rather than failing the player.
    sqlx::query(
        "INSERT INTO players (external_id, full_name, birth_year, club_external_id, rating, updated_at)
         VALUES ($1, $2, $3,
                 (SELECT external_id FROM clubs WHERE external_id = $4),
                 $5, now())
         ON CONFLICT (external_id) DO UPDATE SET
             full_name = EXCLUDED.full_name,
             birth_year = EXCLUDED.birth_year,
             club_external_id = EXCLUDED.club_external_id,
             rating = EXCLUDED.rating,
             updated_at = now()",
    )
    .persistent(false)
    .bind(record.external_id)
    .bind(record.full_name.trim())
    .bind(record.birth_year)
    .bind(record.club_external_id)
    .bind(record.rating)
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[async_trait]
impl PagedUnits for PlayerListing {
    type Item = i64;

    fn phase(&self) -> SyncPhase {
        SyncPhase::Players
    }

    fn entity_type(&self) -> &'static str {
        "player"
    }

    async fn fetch_page(&self, ctx: &PhaseServices, page: i32) -> Result<Page<i64>, SyncError> {
        ctx.source.player_ids_page(page).await
    }

    fn item_id(&self, item: &i64) -> i64 {
        *item
    }

    async fn apply(&self, ctx: &PhaseServices, item: &i64) -> Result<(), SyncError> {
        let record = ctx.source.player(*item).await?;
        if let Err(reason) = validate(&record) {
            ctx.metrics.record_invalid();
            return Err(SyncError::validation(reason));
        }
        ensure_player(&ctx.db, &record).await?;
        ctx.metrics.record_valid();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(name: &str, birth_year: Option<i32>, rating: Option<i32>) -> PlayerRecord {
        PlayerRecord {
            external_id: 9,
            full_name: name.to_string(),
            birth_year,
            club_external_id: None,
            rating,
        }
    }

    #[test]
    fn validation_bounds() {
        assert!(validate(&player("Vera Menchik", Some(1906), Some(2350))).is_ok());
        assert!(validate(&player("", None, None)).is_err());
        assert!(validate(&player("X", Some(1850), None)).is_err());
        assert!(validate(&player("X", Some(3000), None)).is_err());
        assert!(validate(&player("X", None, Some(-5))).is_err());
        assert!(validate(&player("X", None, Some(4500))).is_err());
    }
}
