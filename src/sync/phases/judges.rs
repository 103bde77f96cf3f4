//! JUDGES phase: paged judge listings; overwrites any name-only stubs the
//! chief-judge phase created.

use crate::scrape::{JudgeRecord, Page};
use crate::sync::error::SyncError;
use crate::sync::phase::{PagedUnits, PhaseServices};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use async_trait::async_trait;

pub struct JudgeListing;

fn validate(record: &JudgeRecord) -> Result<(), String> {
    if record.external_id <= 0 {
        return Err(format!("judge has non-positive id {}", record.external_id));
    }
    if record.full_name.trim().is_empty() {
        return Err(format!("judge {} has an empty name", record.external_id));
    }
    Ok(())
}

pub async fn ensure_judge(db: &Db, record: &JudgeRecord) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO judges (external_id, full_name, category)
         VALUES ($1, $2, $3)
         ON CONFLICT (external_id) DO UPDATE SET
             full_name = EXCLUDED.full_name,
             category = EXCLUDED.category",
    )
    .persistent(false)
    .bind(record.external_id)
    .bind(record.full_name.trim())
    .bind(record.category.as_deref())
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[async_trait]
impl PagedUnits for JudgeListing {
    type Item = JudgeRecord;

    fn phase(&self) -> SyncPhase {
        SyncPhase::Judges
    }

    fn entity_type(&self) -> &'static str {
        "judge"
    }

    async fn fetch_page(
        &self,
        ctx: &PhaseServices,
        page: i32,
    ) -> Result<Page<JudgeRecord>, SyncError> {
        ctx.source.judges_page(page).await
    }

    fn item_id(&self, item: &JudgeRecord) -> i64 {
        item.external_id
    }

    async fn apply(&self, ctx: &PhaseServices, item: &JudgeRecord) -> Result<(), SyncError> {
        if let Err(reason) = validate(item) {
            ctx.metrics.record_invalid();
            return Err(SyncError::validation(reason));
        }
        ensure_judge(&ctx.db, item).await?;
        ctx.metrics.record_valid();
        Ok(())
    }
}
