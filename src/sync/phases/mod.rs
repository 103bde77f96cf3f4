//! The ten pipeline phases, in dependency order.
//!
//! Each module owns one entity type: its validation rules, its upsert SQL
//! and its unit iteration shape. The [`PagedPhase`] and [`KeyedPhase`]
//! adapters lift those shapes into the [`Phase`] contract so the
//! orchestrator only ever sees a uniform list.

pub mod club_members;
pub mod clubs;
pub mod games;
pub mod judges;
pub mod player_tournament_history;
pub mod player_year_stats;
pub mod players;
pub mod statistics;
pub mod tournament_chief_judge;
pub mod tournaments;

use crate::sync::error::{SyncError, EC_NOT_FOUND, EC_VALIDATION};
use crate::sync::phase::{
    drive_keyed, drive_paged, find_in_listing, KeyedUnits, PagedUnits, Phase, PhaseServices,
};
use crate::sync::checkpoint::Checkpoint;
use crate::sync::skipped::SkippedEntity;
use crate::sync::SyncPhase;
use async_trait::async_trait;
use std::sync::Arc;

pub struct PagedPhase<P> {
    units: P,
}

impl<P> PagedPhase<P> {
    pub fn new(units: P) -> Self {
        Self { units }
    }
}

#[async_trait]
impl<P: PagedUnits> Phase for PagedPhase<P> {
    fn id(&self) -> SyncPhase {
        self.units.phase()
    }

    async fn execute(&self, ctx: &PhaseServices, cp: &mut Checkpoint) -> Result<(), SyncError> {
        drive_paged(&self.units, ctx, cp).await
    }

    async fn retry_unit(
        &self,
        ctx: &PhaseServices,
        entry: &SkippedEntity,
    ) -> Result<(), SyncError> {
        match (entry.entity_id, entry.page_number) {
            (Some(id), _) => {
                let Some(item) = find_in_listing(&self.units, ctx, id).await? else {
                    return Err(SyncError::permanent(
                        EC_NOT_FOUND,
                        format!("{} {id} no longer listed by the portal", entry.entity_type),
                    ));
                };
                self.units.apply(ctx, &item).await
            }
            (None, Some(page)) => {
                let listing = ctx
                    .retry
                    .run(&ctx.cancel, |_| self.units.fetch_page(ctx, page))
                    .await?;
                for item in &listing.items {
                    ctx.retry
                        .run(&ctx.cancel, |_| self.units.apply(ctx, item))
                        .await?;
                }
                Ok(())
            }
            (None, None) => Err(SyncError::permanent(
                EC_VALIDATION,
                "ledger row identifies neither an entity nor a page",
            )),
        }
    }
}

pub struct KeyedPhase<K> {
    units: K,
}

impl<K> KeyedPhase<K> {
    pub fn new(units: K) -> Self {
        Self { units }
    }
}

#[async_trait]
impl<K: KeyedUnits> Phase for KeyedPhase<K> {
    fn id(&self) -> SyncPhase {
        self.units.phase()
    }

    async fn execute(&self, ctx: &PhaseServices, cp: &mut Checkpoint) -> Result<(), SyncError> {
        drive_keyed(&self.units, ctx, cp).await
    }

    async fn retry_unit(
        &self,
        ctx: &PhaseServices,
        entry: &SkippedEntity,
    ) -> Result<(), SyncError> {
        let Some(id) = entry.entity_id else {
            return Err(SyncError::permanent(
                EC_VALIDATION,
                "ledger row for a keyed phase carries no entity id",
            ));
        };
        ctx.retry
            .run(&ctx.cancel, |_| self.units.process(ctx, id))
            .await
    }
}

/// All phases in foreign-key dependency order. Indexed by
/// [`SyncPhase::index`]; the orchestrator relies on that alignment.
pub fn build_phases() -> Vec<Arc<dyn Phase>> {
    vec![
        Arc::new(PagedPhase::new(clubs::ClubListing)),
        Arc::new(PagedPhase::new(players::PlayerListing)),
        Arc::new(KeyedPhase::new(club_members::ClubMembers)),
        Arc::new(KeyedPhase::new(player_year_stats::PlayerYearStats)),
        Arc::new(PagedPhase::new(tournaments::TournamentListing)),
        Arc::new(KeyedPhase::new(
            tournament_chief_judge::TournamentChiefJudge,
        )),
        Arc::new(KeyedPhase::new(
            player_tournament_history::PlayerTournamentHistory,
        )),
        Arc::new(PagedPhase::new(judges::JudgeListing)),
        Arc::new(KeyedPhase::new(games::TournamentGames)),
        Arc::new(KeyedPhase::new(statistics::GameStatistics)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::Page;
    use crate::sync::phase::testutil::services;
    use std::sync::Mutex;

    #[test]
    fn phase_list_matches_canonical_order() {
        let phases = build_phases();
        assert_eq!(phases.len(), SyncPhase::ORDER.len());
        for (i, phase) in phases.iter().enumerate() {
            assert_eq!(phase.id(), SyncPhase::ORDER[i]);
            assert_eq!(phase.id().index(), i);
        }
    }

    fn ledger_row(entity_id: Option<i64>, page_number: Option<i32>) -> SkippedEntity {
        SkippedEntity {
            id: 1,
            phase: "CLUBS".to_string(),
            entity_type: if entity_id.is_some() { "club" } else { "page" }.to_string(),
            entity_id,
            page_number,
            error_code: "EC-002".to_string(),
            error_message: "portal flaked".to_string(),
            retry_count: 1,
            status: "RETRYING".to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    struct RetryListing {
        pages: Vec<Vec<i64>>,
        applied: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl PagedUnits for RetryListing {
        type Item = i64;

        fn phase(&self) -> SyncPhase {
            SyncPhase::Clubs
        }
        fn entity_type(&self) -> &'static str {
            "club"
        }
        async fn fetch_page(
            &self,
            _ctx: &PhaseServices,
            page: i32,
        ) -> Result<Page<i64>, SyncError> {
            Ok(Page {
                number: page,
                total_pages: self.pages.len() as i32,
                items: self.pages.get(page as usize).cloned().unwrap_or_default(),
            })
        }
        fn item_id(&self, item: &i64) -> i64 {
            *item
        }
        async fn apply(&self, _ctx: &PhaseServices, item: &i64) -> Result<(), SyncError> {
            self.applied.lock().unwrap().push(*item);
            Ok(())
        }
    }

    fn retry_listing() -> PagedPhase<RetryListing> {
        PagedPhase::new(RetryListing {
            pages: vec![vec![1, 2], vec![3, 4]],
            applied: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn entity_retry_finds_and_applies_the_listed_item() {
        let (ctx, _saves, _ledger) = services();
        let phase = retry_listing();

        phase
            .retry_unit(&ctx, &ledger_row(Some(3), None))
            .await
            .unwrap();

        assert_eq!(*phase.units.applied.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn entity_retry_reports_a_vanished_item() {
        let (ctx, _saves, _ledger) = services();
        let phase = retry_listing();

        let err = phase
            .retry_unit(&ctx, &ledger_row(Some(99), None))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Permanent { ref code, .. } if code == EC_NOT_FOUND));
        assert!(phase.units.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_retry_reapplies_every_item_on_the_page() {
        let (ctx, _saves, _ledger) = services();
        let phase = retry_listing();

        phase
            .retry_unit(&ctx, &ledger_row(None, Some(1)))
            .await
            .unwrap();

        assert_eq!(*phase.units.applied.lock().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn ledger_row_without_a_unit_is_rejected() {
        let (ctx, _saves, _ledger) = services();
        let phase = retry_listing();

        let err = phase
            .retry_unit(&ctx, &ledger_row(None, None))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Permanent { ref code, .. } if code == EC_VALIDATION));
    }

    struct RetryKeyed {
        processed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl KeyedUnits for RetryKeyed {
        fn phase(&self) -> SyncPhase {
            SyncPhase::PlayerYearStats
        }
        fn entity_type(&self) -> &'static str {
            "player"
        }
        async fn unit_ids(
            &self,
            _ctx: &PhaseServices,
            _after: Option<i64>,
        ) -> Result<Vec<i64>, SyncError> {
            Ok(Vec::new())
        }
        async fn process(&self, _ctx: &PhaseServices, id: i64) -> Result<(), SyncError> {
            self.processed.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn keyed_retry_reprocesses_exactly_one_unit() {
        let (ctx, _saves, _ledger) = services();
        let phase = KeyedPhase::new(RetryKeyed {
            processed: Mutex::new(Vec::new()),
        });

        phase
            .retry_unit(&ctx, &ledger_row(Some(20), None))
            .await
            .unwrap();
        assert_eq!(*phase.units.processed.lock().unwrap(), vec![20]);

        let err = phase
            .retry_unit(&ctx, &ledger_row(None, Some(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Permanent { ref code, .. } if code == EC_VALIDATION));
    }
}
