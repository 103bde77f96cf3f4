//! Phase contract and the shared per-unit drivers.
//!
//! A phase owns one entity type end-to-end: iterate units in a stable order,
//! fetch -> validate -> upsert each one, record failures to the ledger and
//! keep going. Two unit shapes cover every phase: listing pages
//! ([`PagedUnits`]) and per-entity work keyed by ids already imported
//! ([`KeyedUnits`]). The drivers own cancellation safe points, retry,
//! duplicate suppression on resume and checkpoint cadence so the per-phase
//! modules stay thin.

use crate::scrape::{Page, SiteSource};
use crate::sync::cancel::CancelHandle;
use crate::sync::checkpoint::{Checkpoint, CheckpointStore};
use crate::sync::error::SyncError;
use crate::sync::metrics::ValidationMetrics;
use crate::sync::retry::RetryPolicy;
use crate::sync::skipped::{SkippedEntity, SkippedLedger, UnitRef};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Checkpoint persistence as seen by the drivers.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(&self, cp: &Checkpoint, current_operation: &str) -> Result<()>;
}

#[async_trait]
impl CheckpointSink for CheckpointStore {
    async fn save(&self, cp: &Checkpoint, current_operation: &str) -> Result<()> {
        CheckpointStore::save(self, cp, current_operation).await
    }
}

/// Ledger writes as seen by the drivers.
#[async_trait]
pub trait SkipSink: Send + Sync {
    async fn record_skip(
        &self,
        phase: SyncPhase,
        unit: UnitRef,
        error_code: &str,
        error_message: &str,
    ) -> Result<i64>;
}

#[async_trait]
impl SkipSink for SkippedLedger {
    async fn record_skip(
        &self,
        phase: SyncPhase,
        unit: UnitRef,
        error_code: &str,
        error_message: &str,
    ) -> Result<i64> {
        SkippedLedger::record_skip(self, phase, unit, error_code, error_message).await
    }
}

/// Shared services handed to every phase. Cheap to clone; the orchestrator
/// clones it per phase with that phase's progress span filled in.
#[derive(Clone)]
pub struct PhaseServices {
    pub db: Db,
    pub source: Arc<dyn SiteSource>,
    pub checkpoints: Arc<dyn CheckpointSink>,
    pub ledger: Arc<dyn SkipSink>,
    pub metrics: Arc<ValidationMetrics>,
    pub retry: RetryPolicy,
    pub cancel: CancelHandle,
    /// Units between intra-page checkpoint saves.
    pub checkpoint_every: usize,
    /// Progress window (start, end) this phase maps onto, in percent.
    pub progress_span: (i16, i16),
}

impl PhaseServices {
    pub fn with_span(&self, span: (i16, i16)) -> Self {
        let mut out = self.clone();
        out.progress_span = span;
        out
    }
}

#[async_trait]
pub trait Phase: Send + Sync {
    fn id(&self) -> SyncPhase;

    /// Run the whole phase from the current checkpoint position. Per-unit
    /// failures are handled internally; only cancellation and pipeline-fatal
    /// errors may escape.
    async fn execute(&self, ctx: &PhaseServices, cp: &mut Checkpoint) -> Result<(), SyncError>;

    /// Re-run exactly one previously skipped unit (operator-driven).
    async fn retry_unit(&self, ctx: &PhaseServices, entry: &SkippedEntity)
        -> Result<(), SyncError>;
}

/// A phase whose units come from listing pages.
#[async_trait]
pub trait PagedUnits: Send + Sync {
    type Item: Send + Sync;

    fn phase(&self) -> SyncPhase;
    fn entity_type(&self) -> &'static str;
    async fn fetch_page(
        &self,
        ctx: &PhaseServices,
        page: i32,
    ) -> Result<Page<Self::Item>, SyncError>;
    fn item_id(&self, item: &Self::Item) -> i64;
    /// Validate and upsert one unit. Implementations record their own
    /// validation metrics and return `Permanent` for rejected units.
    async fn apply(&self, ctx: &PhaseServices, item: &Self::Item) -> Result<(), SyncError>;
}

/// A phase whose units are external ids read back from our own store
/// (ascending), each expanded into per-entity fetch + upsert work.
#[async_trait]
pub trait KeyedUnits: Send + Sync {
    fn phase(&self) -> SyncPhase;
    fn entity_type(&self) -> &'static str;
    fn batch_size(&self) -> i64 {
        100
    }
    /// Next batch of unit ids strictly greater than `after`, ascending.
    async fn unit_ids(
        &self,
        ctx: &PhaseServices,
        after: Option<i64>,
    ) -> Result<Vec<i64>, SyncError>;
    /// Fetch + validate + upsert one unit.
    async fn process(&self, ctx: &PhaseServices, id: i64) -> Result<(), SyncError>;
}

/// Demote a unit-level error to a ledger entry; cancellation and fatal
/// errors propagate. This is the blast-radius boundary.
async fn skip_or_escalate(
    ctx: &PhaseServices,
    phase: SyncPhase,
    unit: UnitRef,
    err: SyncError,
) -> Result<(), SyncError> {
    match err {
        e @ SyncError::Cancelled(_) | e @ SyncError::Fatal(_) => Err(e),
        e => {
            ctx.ledger
                .record_skip(phase, unit, e.code(), &e.to_string())
                .await?;
            Ok(())
        }
    }
}

fn span_progress(span: (i16, i16), done: i32, total: i32) -> i16 {
    if total <= 0 {
        return span.1;
    }
    let width = (span.1 - span.0) as i32;
    span.0 + ((width * done.clamp(0, total)) / total) as i16
}

/// Drive a paged-listing phase from `cp.current_batch` to the last page.
pub async fn drive_paged<P: PagedUnits + ?Sized>(
    p: &P,
    ctx: &PhaseServices,
    cp: &mut Checkpoint,
) -> Result<(), SyncError> {
    let label = p.phase().label();
    let mut page = cp.current_batch.max(0);
    let mut known_total: Option<i32> = None;
    let mut since_save = 0usize;

    loop {
        ctx.cancel.check()?;

        let fetched = ctx
            .retry
            .run(&ctx.cancel, |_| p.fetch_page(ctx, page))
            .await;
        let listing = match fetched {
            Ok(listing) => listing,
            Err(err) => {
                skip_or_escalate(ctx, p.phase(), UnitRef::Page(page), err).await?;
                match known_total {
                    // Extent already known: move past the bad page.
                    Some(total) if page + 1 < total => {
                        page += 1;
                        cp.current_batch = page;
                        continue;
                    }
                    Some(_) => break,
                    // Extent unknown: we cannot enumerate further pages, so
                    // the phase ends here; the ledger row is the record of
                    // the hole.
                    None => break,
                }
            }
        };
        known_total = Some(listing.total_pages);

        for item in &listing.items {
            ctx.cancel.check()?;
            let id = p.item_id(item);
            // Committed in a previous attempt of this phase; the upsert won,
            // only the checkpoint write lost the race with a crash.
            if cp.contains(id) {
                continue;
            }
            let unit = UnitRef::Entity {
                kind: p.entity_type(),
                id,
            };
            let applied = ctx.retry.run(&ctx.cancel, |_| p.apply(ctx, item)).await;
            match applied {
                Ok(()) => {
                    cp.mark_processed(id);
                    since_save += 1;
                    if since_save >= ctx.checkpoint_every {
                        ctx.checkpoints.save(cp, label).await?;
                        since_save = 0;
                    }
                }
                Err(err) => skip_or_escalate(ctx, p.phase(), unit, err).await?,
            }
        }

        cp.current_batch = page + 1;
        cp.set_progress(span_progress(
            ctx.progress_span,
            page + 1,
            listing.total_pages,
        ));
        ctx.checkpoints.save(cp, label).await?;
        since_save = 0;

        if listing.is_last() {
            break;
        }
        page += 1;
    }
    Ok(())
}

/// Drive a keyed phase: batches of ids from our store, one unit each.
pub async fn drive_keyed<K: KeyedUnits + ?Sized>(
    k: &K,
    ctx: &PhaseServices,
    cp: &mut Checkpoint,
) -> Result<(), SyncError> {
    let label = k.phase().label();
    // Scan cursor runs ahead of the committed cursor so a unit that fails
    // permanently at the end of a batch cannot wedge the phase in a loop.
    let mut scan_after = cp.last_processed_id;
    let mut since_save = 0usize;

    loop {
        ctx.cancel.check()?;
        let ids = k.unit_ids(ctx, scan_after).await?;
        let Some(&last) = ids.last() else {
            break;
        };
        scan_after = Some(last);

        for id in ids {
            ctx.cancel.check()?;
            if cp.contains(id) {
                continue;
            }
            let unit = UnitRef::Entity {
                kind: k.entity_type(),
                id,
            };
            let outcome = ctx.retry.run(&ctx.cancel, |_| k.process(ctx, id)).await;
            match outcome {
                Ok(()) => {
                    cp.mark_processed(id);
                    since_save += 1;
                    if since_save >= ctx.checkpoint_every {
                        ctx.checkpoints.save(cp, label).await?;
                        since_save = 0;
                    }
                }
                Err(err) => skip_or_escalate(ctx, k.phase(), unit, err).await?,
            }
        }

        cp.current_batch += 1;
        ctx.checkpoints.save(cp, label).await?;
        since_save = 0;
    }
    Ok(())
}

/// Locate one item in a paged listing by id; used by retry for listing
/// phases, where the portal has no single-entity endpoint.
pub async fn find_in_listing<P: PagedUnits + ?Sized>(
    p: &P,
    ctx: &PhaseServices,
    id: i64,
) -> Result<Option<P::Item>, SyncError> {
    let mut page = 0;
    loop {
        ctx.cancel.check()?;
        let listing = ctx
            .retry
            .run(&ctx.cancel, |_| p.fetch_page(ctx, page))
            .await?;
        if let Some(item) = listing.items.into_iter().find(|i| p.item_id(i) == id) {
            return Ok(Some(item));
        }
        if page + 1 >= listing.total_pages {
            return Ok(None);
        }
        page += 1;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-memory fakes shared by driver and orchestrator tests.

    use super::*;
    use crate::scrape::{
        ChiefJudgeRecord, ClubMemberRecord, ClubRecord, GameRecord, GameStatsRecord, JudgeRecord,
        PlayerRecord, PlayerTournamentRecord, PlayerYearStatsRecord,
    };
    use std::sync::Mutex;

    /// Records every save; pretends persistence always works.
    #[derive(Default)]
    pub struct MemCheckpoints {
        pub saves: Mutex<Vec<Checkpoint>>,
    }

    #[async_trait]
    impl CheckpointSink for MemCheckpoints {
        async fn save(&self, cp: &Checkpoint, _op: &str) -> Result<()> {
            self.saves.lock().unwrap().push(cp.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemLedger {
        pub skips: Mutex<Vec<(SyncPhase, UnitRef, String)>>,
    }

    #[async_trait]
    impl SkipSink for MemLedger {
        async fn record_skip(
            &self,
            phase: SyncPhase,
            unit: UnitRef,
            error_code: &str,
            _error_message: &str,
        ) -> Result<i64> {
            let mut skips = self.skips.lock().unwrap();
            skips.push((phase, unit, error_code.to_string()));
            Ok(skips.len() as i64)
        }
    }

    /// A source that panics on every call; phases under test override what
    /// they need via the driver traits instead.
    pub struct NoSource;

    #[async_trait]
    impl SiteSource for NoSource {
        async fn clubs_page(&self, _page: i32) -> Result<Page<ClubRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn player_ids_page(&self, _page: i32) -> Result<Page<i64>, SyncError> {
            unimplemented!("test source")
        }
        async fn player(&self, _id: i64) -> Result<PlayerRecord, SyncError> {
            unimplemented!("test source")
        }
        async fn club_members(&self, _id: i64) -> Result<Vec<ClubMemberRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn player_year_stats(
            &self,
            _id: i64,
        ) -> Result<Vec<PlayerYearStatsRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn tournaments_page(&self, _page: i32) -> Result<Page<TournamentRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn tournament_chief_judge(
            &self,
            _id: i64,
        ) -> Result<Option<ChiefJudgeRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn player_tournament_history(
            &self,
            _id: i64,
        ) -> Result<Vec<PlayerTournamentRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn judges_page(&self, _page: i32) -> Result<Page<JudgeRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn games_page(&self, _t: i64, _page: i32) -> Result<Page<GameRecord>, SyncError> {
            unimplemented!("test source")
        }
        async fn game_statistics(&self, _id: i64) -> Result<Option<GameStatsRecord>, SyncError> {
            unimplemented!("test source")
        }
    }

    use crate::scrape::TournamentRecord;

    pub fn services() -> (PhaseServices, Arc<MemCheckpoints>, Arc<MemLedger>) {
        let checkpoints = Arc::new(MemCheckpoints::default());
        let ledger = Arc::new(MemLedger::default());
        let db = Db {
            // Lazy pool: never actually connects in these tests.
            pool: sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://test@localhost/test")
                .expect("lazy pool"),
        };
        let ctx = PhaseServices {
            db,
            source: Arc::new(NoSource),
            checkpoints: checkpoints.clone(),
            ledger: ledger.clone(),
            metrics: Arc::new(ValidationMetrics::default()),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
            cancel: CancelHandle::new(),
            checkpoint_every: 2,
            progress_span: (0, 10),
        };
        (ctx, checkpoints, ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::sync::cancel::CancelReason;
    use crate::sync::error::{EC_NOT_FOUND, EC_VALIDATION};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Three pages of ids; configurable failures.
    struct FakeListing {
        pages: Vec<Vec<i64>>,
        fail_apply: HashSet<i64>,
        fail_page: Option<i32>,
        applied: Mutex<Vec<i64>>,
        cancel_after: Option<usize>,
        cancel: CancelHandle,
    }

    impl FakeListing {
        fn new(pages: Vec<Vec<i64>>, cancel: CancelHandle) -> Self {
            Self {
                pages,
                fail_apply: HashSet::new(),
                fail_page: None,
                applied: Mutex::new(Vec::new()),
                cancel_after: None,
                cancel,
            }
        }
    }

    #[async_trait]
    impl PagedUnits for FakeListing {
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
            if Some(page) == self.fail_page {
                return Err(SyncError::permanent(EC_NOT_FOUND, "listing page missing"));
            }
            let items = self
                .pages
                .get(page as usize)
                .cloned()
                .unwrap_or_default();
            Ok(Page {
                number: page,
                total_pages: self.pages.len() as i32,
                items,
            })
        }
        fn item_id(&self, item: &i64) -> i64 {
            *item
        }
        async fn apply(&self, _ctx: &PhaseServices, item: &i64) -> Result<(), SyncError> {
            if self.fail_apply.contains(item) {
                return Err(SyncError::permanent(EC_VALIDATION, "bad unit"));
            }
            let mut applied = self.applied.lock().unwrap();
            applied.push(*item);
            if let Some(n) = self.cancel_after {
                if applied.len() == n {
                    self.cancel.cancel(CancelReason::UserRequested);
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn paged_driver_processes_all_pages_in_order() {
        let (ctx, saves, ledger) = services();
        let fake = FakeListing::new(vec![vec![1, 2], vec![3, 4], vec![5]], ctx.cancel.clone());
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);

        drive_paged(&fake, &ctx, &mut cp).await.unwrap();

        assert_eq!(*fake.applied.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(cp.processed_ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(cp.current_batch, 3);
        assert_eq!(cp.progress, 10); // end of span
        assert!(ledger.skips.lock().unwrap().is_empty());
        assert!(!saves.saves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn paged_driver_skips_bad_unit_and_continues() {
        let (ctx, _saves, ledger) = services();
        let mut fake = FakeListing::new(vec![vec![1, 2, 3]], ctx.cancel.clone());
        fake.fail_apply.insert(2);
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);

        drive_paged(&fake, &ctx, &mut cp).await.unwrap();

        assert_eq!(*fake.applied.lock().unwrap(), vec![1, 3]);
        assert_eq!(cp.processed_ids, vec![1, 3]);
        let skips = ledger.skips.lock().unwrap();
        assert_eq!(skips.len(), 1);
        assert_eq!(
            skips[0].1,
            UnitRef::Entity {
                kind: "club",
                id: 2
            }
        );
        assert_eq!(skips[0].2, EC_VALIDATION);
    }

    #[tokio::test]
    async fn paged_driver_records_page_skip_and_moves_on() {
        let (ctx, _saves, ledger) = services();
        let mut fake = FakeListing::new(vec![vec![1], vec![2], vec![3]], ctx.cancel.clone());
        fake.fail_page = Some(1);
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);

        drive_paged(&fake, &ctx, &mut cp).await.unwrap();

        // Pages 0 and 2 processed; page 1 in the ledger.
        assert_eq!(*fake.applied.lock().unwrap(), vec![1, 3]);
        let skips = ledger.skips.lock().unwrap();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].1, UnitRef::Page(1));
    }

    #[tokio::test]
    async fn paged_driver_resumes_without_reprocessing() {
        let (ctx, _saves, _ledger) = services();
        let fake = FakeListing::new(vec![vec![1, 2], vec![3, 4]], ctx.cancel.clone());
        // Simulate a run interrupted mid page 0: ids 1,2 committed.
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);
        cp.mark_processed(1);
        cp.mark_processed(2);
        cp.current_batch = 0;

        drive_paged(&fake, &ctx, &mut cp).await.unwrap();

        // Only the unseen ids are applied on resume.
        assert_eq!(*fake.applied.lock().unwrap(), vec![3, 4]);
        assert_eq!(cp.processed_ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn paged_driver_stops_at_safe_point_on_cancel() {
        let (ctx, saves, _ledger) = services();
        let mut fake = FakeListing::new(vec![vec![1, 2], vec![3, 4], vec![5]], ctx.cancel.clone());
        fake.cancel_after = Some(3);
        let mut cp = Checkpoint::start_of(SyncPhase::Clubs);

        let err = drive_paged(&fake, &ctx, &mut cp).await.unwrap_err();
        assert!(err.is_cancelled());

        // Unit 3 committed before the signal was observed; nothing after.
        assert_eq!(*fake.applied.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(cp.processed_ids, vec![1, 2, 3]);
        assert_eq!(cp.current_phase, SyncPhase::Clubs);
        // The last save reflects the completed prefix only.
        let last = saves.saves.lock().unwrap().last().cloned().unwrap();
        assert!(last.processed_ids.iter().all(|id| *id <= 3));
    }

    struct FakeKeyed {
        ids: Vec<i64>,
        fail: HashSet<i64>,
        processed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl KeyedUnits for FakeKeyed {
        fn phase(&self) -> SyncPhase {
            SyncPhase::PlayerYearStats
        }
        fn entity_type(&self) -> &'static str {
            "player"
        }
        fn batch_size(&self) -> i64 {
            2
        }
        async fn unit_ids(
            &self,
            _ctx: &PhaseServices,
            after: Option<i64>,
        ) -> Result<Vec<i64>, SyncError> {
            let after = after.unwrap_or(i64::MIN);
            Ok(self
                .ids
                .iter()
                .copied()
                .filter(|id| *id > after)
                .take(self.batch_size() as usize)
                .collect())
        }
        async fn process(&self, _ctx: &PhaseServices, id: i64) -> Result<(), SyncError> {
            if self.fail.contains(&id) {
                return Err(SyncError::permanent(EC_NOT_FOUND, "player page gone"));
            }
            self.processed.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn keyed_driver_walks_batches_and_does_not_wedge_on_trailing_failure() {
        let (ctx, _saves, ledger) = services();
        let fake = FakeKeyed {
            ids: vec![10, 20, 30, 40],
            // 40 is the last id of the last batch; a failing tail must not
            // make the driver re-fetch the same batch forever.
            fail: [40].into_iter().collect(),
            processed: Mutex::new(Vec::new()),
        };
        let mut cp = Checkpoint::start_of(SyncPhase::PlayerYearStats);

        drive_keyed(&fake, &ctx, &mut cp).await.unwrap();

        assert_eq!(*fake.processed.lock().unwrap(), vec![10, 20, 30]);
        assert_eq!(cp.last_processed_id, Some(30));
        assert_eq!(ledger.skips.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keyed_driver_resumes_after_cursor() {
        let (ctx, _saves, _ledger) = services();
        let fake = FakeKeyed {
            ids: vec![10, 20, 30, 40],
            fail: HashSet::new(),
            processed: Mutex::new(Vec::new()),
        };
        let mut cp = Checkpoint::start_of(SyncPhase::PlayerYearStats);
        cp.mark_processed(10);
        cp.mark_processed(20);

        drive_keyed(&fake, &ctx, &mut cp).await.unwrap();

        assert_eq!(*fake.processed.lock().unwrap(), vec![30, 40]);
    }
}
