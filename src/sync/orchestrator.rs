//! Run lifecycle: lock, resume, phase sequencing, watchdog, finalization.
//!
//! [`launch`] is the single entry point for starting an import, shared by
//! the HTTP API and the CLI runner. It acquires the cross-process lock,
//! opens a run record and spawns the pipeline; the returned [`RunHandle`]
//! is how the caller cancels or awaits the run.

use crate::scrape::SiteSource;
use crate::sync::cancel::{CancelHandle, CancelReason};
use crate::sync::checkpoint::{Checkpoint, CheckpointStore};
use crate::sync::error::SyncError;
use crate::sync::lock::SyncLock;
use crate::sync::metrics::ValidationMetrics;
use crate::sync::phase::{Phase, PhaseServices};
use crate::sync::phases::build_phases;
use crate::sync::retry::RetryPolicy;
use crate::sync::runs::{RunOutcome, RunStatus, RunStore};
use crate::sync::skipped::SkippedLedger;
use crate::sync::SyncPhase;
use crate::util::db::Db;
use crate::util::env::env_parse;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// First-run fallback before any completed run exists to average over.
const DEFAULT_ESTIMATE_SECS: i64 = 4 * 3600;

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Discard any existing checkpoint and start from the first phase.
    pub force_restart: bool,
}

/// A launched run, owned by whoever started it.
pub struct RunHandle {
    pub run_id: Uuid,
    pub cancel: CancelHandle,
    pub join: JoinHandle<RunStatus>,
    pub estimated_duration_secs: i64,
    /// Phase the run resumed from, None for a fresh start.
    pub resuming_from: Option<SyncPhase>,
}

pub enum Launch {
    /// Another process (or this one) already holds the import lock.
    Busy,
    Started(RunHandle),
}

/// Acquire the lock and spawn a run. `Launch::Busy` means some import is
/// already active somewhere; nothing was changed.
pub async fn launch(db: Db, source: Arc<dyn SiteSource>, opts: StartOptions) -> Result<Launch> {
    let mut lock = SyncLock::new();
    if !lock.acquire(&db).await? {
        return Ok(Launch::Busy);
    }

    let runs = RunStore::new(db.clone());
    // Holding the lock proves no live run owns these rows.
    runs.reconcile_stale().await?;

    let checkpoints = CheckpointStore::new(db.clone());
    if opts.force_restart {
        checkpoints.clear().await?;
    }
    let resuming_from = checkpoints.load().await?.map(|cp| cp.current_phase);

    let estimated_duration_secs = runs
        .estimated_duration_secs()
        .await?
        .unwrap_or(DEFAULT_ESTIMATE_SECS);

    let run_id = Uuid::new_v4();
    runs.create(run_id, estimated_duration_secs).await?;
    tracing::info!(
        %run_id,
        resuming_from = resuming_from.map(|p| p.as_str()),
        "import run starting"
    );

    let cancel = CancelHandle::new();
    let orchestrator = Orchestrator::from_env(db, source, run_id, cancel.clone());
    let join = tokio::spawn(orchestrator.run(lock));

    Ok(Launch::Started(RunHandle {
        run_id,
        cancel,
        join,
        estimated_duration_secs,
        resuming_from,
    }))
}

pub struct Orchestrator {
    db: Db,
    source: Arc<dyn SiteSource>,
    run_id: Uuid,
    cancel: CancelHandle,
    retry: RetryPolicy,
    checkpoint_every: usize,
    max_run_duration: Duration,
}

impl Orchestrator {
    pub fn from_env(db: Db, source: Arc<dyn SiteSource>, run_id: Uuid, cancel: CancelHandle) -> Self {
        Self {
            db,
            source,
            run_id,
            cancel,
            retry: RetryPolicy::from_env(),
            checkpoint_every: env_parse("SYNC_CHECKPOINT_EVERY", 25usize).max(1),
            max_run_duration: Duration::from_secs(
                (env_parse("SYNC_MAX_HOURS", 12u64).max(1)) * 3600,
            ),
        }
    }

    /// Run the pipeline to a terminal status. Consumes the lock and releases
    /// it on every path.
    pub async fn run(self, mut lock: SyncLock) -> RunStatus {
        let runs = RunStore::new(self.db.clone());
        let ledger = SkippedLedger::new(self.db.clone());
        let metrics = Arc::new(ValidationMetrics::default());
        let checkpoints =
            Arc::new(CheckpointStore::new(self.db.clone()).with_metrics(metrics.clone()));

        let watchdog = self.spawn_watchdog();

        let mut cp = match checkpoints.load().await {
            Ok(Some(cp)) => {
                tracing::info!(phase = %cp.current_phase, batch = cp.current_batch, "resuming from checkpoint");
                cp
            }
            Ok(None) => Checkpoint::start_of(SyncPhase::ORDER[0]),
            Err(e) => {
                tracing::error!(error = %e, "checkpoint load failed; aborting run");
                let outcome = RunOutcome::Failed {
                    code: crate::sync::error::EC_FATAL.to_string(),
                    message: format!("checkpoint load failed: {e:#}"),
                };
                let status = self.finalize(&runs, &ledger, &metrics, &outcome).await;
                watchdog.abort();
                lock.release().await;
                return status;
            }
        };

        let ctx = PhaseServices {
            db: self.db.clone(),
            source: self.source.clone(),
            checkpoints: checkpoints.clone(),
            ledger: Arc::new(ledger.clone()),
            metrics: metrics.clone(),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
            checkpoint_every: self.checkpoint_every,
            progress_span: (0, 100),
        };

        let result = run_phases(&build_phases(), &ctx, &mut cp).await;

        let (outcome, clear_checkpoint) = match result {
            Ok(()) => (RunOutcome::Completed, true),
            Err(SyncError::Cancelled(reason)) => {
                tracing::warn!(%reason, "run cancelled at a safe point");
                (RunOutcome::Cancelled(reason), false)
            }
            Err(e) => {
                tracing::error!(error = %e, code = e.code(), "run failed");
                (
                    RunOutcome::Failed {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                    false,
                )
            }
        };

        if clear_checkpoint {
            if let Err(e) = checkpoints.clear().await {
                tracing::error!(error = %e, "failed to clear checkpoint after completion");
            }
        } else if let Err(e) = checkpoints.save(&cp, cp.current_phase.label()).await {
            // The periodic saves inside the drivers bound what this loses.
            tracing::error!(error = %e, "failed to persist final checkpoint");
        }

        let status = self.finalize(&runs, &ledger, &metrics, &outcome).await;
        watchdog.abort();
        lock.release().await;
        tracing::info!(run_id = %self.run_id, %status, "import run finished");
        status
    }

    fn spawn_watchdog(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let ceiling = self.max_run_duration;
        tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            if cancel.cancel(CancelReason::Timeout) {
                tracing::warn!(
                    ceiling_secs = ceiling.as_secs(),
                    "maximum run duration exceeded; cancelling"
                );
            }
        })
    }

    async fn finalize(
        &self,
        runs: &RunStore,
        ledger: &SkippedLedger,
        metrics: &ValidationMetrics,
        outcome: &RunOutcome,
    ) -> RunStatus {
        let summary = self.build_summary(runs, ledger, metrics).await;
        if let Err(e) = runs.record_validation(self.run_id, &metrics.snapshot()).await {
            tracing::warn!(run_id = %self.run_id, error = %e, "final counter write failed");
        }
        if let Err(e) = runs.finalize(self.run_id, outcome, summary).await {
            tracing::error!(run_id = %self.run_id, error = %e, "failed to finalize run record");
            return RunStatus::Failed;
        }
        match outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Cancelled(_) => RunStatus::Cancelled,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    /// Best effort: a summary query failing must not mask the run outcome.
    async fn build_summary(
        &self,
        runs: &RunStore,
        ledger: &SkippedLedger,
        metrics: &ValidationMetrics,
    ) -> serde_json::Value {
        let validation = metrics.snapshot();
        let skipped = match ledger.summary().await {
            Ok(rows) => serde_json::to_value(rows).unwrap_or(serde_json::Value::Null),
            Err(e) => {
                tracing::warn!(error = %e, "skip summary unavailable");
                serde_json::Value::Null
            }
        };
        let open_pages = match ledger.open_page_skips().await {
            Ok(rows) => serde_json::to_value(rows).unwrap_or(serde_json::Value::Null),
            Err(e) => {
                tracing::warn!(error = %e, "open page skips unavailable");
                serde_json::Value::Null
            }
        };
        let entities = match runs.entity_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "entity counts unavailable");
                serde_json::Value::Null
            }
        };
        serde_json::json!({
            "validation": validation,
            "skipped": skipped,
            "open_page_skips": open_pages,
            "entities": entities,
        })
    }
}

/// Outcome of an operator-driven retry of ledger entries.
#[derive(Debug, Default, serde::Serialize)]
pub struct RetryReport {
    pub completed: Vec<i64>,
    pub failed: Vec<RetryFailure>,
    pub unknown_ids: Vec<i64>,
}

#[derive(Debug, serde::Serialize)]
pub struct RetryFailure {
    pub id: i64,
    pub error_code: String,
    pub error_message: String,
}

pub enum RetryLaunch {
    Busy,
    Done(RetryReport),
}

/// Re-run specific ledger entries outside a full pipeline run. Takes the
/// import lock for its duration so it cannot interleave with a live run;
/// `Busy` means one is active.
pub async fn retry_skipped(
    db: Db,
    source: Arc<dyn SiteSource>,
    ids: Vec<i64>,
) -> Result<RetryLaunch> {
    let phases = build_phases();
    let db_for_ctx = db.clone();
    let ledger_for_ctx = SkippedLedger::new(db.clone());

    let outcome = SyncLock::with_lock(&db, || async move {
        let ctx = PhaseServices {
            db: db_for_ctx.clone(),
            source,
            checkpoints: Arc::new(CheckpointStore::new(db_for_ctx.clone())),
            ledger: Arc::new(ledger_for_ctx.clone()),
            metrics: Arc::new(ValidationMetrics::default()),
            retry: RetryPolicy::from_env(),
            cancel: CancelHandle::new(),
            checkpoint_every: usize::MAX,
            progress_span: (0, 100),
        };

        let mut report = RetryReport::default();
        let entries = ledger_for_ctx.get_by_ids(&ids).await?;
        let mut found: Vec<i64> = entries.iter().map(|e| e.id).collect();
        found.sort_unstable();
        report.unknown_ids = ids
            .iter()
            .copied()
            .filter(|id| found.binary_search(id).is_err())
            .collect();

        for entry in &entries {
            let Some(phase_id) = SyncPhase::parse(&entry.phase) else {
                report.failed.push(RetryFailure {
                    id: entry.id,
                    error_code: crate::sync::error::EC_VALIDATION.to_string(),
                    error_message: format!("ledger row names unknown phase {:?}", entry.phase),
                });
                continue;
            };
            let phase = &phases[phase_id.index()];
            ledger_for_ctx.mark_retrying(entry.id).await?;
            match phase.retry_unit(&ctx, entry).await {
                Ok(()) => {
                    ledger_for_ctx.mark_completed(entry.id).await?;
                    tracing::info!(ledger_id = entry.id, phase = %phase_id, "skipped unit recovered");
                    report.completed.push(entry.id);
                }
                Err(e) => {
                    ledger_for_ctx.mark_failed(entry.id, &e.to_string()).await?;
                    tracing::warn!(ledger_id = entry.id, phase = %phase_id, error = %e, "retry failed");
                    report.failed.push(RetryFailure {
                        id: entry.id,
                        error_code: e.code().to_string(),
                        error_message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    })
    .await?;

    Ok(match outcome {
        Some(report) => RetryLaunch::Done(report),
        None => RetryLaunch::Busy,
    })
}

/// Progress window for phase `i` of `total` on the 0-100 scale.
fn phase_span(i: usize, total: usize) -> (i16, i16) {
    (
        ((i * 100) / total) as i16,
        (((i + 1) * 100) / total) as i16,
    )
}

/// Execute `phases` in order starting from the checkpoint's phase. The
/// phase list must be in canonical order.
pub async fn run_phases(
    phases: &[Arc<dyn Phase>],
    ctx: &PhaseServices,
    cp: &mut Checkpoint,
) -> Result<(), SyncError> {
    let total = phases.len();
    let start = cp.current_phase.index();
    for (i, phase) in phases.iter().enumerate().skip(start) {
        if i > start {
            cp.advance_phase(phase.id());
        }
        let ctx = ctx.with_span(phase_span(i, total));
        ctx.checkpoints.save(cp, phase.id().label()).await?;
        tracing::info!(phase = %phase.id(), "phase starting");
        phase.execute(&ctx, cp).await?;
        cp.set_progress(ctx.progress_span.1);
        tracing::info!(phase = %phase.id(), progress = cp.progress, "phase complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::checkpoint::Checkpoint;
    use crate::sync::phase::testutil::services;
    use crate::sync::skipped::SkippedEntity;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedPhase {
        id: SyncPhase,
        fail_with: Option<fn() -> SyncError>,
        log: Arc<Mutex<Vec<SyncPhase>>>,
    }

    #[async_trait]
    impl Phase for ScriptedPhase {
        fn id(&self) -> SyncPhase {
            self.id
        }

        async fn execute(
            &self,
            _ctx: &PhaseServices,
            cp: &mut Checkpoint,
        ) -> Result<(), SyncError> {
            self.log.lock().unwrap().push(self.id);
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            cp.mark_processed(self.id.index() as i64 + 1);
            Ok(())
        }

        async fn retry_unit(
            &self,
            _ctx: &PhaseServices,
            _entry: &SkippedEntity,
        ) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn scripted(
        log: &Arc<Mutex<Vec<SyncPhase>>>,
        fail_at: Option<SyncPhase>,
    ) -> Vec<Arc<dyn Phase>> {
        SyncPhase::ORDER
            .iter()
            .map(|&id| {
                Arc::new(ScriptedPhase {
                    id,
                    fail_with: if Some(id) == fail_at {
                        Some(|| SyncError::fatal(anyhow::anyhow!("phase blew up")))
                    } else {
                        None
                    },
                    log: log.clone(),
                }) as Arc<dyn Phase>
            })
            .collect()
    }

    #[test]
    fn spans_partition_the_percent_scale() {
        let total = SyncPhase::ORDER.len();
        assert_eq!(phase_span(0, total).0, 0);
        assert_eq!(phase_span(total - 1, total).1, 100);
        for i in 1..total {
            assert_eq!(phase_span(i - 1, total).1, phase_span(i, total).0);
        }
    }

    #[tokio::test]
    async fn phases_run_in_order_from_a_fresh_checkpoint() {
        let (ctx, _saves, _ledger) = services();
        let log = Arc::new(Mutex::new(Vec::new()));
        let phases = scripted(&log, None);
        let mut cp = Checkpoint::start_of(SyncPhase::ORDER[0]);

        run_phases(&phases, &ctx, &mut cp).await.unwrap();

        assert_eq!(*log.lock().unwrap(), SyncPhase::ORDER.to_vec());
        assert_eq!(cp.current_phase, SyncPhase::Statistics);
        assert_eq!(cp.progress, 100);
    }

    #[tokio::test]
    async fn resume_skips_phases_before_the_checkpoint() {
        let (ctx, _saves, _ledger) = services();
        let log = Arc::new(Mutex::new(Vec::new()));
        let phases = scripted(&log, None);
        let mut cp = Checkpoint::start_of(SyncPhase::Tournaments);

        run_phases(&phases, &ctx, &mut cp).await.unwrap();

        let ran = log.lock().unwrap().clone();
        assert_eq!(ran.first(), Some(&SyncPhase::Tournaments));
        assert!(!ran.contains(&SyncPhase::Clubs));
        assert!(ran.contains(&SyncPhase::Statistics));
    }

    #[tokio::test]
    async fn failure_stops_the_sequence_and_keeps_the_phase() {
        let (ctx, saves, _ledger) = services();
        let log = Arc::new(Mutex::new(Vec::new()));
        let phases = scripted(&log, Some(SyncPhase::ClubMembers));
        let mut cp = Checkpoint::start_of(SyncPhase::ORDER[0]);

        let err = run_phases(&phases, &ctx, &mut cp).await.unwrap_err();
        assert!(matches!(err, SyncError::Fatal(_)));

        assert_eq!(cp.current_phase, SyncPhase::ClubMembers);
        let ran = log.lock().unwrap().clone();
        assert_eq!(
            ran,
            vec![SyncPhase::Clubs, SyncPhase::Players, SyncPhase::ClubMembers]
        );
        // The save made on entering CLUB_MEMBERS is the resume point.
        let last = saves.saves.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.current_phase, SyncPhase::ClubMembers);
    }
}
