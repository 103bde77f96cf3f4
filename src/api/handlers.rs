// HTTP request handlers for the sync control API

use crate::api::models::*;
use crate::api::registry::RunRegistry;
use crate::scrape::SiteSource;
use crate::sync::cancel::CancelReason;
use crate::sync::orchestrator::{self, Launch, RetryLaunch, StartOptions};
use crate::sync::runs::RunStore;
use crate::sync::skipped::{SkipStatus, SkippedLedger};
use crate::sync::SyncPhase;
use crate::util::db::Db;
use actix_web::http::header;
use actix_web::{web, HttpResponse, Result};
use std::sync::Arc;
use std::time::SystemTime;

fn internal(context: &str, e: anyhow::Error) -> HttpResponse {
    tracing::error!(error = %e, "{context}");
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error(format!("{context}: {e}")))
}

/// Health check endpoint
pub async fn health_check(db: web::Data<Db>) -> Result<HttpResponse> {
    let db_status = match sqlx::query_scalar::<_, bool>("SELECT true")
        .fetch_one(&db.pool)
        .await
    {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    let uptime = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let response = ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        database: db_status.to_string(),
        uptime_seconds: uptime,
    });

    Ok(HttpResponse::Ok().json(response))
}

/// Start an import run. 202 on success; 409 with the live status when an
/// import is already active anywhere.
pub async fn start_sync(
    payload: Option<web::Json<StartSyncRequest>>,
    db: web::Data<Db>,
    source: web::Data<Arc<dyn SiteSource>>,
    registry: web::Data<RunRegistry>,
) -> Result<HttpResponse> {
    let opts = StartOptions {
        force_restart: payload.map(|p| p.force_restart).unwrap_or(false),
    };
    tracing::info!(force_restart = opts.force_restart, "sync start requested");

    match orchestrator::launch(db.get_ref().clone(), source.get_ref().clone(), opts).await {
        Ok(Launch::Started(handle)) => {
            let body = StartSyncResponse {
                run_id: handle.run_id,
                estimated_duration_secs: handle.estimated_duration_secs,
                resuming_from: handle.resuming_from.map(|p| p.as_str()),
            };
            registry.register(handle).await;
            Ok(HttpResponse::Accepted().json(ApiResponse::success(body)))
        }
        Ok(Launch::Busy) => {
            let runs = RunStore::new(db.get_ref().clone());
            let live = runs.live_status().await.ok().flatten();
            let mut response =
                ApiResponse::success(live.map(SyncStatusResponse::from).unwrap_or_else(
                    SyncStatusResponse::idle,
                ));
            response.success = false;
            response.error = Some("an import is already running".to_string());
            Ok(HttpResponse::Conflict().json(response))
        }
        Err(e) => Ok(internal("failed to start import", e)),
    }
}

/// Live progress. Never cached: operators poll this.
pub async fn sync_status(db: web::Data<Db>) -> Result<HttpResponse> {
    let runs = RunStore::new(db.get_ref().clone());
    match runs.live_status().await {
        Ok(live) => {
            let mut body = live
                .map(SyncStatusResponse::from)
                .unwrap_or_else(SyncStatusResponse::idle);
            // Summary counts are best effort.
            match runs.entity_counts().await {
                Ok(counts) => body = body.with_summary(counts),
                Err(e) => tracing::warn!(error = %e, "entity counts unavailable"),
            }
            Ok(HttpResponse::Ok()
                .insert_header((header::CACHE_CONTROL, "no-store"))
                .json(ApiResponse::success(body)))
        }
        Err(e) => Ok(internal("failed to read sync status", e)),
    }
}

/// Request cooperative cancellation of the run this process owns.
pub async fn cancel_sync(
    db: web::Data<Db>,
    registry: web::Data<RunRegistry>,
) -> Result<HttpResponse> {
    if let Some((run_id, cancel)) = registry.active().await {
        let first = cancel.cancel(CancelReason::UserRequested);
        let runs = RunStore::new(db.get_ref().clone());
        if let Err(e) = runs.mark_cancelling(run_id).await {
            return Ok(internal("failed to record cancellation", e));
        }
        tracing::info!(%run_id, first_request = first, "cancellation requested");
        return Ok(HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "runId": run_id,
            "status": "CANCELLING",
            "message": "cancellation requested; the run stops at the next safe point"
        }))));
    }

    // Not ours. If the database says a run is live, it belongs to another
    // replica and only that replica can cancel it.
    let runs = RunStore::new(db.get_ref().clone());
    match runs.active_run().await {
        Ok(Some(record)) => Ok(HttpResponse::Conflict().json(ApiResponse::<()>::error(format!(
            "run {} was started by another process and must be cancelled there",
            record.run_id
        )))),
        Ok(None) => Ok(HttpResponse::NotFound()
            .json(ApiResponse::<()>::error("no import is currently running"))),
        Err(e) => Ok(internal("failed to look up active run", e)),
    }
}

/// List ledger entries, optionally filtered by phase and status.
pub async fn list_skipped(
    query: web::Query<SkippedQuery>,
    db: web::Data<Db>,
) -> Result<HttpResponse> {
    let ledger = SkippedLedger::new(db.get_ref().clone());

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match SkipStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return Ok(HttpResponse::BadRequest()
                    .json(ApiResponse::<()>::error(format!("unknown status {raw:?}"))))
            }
        },
    };

    let result = match query.phase.as_deref() {
        Some(raw) => match SyncPhase::parse(raw) {
            Some(phase) => ledger.get_by_phase(phase, status).await,
            None => {
                return Ok(HttpResponse::BadRequest()
                    .json(ApiResponse::<()>::error(format!("unknown phase {raw:?}"))))
            }
        },
        None => ledger.get_all().await.map(|rows| match status {
            Some(status) => rows
                .into_iter()
                .filter(|r| r.status == status.as_str())
                .collect(),
            None => rows,
        }),
    };

    match result {
        Ok(rows) => Ok(HttpResponse::Ok().json(ApiResponse::success(rows))),
        Err(e) => Ok(internal("failed to list skipped entities", e)),
    }
}

/// Ledger summary plus the entries an operator could retry, optionally
/// narrowed to one phase.
pub async fn retry_overview(
    query: web::Query<SkippedQuery>,
    db: web::Data<Db>,
) -> Result<HttpResponse> {
    let ledger = SkippedLedger::new(db.get_ref().clone());

    let entities = match query.phase.as_deref() {
        Some(raw) => match SyncPhase::parse(raw) {
            Some(phase) => ledger.get_by_phase(phase, None).await,
            None => {
                return Ok(HttpResponse::BadRequest()
                    .json(ApiResponse::<()>::error(format!("unknown phase {raw:?}"))))
            }
        },
        None => ledger.get_all().await,
    };
    let entities = match entities {
        Ok(rows) => rows,
        Err(e) => return Ok(internal("failed to list skipped entities", e)),
    };
    let summary = match ledger.summary().await {
        Ok(rows) => rows,
        Err(e) => return Ok(internal("failed to summarize skipped entities", e)),
    };

    Ok(HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "summary": summary,
        "entities": entities,
    }))))
}

/// Retry specific ledger entries, addressed by ledger id, external entity
/// id, or page number. 409 while an import is running.
pub async fn retry_skipped(
    payload: web::Json<RetryRequest>,
    db: web::Data<Db>,
    source: web::Data<Arc<dyn SiteSource>>,
) -> Result<HttpResponse> {
    if payload.is_empty() {
        return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error(
            "at least one of ids, entityIds or pageNumbers is required",
        )));
    }

    let phase = match payload.phase.as_deref() {
        None => None,
        Some(raw) => match SyncPhase::parse(raw) {
            Some(phase) => Some(phase),
            None => {
                return Ok(HttpResponse::BadRequest()
                    .json(ApiResponse::<()>::error(format!("unknown phase {raw:?}"))))
            }
        },
    };
    if !payload.page_numbers.is_empty() && phase.is_none() {
        return Ok(HttpResponse::BadRequest()
            .json(ApiResponse::<()>::error("pageNumbers requires phase")));
    }

    let ledger = SkippedLedger::new(db.get_ref().clone());
    let mut ids = payload.ids.clone();
    for entity_id in &payload.entity_ids {
        let rows = match ledger.get_by_player(*entity_id).await {
            Ok(rows) => rows,
            Err(e) => return Ok(internal("failed to resolve entity ids", e)),
        };
        ids.extend(
            rows.iter()
                .filter(|r| phase.map_or(true, |p| r.phase == p.as_str()))
                .map(|r| r.id),
        );
    }
    if let Some(phase) = phase {
        for page in &payload.page_numbers {
            match ledger.get_by_page(phase, *page).await {
                Ok(Some(row)) => ids.push(row.id),
                Ok(None) => {}
                Err(e) => return Ok(internal("failed to resolve page numbers", e)),
            }
        }
    }
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error(
            "no ledger entries match the given selectors",
        )));
    }
    tracing::info!(?ids, "retry of skipped units requested");

    match orchestrator::retry_skipped(db.get_ref().clone(), source.get_ref().clone(), ids).await {
        Ok(RetryLaunch::Done(report)) => Ok(HttpResponse::Ok().json(ApiResponse::success(report))),
        Ok(RetryLaunch::Busy) => Ok(HttpResponse::Conflict().json(ApiResponse::<()>::error(
            "an import is running; retry skipped entities after it finishes",
        ))),
        Err(e) => Ok(internal("failed to retry skipped entities", e)),
    }
}
