// API route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        // API v1 routes (all require authentication)
        .service(
            web::scope("/api/v1/sync")
                .route("/start", web::post().to(handlers::start_sync))
                .route("/status", web::get().to(handlers::sync_status))
                .route("/cancel", web::delete().to(handlers::cancel_sync))
                .route("/skipped", web::get().to(handlers::list_skipped))
                .route("/retry", web::get().to(handlers::retry_overview))
                .route("/retry", web::post().to(handlers::retry_skipped)),
        );
}
