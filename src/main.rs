use anyhow::{Context, Result};
use fedsync::api::server::ApiServer;
use fedsync::scrape::{HttpSiteSource, SiteSource};
use fedsync::util::db::Db;
use fedsync::util::env::{db_url, env_parse, init_env, preflight_check};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    fedsync::tracing::init_tracing("info,sqlx=warn")?;
    preflight_check(
        "api_server",
        &["API_SECRET", "SITE_BASE_URL"],
        &[
            "DATABASE_URL",
            "SITE_BASE_URL",
            "API_HOST",
            "API_PORT",
            "ALLOWED_ORIGINS",
            "AUTO_MIGRATE",
        ],
    )?;

    let database_url = db_url().context("resolving database url")?;
    let max_connections = env_parse("DB_MAX_CONNECTIONS", 10u32);
    let db = Db::connect(&database_url, max_connections).await?;

    let source: Arc<dyn SiteSource> = Arc::new(HttpSiteSource::from_env()?);

    ApiServer::from_env()?.run(db, source).await
}
