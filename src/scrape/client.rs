//! reqwest-backed [`SiteSource`] against the portal's export endpoints.
//!
//! Each endpoint returns JSON; HTTP outcomes are classified here so callers
//! only ever see `SyncError` variants. Retry/backoff lives with the caller,
//! not the client.

use super::{
    ChiefJudgeRecord, ClubMemberRecord, ClubRecord, GameRecord, GameStatsRecord, JudgeRecord,
    Page, PlayerRecord, PlayerTournamentRecord, PlayerYearStatsRecord, SiteSource,
    TournamentRecord,
};
use crate::sync::error::{classify_status, SyncError};
use crate::util::env::{env_parse, env_req};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

pub struct HttpSiteSource {
    http: reqwest::Client,
    base: url::Url,
}

/// Envelope the portal wraps every listing page in.
#[derive(Debug, Deserialize)]
struct PageEnvelope<T> {
    page: i32,
    total_pages: i32,
    items: Vec<T>,
}

impl HttpSiteSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fedsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base = url::Url::parse(base_url)?;
        Ok(Self { http, base })
    }

    pub fn from_env() -> Result<Self> {
        let base_url = env_req("SITE_BASE_URL")?;
        let timeout = Duration::from_secs(env_parse("SITE_TIMEOUT_SECS", 30u64));
        Self::new(&base_url, timeout)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| SyncError::fatal(anyhow::anyhow!("bad request path {path}: {e}")))?;
        let resp = self
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, url.as_str()));
        }
        Ok(resp.json::<T>().await?)
    }

    async fn get_page<T: DeserializeOwned>(&self, path: &str) -> Result<Page<T>, SyncError> {
        let env: PageEnvelope<T> = self.get_json(path).await?;
        Ok(Page {
            number: env.page,
            total_pages: env.total_pages,
            items: env.items,
        })
    }

    /// 404 on a detail endpoint means "no such record here", which some
    /// relations legitimately lack (not every tournament names a chief
    /// judge). Map it to None instead of a permanent skip.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, SyncError> {
        match self.get_json::<T>(path).await {
            Ok(v) => Ok(Some(v)),
            Err(SyncError::Permanent { ref code, .. }) if code == crate::sync::error::EC_NOT_FOUND => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SiteSource for HttpSiteSource {
    async fn clubs_page(&self, page: i32) -> Result<Page<ClubRecord>, SyncError> {
        self.get_page(&format!("export/clubs?page={page}")).await
    }

    async fn player_ids_page(&self, page: i32) -> Result<Page<i64>, SyncError> {
        self.get_page(&format!("export/players?page={page}")).await
    }

    async fn player(&self, external_id: i64) -> Result<PlayerRecord, SyncError> {
        self.get_json(&format!("export/players/{external_id}")).await
    }

    async fn club_members(
        &self,
        club_external_id: i64,
    ) -> Result<Vec<ClubMemberRecord>, SyncError> {
        self.get_json(&format!("export/clubs/{club_external_id}/members"))
            .await
    }

    async fn player_year_stats(
        &self,
        player_external_id: i64,
    ) -> Result<Vec<PlayerYearStatsRecord>, SyncError> {
        self.get_json(&format!("export/players/{player_external_id}/year-stats"))
            .await
    }

    async fn tournaments_page(&self, page: i32) -> Result<Page<TournamentRecord>, SyncError> {
        self.get_page(&format!("export/tournaments?page={page}"))
            .await
    }

    async fn tournament_chief_judge(
        &self,
        tournament_external_id: i64,
    ) -> Result<Option<ChiefJudgeRecord>, SyncError> {
        self.get_optional(&format!(
            "export/tournaments/{tournament_external_id}/chief-judge"
        ))
        .await
    }

    async fn player_tournament_history(
        &self,
        player_external_id: i64,
    ) -> Result<Vec<PlayerTournamentRecord>, SyncError> {
        self.get_json(&format!("export/players/{player_external_id}/tournaments"))
            .await
    }

    async fn judges_page(&self, page: i32) -> Result<Page<JudgeRecord>, SyncError> {
        self.get_page(&format!("export/judges?page={page}")).await
    }

    async fn games_page(
        &self,
        tournament_external_id: i64,
        page: i32,
    ) -> Result<Page<GameRecord>, SyncError> {
        self.get_page(&format!(
            "export/tournaments/{tournament_external_id}/games?page={page}"
        ))
        .await
    }

    async fn game_statistics(
        &self,
        game_external_id: i64,
    ) -> Result<Option<GameStatsRecord>, SyncError> {
        self.get_optional(&format!("export/games/{game_external_id}/statistics"))
            .await
    }
}
