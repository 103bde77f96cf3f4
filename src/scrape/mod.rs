//! Interface boundary to the federation portal.
//!
//! The pipeline treats fetching as a black box behind [`SiteSource`]: given
//! a page or an external id, a source produces validated-shape records or a
//! classified error. The HTTP implementation lives in [`client`]; tests use
//! in-memory fakes.

pub mod client;

use crate::sync::error::SyncError;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub use client::HttpSiteSource;

/// One page of a listing, in the portal's stable ascending-id order.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub number: i32,
    pub total_pages: i32,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.number + 1 >= self.total_pages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClubRecord {
    pub external_id: i64,
    pub name: String,
    pub city: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub external_id: i64,
    pub full_name: String,
    pub birth_year: Option<i32>,
    pub club_external_id: Option<i64>,
    pub rating: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClubMemberRecord {
    pub club_external_id: i64,
    pub player_external_id: i64,
    pub joined_year: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerYearStatsRecord {
    pub player_external_id: i64,
    pub year: i32,
    pub games_played: i32,
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
    pub rating_start: Option<i32>,
    pub rating_end: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentRecord {
    pub external_id: i64,
    pub name: String,
    pub location: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChiefJudgeRecord {
    pub tournament_external_id: i64,
    pub judge_external_id: i64,
    pub judge_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerTournamentRecord {
    pub player_external_id: i64,
    pub tournament_external_id: i64,
    pub place: Option<i32>,
    pub score: Option<f64>,
    pub rating_change: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRecord {
    pub external_id: i64,
    pub full_name: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub external_id: i64,
    pub tournament_external_id: i64,
    pub round: Option<i32>,
    pub white_external_id: i64,
    pub black_external_id: i64,
    /// "1-0", "0-1" or "1/2-1/2".
    pub result: String,
    pub played_at: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStatsRecord {
    pub game_external_id: i64,
    pub moves: Option<i32>,
    pub opening_code: Option<String>,
    pub duration_minutes: Option<i32>,
}

/// Everything the pipeline needs from the portal. Page numbers are
/// zero-based; all listings iterate in stable ascending external-id order so
/// a resumed run neither skips nor duplicates units.
#[async_trait]
pub trait SiteSource: Send + Sync {
    async fn clubs_page(&self, page: i32) -> Result<Page<ClubRecord>, SyncError>;
    async fn player_ids_page(&self, page: i32) -> Result<Page<i64>, SyncError>;
    async fn player(&self, external_id: i64) -> Result<PlayerRecord, SyncError>;
    async fn club_members(&self, club_external_id: i64)
        -> Result<Vec<ClubMemberRecord>, SyncError>;
    async fn player_year_stats(
        &self,
        player_external_id: i64,
    ) -> Result<Vec<PlayerYearStatsRecord>, SyncError>;
    async fn tournaments_page(&self, page: i32) -> Result<Page<TournamentRecord>, SyncError>;
    async fn tournament_chief_judge(
        &self,
        tournament_external_id: i64,
    ) -> Result<Option<ChiefJudgeRecord>, SyncError>;
    async fn player_tournament_history(
        &self,
        player_external_id: i64,
    ) -> Result<Vec<PlayerTournamentRecord>, SyncError>;
    async fn judges_page(&self, page: i32) -> Result<Page<JudgeRecord>, SyncError>;
    async fn games_page(
        &self,
        tournament_external_id: i64,
        page: i32,
    ) -> Result<Page<GameRecord>, SyncError>;
    async fn game_statistics(
        &self,
        game_external_id: i64,
    ) -> Result<Option<GameStatsRecord>, SyncError>;
}
