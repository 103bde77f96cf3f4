// API request/response models (DTOs)

use crate::sync::runs::LiveStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(Meta::now()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Some(Meta::now()),
        }
    }
}

/// Metadata included in all API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncRequest {
    /// Discard the checkpoint and start over from the first phase.
    #[serde(default)]
    pub force_restart: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncResponse {
    pub run_id: uuid::Uuid,
    pub estimated_duration_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resuming_from: Option<&'static str>,
}

/// Validation counters as the dashboard renders them.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Percentage of records that passed validation; 100 for an empty run.
    pub validation_rate: f64,
    pub total_records_processed: i64,
    pub valid_records: i64,
    pub invalid_records: i64,
}

impl ValidationReport {
    fn from_counts(valid: i64, invalid: i64) -> Self {
        let total = valid + invalid;
        let rate = if total == 0 {
            100.0
        } else {
            (valid as f64 / total as f64) * 100.0
        };
        Self {
            validation_rate: rate,
            total_records_processed: total,
            valid_records: valid,
            invalid_records: invalid,
        }
    }
}

/// Status payload; IDLE when no run has ever been recorded.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub status: String,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<uuid::Uuid>,
    pub progress: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub processed_records: i64,
    pub total_records: i64,
    pub validation: ValidationReport,
    /// Per-entity-type row counts; absent when the count queries fail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncStatusResponse {
    pub fn idle() -> Self {
        Self {
            status: "IDLE".to_string(),
            is_running: false,
            run_id: None,
            progress: 0,
            current_operation: None,
            last_sync_time: None,
            last_error: None,
            processed_records: 0,
            total_records: 0,
            validation: ValidationReport::from_counts(0, 0),
            summary: None,
            estimated_duration_secs: None,
            started_at: None,
            updated_at: None,
        }
    }

    pub fn with_summary(mut self, summary: serde_json::Value) -> Self {
        self.summary = Some(summary);
        self
    }
}

impl From<LiveStatus> for SyncStatusResponse {
    fn from(live: LiveStatus) -> Self {
        let validation = ValidationReport::from_counts(live.valid_records, live.invalid_records);
        Self {
            status: live.status.clone(),
            is_running: live.is_running(),
            run_id: live.run_id,
            progress: live.progress,
            current_operation: live.current_operation,
            last_sync_time: live.last_sync_time,
            last_error: live.last_error,
            processed_records: live.processed_records,
            total_records: live.processed_records,
            validation,
            summary: None,
            estimated_duration_secs: live.estimated_duration_secs,
            started_at: live.started_at,
            updated_at: Some(live.updated_at),
        }
    }
}

/// Retry selector: ledger row ids, external entity ids, or page numbers
/// (pages additionally need `phase`). At least one selector must be given.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub phase: Option<String>,
    #[serde(default)]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub entity_ids: Vec<i64>,
    #[serde(default)]
    pub page_numbers: Vec<i32>,
}

impl RetryRequest {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.entity_ids.is_empty() && self.page_numbers.is_empty()
    }
}

#[derive(Debug, Deserialize)]
pub struct SkippedQuery {
    pub phase: Option<String>,
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncPhase;

    #[test]
    fn start_response_carries_the_resumed_phase_name() {
        let resumed: Option<SyncPhase> = Some(SyncPhase::Tournaments);
        let body = StartSyncResponse {
            run_id: uuid::Uuid::nil(),
            estimated_duration_secs: 90,
            resuming_from: resumed.map(|p| p.as_str()),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["resumingFrom"], "TOURNAMENTS");

        let fresh = StartSyncResponse {
            run_id: uuid::Uuid::nil(),
            estimated_duration_secs: 90,
            resuming_from: None,
        };
        let json = serde_json::to_value(&fresh).unwrap();
        assert!(json.get("resumingFrom").is_none());
    }
}
