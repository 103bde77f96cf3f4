//! Error taxonomy for the import pipeline.
//!
//! Every per-unit failure is classified before the pipeline decides what to
//! do with it: transient errors are retried with backoff, permanent errors
//! are recorded to the skipped-entity ledger immediately, and anything
//! unrecognized is pipeline-fatal and escalates to the orchestrator.

use crate::sync::cancel::CancelReason;
use thiserror::Error;

pub const EC_FATAL: &str = "EC-001";
pub const EC_TRANSIENT_EXHAUSTED: &str = "EC-002";
pub const EC_VALIDATION: &str = "EC-003";
pub const EC_NOT_FOUND: &str = "EC-004";
pub const EC_CANCELLED: &str = "EC-007";
pub const EC_TIMEOUT: &str = "EC-008";

#[derive(Debug, Error)]
pub enum SyncError {
    /// Worth retrying: network timeouts, rate limits, 5xx responses,
    /// transient storage hiccups.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Not worth retrying: the unit itself is bad (not found, failed
    /// validation). Goes straight to the ledger.
    #[error("permanent failure [{code}]: {message}")]
    Permanent { code: String, message: String },

    /// Cooperative cancellation observed at a safe point.
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    /// The pipeline itself is compromised; aborts the run.
    #[error(transparent)]
    Fatal(anyhow::Error),
}

impl SyncError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        SyncError::Transient(err.into())
    }

    pub fn permanent(code: &str, message: impl Into<String>) -> Self {
        SyncError::Permanent {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        SyncError::Fatal(err.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::permanent(EC_VALIDATION, message)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled(_))
    }

    /// Stable error code for ledger rows and run-record payloads.
    pub fn code(&self) -> &str {
        match self {
            SyncError::Transient(_) => EC_TRANSIENT_EXHAUSTED,
            SyncError::Permanent { code, .. } => code,
            SyncError::Cancelled(reason) => reason.error_code(),
            SyncError::Fatal(_) => EC_FATAL,
        }
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Fatal(err)
    }
}

/// reqwest errors are network-shaped: timeouts and connection problems are
/// transient, anything else (builder misuse, decode of a 200 body) points at
/// a programming or contract problem.
impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            SyncError::transient(err)
        } else if err.is_decode() {
            SyncError::permanent(EC_VALIDATION, format!("response decode failed: {err}"))
        } else {
            SyncError::fatal(err)
        }
    }
}

/// Storage errors: pool/io blips are retryable, everything else means the
/// database itself is in trouble and the run must stop.
impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => SyncError::transient(err),
            sqlx::Error::Database(db) => {
                // Class 40: transaction rollback (serialization failure, deadlock).
                if db.code().map(|c| c.starts_with("40")).unwrap_or(false) {
                    SyncError::transient(err)
                } else {
                    SyncError::fatal(err)
                }
            }
            _ => SyncError::fatal(err),
        }
    }
}

/// Classify a non-success HTTP status from the source site.
pub fn classify_status(status: reqwest::StatusCode, url: &str) -> SyncError {
    if status == reqwest::StatusCode::NOT_FOUND {
        SyncError::permanent(EC_NOT_FOUND, format!("{url} returned 404"))
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SyncError::transient(anyhow::anyhow!("{url} returned {status}"))
    } else {
        SyncError::permanent(
            &format!("EC-HTTP-{}", status.as_u16()),
            format!("{url} returned {status}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let not_found = classify_status(reqwest::StatusCode::NOT_FOUND, "http://x/p/1");
        assert!(matches!(not_found, SyncError::Permanent { ref code, .. } if code == EC_NOT_FOUND));

        assert!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "u").is_transient());
        assert!(classify_status(reqwest::StatusCode::BAD_GATEWAY, "u").is_transient());

        let forbidden = classify_status(reqwest::StatusCode::FORBIDDEN, "u");
        assert!(matches!(forbidden, SyncError::Permanent { ref code, .. } if code == "EC-HTTP-403"));
    }

    #[test]
    fn sqlx_pool_timeout_is_transient() {
        assert!(SyncError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(matches!(
            SyncError::from(sqlx::Error::RowNotFound),
            SyncError::Fatal(_)
        ));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SyncError::validation("bad name").code(), EC_VALIDATION);
        assert_eq!(
            SyncError::transient(anyhow::anyhow!("x")).code(),
            EC_TRANSIENT_EXHAUSTED
        );
        assert_eq!(
            SyncError::Cancelled(CancelReason::Timeout).code(),
            EC_TIMEOUT
        );
        assert_eq!(
            SyncError::Cancelled(CancelReason::UserRequested).code(),
            EC_CANCELLED
        );
    }
}
