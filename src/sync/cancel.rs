//! Cooperative, per-run cancellation.
//!
//! One handle per run, raised once (user request or wall-clock timeout) and
//! observed by the orchestrator and every phase at safe points. Never
//! preemptive: an in-flight unit always commits or rolls back before the
//! pipeline stops.

use crate::sync::error::{SyncError, EC_CANCELLED, EC_TIMEOUT};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequested,
    /// Wall-clock ceiling hit; mechanically identical to a user cancel but
    /// surfaced with a distinct message and error code.
    Timeout,
}

impl CancelReason {
    pub fn error_code(&self) -> &'static str {
        match self {
            CancelReason::UserRequested => EC_CANCELLED,
            CancelReason::Timeout => EC_TIMEOUT,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CancelReason::UserRequested => "Import cancelled by user request",
            CancelReason::Timeout => "Import exceeded the maximum run duration",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => f.write_str("user requested"),
            CancelReason::Timeout => f.write_str("timeout"),
        }
    }
}

/// Shared cancellation signal for one run. Cheap to clone; all clones
/// observe the same state. The first `cancel` call wins and fixes the
/// reason; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Raise the signal. Returns true if this call had effect.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Safe-point check: error out with the recorded reason once raised.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.token.is_cancelled() {
            Err(SyncError::Cancelled(
                self.reason().unwrap_or(CancelReason::UserRequested),
            ))
        } else {
            Ok(())
        }
    }

    /// Resolves when the signal is raised; used to cut backoff sleeps short.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cancel_wins() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        assert!(handle.check().is_ok());

        assert!(handle.cancel(CancelReason::Timeout));
        assert!(!handle.cancel(CancelReason::UserRequested));

        assert_eq!(handle.reason(), Some(CancelReason::Timeout));
        match handle.check() {
            Err(SyncError::Cancelled(CancelReason::Timeout)) => {}
            other => panic!("expected timeout cancellation, got {other:?}"),
        }
    }

    #[test]
    fn clones_share_state() {
        let handle = CancelHandle::new();
        let observer = handle.clone();
        handle.cancel(CancelReason::UserRequested);
        assert!(observer.is_cancelled());
        assert_eq!(observer.reason(), Some(CancelReason::UserRequested));
    }
}
