// In-process handle to the currently running import

use crate::sync::cancel::CancelHandle;
use crate::sync::orchestrator::RunHandle;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Holds the [`RunHandle`] for the run this process launched, if any.
///
/// Cancellation needs the in-process [`CancelHandle`]; a run started by a
/// different replica is visible in the database but cannot be cancelled
/// from here. Finished handles are pruned lazily on access.
#[derive(Default)]
pub struct RunRegistry {
    inner: Mutex<Option<RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly launched run. The lock in Postgres guarantees at
    /// most one live run, so a still-running previous handle is a bug.
    pub async fn register(&self, handle: RunHandle) {
        let mut slot = self.inner.lock().await;
        if let Some(old) = slot.replace(handle) {
            if !old.join.is_finished() {
                tracing::error!(run_id = %old.run_id, "registry replaced a run that had not finished");
            }
        }
    }

    /// The run this process owns, if it is still going.
    pub async fn active(&self) -> Option<(Uuid, CancelHandle)> {
        let mut slot = self.inner.lock().await;
        match slot.as_ref() {
            Some(handle) if !handle.join.is_finished() => {
                Some((handle.run_id, handle.cancel.clone()))
            }
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }
}
