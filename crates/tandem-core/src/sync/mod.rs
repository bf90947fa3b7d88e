//! Sync orchestration: the full cycle, identity swaps, retry timing and
//! status bookkeeping.

mod orchestrator;
mod retry;
mod status;
mod swap;

pub use orchestrator::{QueueReport, SyncOrchestrator, SyncReport};
pub use retry::RetryPolicy;
pub use status::{
    FinishedOperation, OperationId, OperationOutcome, RunningOperation, SyncPhase, SyncStatus,
    SyncStatusTracker,
};
pub use swap::{swap_collection, swap_note, SwapListener};

use thiserror::Error;

/// Failure of a sync cycle, attached to the orchestrator's status.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync failed while {phase}: {source}")]
    Phase {
        phase: SyncPhase,
        #[source]
        source: crate::Error,
    },
    #[error("Sync operation timed out: {operation}")]
    Timeout { operation: String },
    #[error("Realtime channel failed: {0}")]
    Realtime(String),
}

impl SyncError {
    pub fn from_phase(phase: SyncPhase, error: crate::Error) -> Self {
        match error {
            crate::Error::Timeout(operation) => Self::Timeout { operation },
            source => Self::Phase { phase, source },
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
