//! Sync phase and per-operation bookkeeping for status indicators.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::util::now_ms;
use crate::Result;

const HISTORY_LIMIT: usize = 32;

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    LoadingLocal,
    ProcessingQueue,
    ReconcilingRemote,
    Listening,
}

impl SyncPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LoadingLocal => "loading-local",
            Self::ProcessingQueue => "processing-queue",
            Self::ReconcilingRemote => "reconciling-remote",
            Self::Listening => "listening",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningOperation {
    pub id: u64,
    pub name: String,
    pub started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedOperation {
    pub name: String,
    pub outcome: OperationOutcome,
    pub duration: Duration,
}

/// Everything a status indicator needs to render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub running: BTreeMap<u64, RunningOperation>,
    pub recent: VecDeque<FinishedOperation>,
    pub last_error: Option<String>,
    /// Unix ms of the last completed full cycle
    pub last_synced_at: Option<i64>,
}

impl SyncStatus {
    pub fn is_busy(&self) -> bool {
        !self.running.is_empty()
    }

    fn finish(&mut self, id: u64, outcome: OperationOutcome) -> Option<FinishedOperation> {
        let operation = self.running.remove(&id)?;
        if let OperationOutcome::Failed(message) = &outcome {
            self.last_error = Some(format!("{}: {message}", operation.name));
        }
        if outcome == OperationOutcome::TimedOut {
            self.last_error = Some(format!("{}: timed out", operation.name));
        }
        let finished = FinishedOperation {
            name: operation.name,
            outcome,
            duration: operation.started.elapsed(),
        };
        self.recent.push_back(finished.clone());
        while self.recent.len() > HISTORY_LIMIT {
            self.recent.pop_front();
        }
        Some(finished)
    }
}

/// Handle returned by [`SyncStatusTracker::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationId(u64);

#[derive(Clone)]
pub struct SyncStatusTracker {
    status: Arc<watch::Sender<SyncStatus>>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl SyncStatusTracker {
    pub fn new(timeout: Duration) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            status: Arc::new(status),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start(&self, name: impl Into<String>) -> OperationId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let operation = RunningOperation {
            id,
            name: name.into(),
            started: Instant::now(),
        };
        tracing::debug!(operation = %operation.name, "Sync operation started");
        self.status.send_modify(|status| {
            status.running.insert(id, operation);
        });
        OperationId(id)
    }

    pub fn complete(&self, id: OperationId) {
        self.finish(id, OperationOutcome::Completed);
    }

    pub fn fail(&self, id: OperationId, error: &str) {
        self.finish(id, OperationOutcome::Failed(error.to_string()));
    }

    /// Mark operations running past the timeout as timed out and clear them.
    ///
    /// Returns how many were swept.
    pub fn sweep_timeouts(&self) -> usize {
        let timeout = self.timeout;
        let mut swept = 0;
        self.status.send_if_modified(|status| {
            let stale: Vec<u64> = status
                .running
                .values()
                .filter(|operation| operation.started.elapsed() >= timeout)
                .map(|operation| operation.id)
                .collect();
            for id in stale {
                if let Some(finished) = status.finish(id, OperationOutcome::TimedOut) {
                    tracing::warn!(operation = %finished.name, "Sync operation timed out");
                    swept += 1;
                }
            }
            swept > 0
        });
        swept
    }

    /// Run `operation` under start/complete/fail bookkeeping and the timeout guard.
    ///
    /// An operation outliving the timeout is reported as timed out but keeps
    /// running; its own result is still returned.
    pub async fn track<T, F>(&self, name: &str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let id = self.start(name);
        tokio::pin!(operation);
        let result = tokio::select! {
            result = &mut operation => result,
            () = tokio::time::sleep(self.timeout) => {
                self.finish(id, OperationOutcome::TimedOut);
                tracing::warn!(operation = name, "Sync operation exceeded its timeout, still waiting");
                operation.await
            }
        };
        // Both are no-ops once the operation was marked timed out
        match result {
            Ok(value) => {
                self.complete(id);
                Ok(value)
            }
            Err(error) => {
                self.fail(id, &error.to_string());
                Err(error)
            }
        }
    }

    pub fn set_phase(&self, phase: SyncPhase) {
        self.status.send_if_modified(|status| {
            if status.phase == phase {
                return false;
            }
            tracing::debug!(from = %status.phase, to = %phase, "Sync phase changed");
            status.phase = phase;
            true
        });
    }

    /// Surface a failure that did not come from a tracked operation.
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.status.send_modify(|status| {
            status.last_error = Some(message);
        });
    }

    pub fn record_cycle_complete(&self) {
        self.status.send_modify(|status| {
            status.last_synced_at = Some(now_ms());
        });
    }

    pub fn phase(&self) -> SyncPhase {
        self.status.borrow().phase
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    fn finish(&self, id: OperationId, outcome: OperationOutcome) {
        self.status.send_modify(|status| {
            status.finish(id.0, outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn track_records_completion() {
        let tracker = SyncStatusTracker::new(Duration::from_secs(1));
        let value = tracker.track("load-local", async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
        let status = tracker.snapshot();
        assert!(!status.is_busy());
        assert_eq!(status.recent[0].outcome, OperationOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operations_are_flagged_but_not_cancelled() {
        let tracker = SyncStatusTracker::new(Duration::from_millis(50));
        let slow = tokio::spawn({
            let tracker = tracker.clone();
            async move {
                tracker
                    .track("sync-remote:notes", async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(7)
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = tracker.snapshot();
        assert!(!status.is_busy());
        assert_eq!(status.recent[0].outcome, OperationOutcome::TimedOut);
        assert_eq!(
            status.last_error.as_deref(),
            Some("sync-remote:notes: timed out")
        );
        assert!(!slow.is_finished());

        assert_eq!(slow.await.unwrap().unwrap(), 7);
        let status = tracker.snapshot();
        assert_eq!(status.recent.len(), 1);
        assert!(!status.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_surface_as_last_error() {
        let tracker = SyncStatusTracker::new(Duration::from_secs(1));
        let result: Result<()> = tracker
            .track("process-queue", async {
                Err(Error::Network("offline".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            tracker.snapshot().last_error.as_deref(),
            Some("process-queue: Network error: offline")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_clears_abandoned_operations() {
        let tracker = SyncStatusTracker::new(Duration::from_millis(100));
        let _abandoned = tracker.start("realtime-connect");
        assert_eq!(tracker.sweep_timeouts(), 0);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(tracker.sweep_timeouts(), 1);
        assert!(!tracker.snapshot().is_busy());
    }

    #[test]
    fn phase_names() {
        assert_eq!(SyncPhase::ProcessingQueue.to_string(), "processing-queue");
    }
}
