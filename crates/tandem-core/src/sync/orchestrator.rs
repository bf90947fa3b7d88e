//! The sync cycle and the background loops that trigger it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{join_all, try_join_all};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{RetryPolicy, SyncError, SyncPhase, SyncResult, SyncStatusTracker};
use crate::models::ActionStatus;
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::queue::{ActionQueue, QueueChange};
use crate::realtime::{ChannelState, RealtimeChannel, RealtimeEvent};
use crate::services::{DomainSyncService, ReconcileReport};
use crate::Result;

const PROBE_INTERVAL: Duration = Duration::from_secs(15);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub processed: usize,
    /// Items dropped because their target no longer exists server-side
    pub absorbed: usize,
    /// Items parked in `error` status
    pub failed: usize,
    /// A transient failure stopped the drain
    pub deferred: bool,
    /// Another drain was already running
    pub skipped: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another cycle was already running
    pub skipped: bool,
    /// Remote phases were skipped for lack of connectivity
    pub offline: bool,
    pub queue: QueueReport,
    pub reconciled: Vec<(&'static str, ReconcileReport)>,
}

/// Clears the flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum QueueTrigger {
    Changed,
    RetryDue,
    Ignore,
    Stop,
}

pub struct SyncOrchestrator {
    queue: Arc<ActionQueue>,
    /// Settings first: loaded ahead of everything else
    services: Vec<Arc<dyn DomainSyncService>>,
    channel: Option<Arc<RealtimeChannel>>,
    network: Option<Arc<NetworkMonitor>>,
    status: SyncStatusTracker,
    retry: RetryPolicy,
    sync_interval: Duration,
    running: AtomicBool,
    draining: AtomicBool,
    /// Interrupted `processing` items were put back to `pending`
    resumed: AtomicBool,
    consecutive_failures: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<ActionQueue>,
        settings: Arc<dyn DomainSyncService>,
        services: Vec<Arc<dyn DomainSyncService>>,
        status: SyncStatusTracker,
        sync_interval: Duration,
    ) -> Self {
        let mut all = Vec::with_capacity(services.len() + 1);
        all.push(settings);
        all.extend(services);
        Self {
            queue,
            services: all,
            channel: None,
            network: None,
            status,
            retry: RetryPolicy::QUEUE,
            sync_interval,
            running: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            resumed: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_realtime(mut self, channel: Arc<RealtimeChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    #[must_use]
    pub fn with_network(mut self, network: Arc<NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> SyncPhase {
        self.status.phase()
    }

    pub const fn status(&self) -> &SyncStatusTracker {
        &self.status
    }

    pub fn watch_state(&self) -> watch::Receiver<super::SyncStatus> {
        self.status.subscribe()
    }

    /// Run one full cycle: load local state, drain the queue, reconcile every
    /// domain against the server, then listen.
    ///
    /// A call made while a cycle is running returns a skipped report. Queue
    /// backoff is reset, so a manual sync retries failed items right away.
    pub async fn sync_all(&self) -> SyncResult<SyncReport> {
        let Some(_running) = FlagGuard::acquire(&self.running) else {
            tracing::debug!("Sync already running, skipping");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let result = self.run_cycle().await;
        match &result {
            Ok(report) => {
                if let Some(error) = &report.queue.last_error {
                    self.status.record_error(format!("process-queue: {error}"));
                }
                if !report.offline {
                    self.status.record_cycle_complete();
                }
                tracing::info!(
                    processed = report.queue.processed,
                    absorbed = report.queue.absorbed,
                    offline = report.offline,
                    "Sync cycle finished"
                );
            }
            Err(error) => {
                tracing::error!("Sync cycle failed: {error}");
                self.status.record_error(error.to_string());
                self.status.set_phase(SyncPhase::Idle);
            }
        }
        result
    }

    /// Fill the reactive store from the local database, settings first.
    pub async fn load_local(&self) -> SyncResult<()> {
        if let Some((settings, others)) = self.services.split_first() {
            self.tracked(
                SyncPhase::LoadingLocal,
                "load-settings",
                settings.load_local_to_store(),
            )
            .await?;
            let loads = others.iter().map(|service| {
                let name = format!("load-local:{}", service.name());
                async move { self.status.track(&name, service.load_local_to_store()).await }
            });
            let queue_load = self.status.track("load-local:queue", async {
                self.resume_interrupted().await?;
                self.queue.load_local_to_store().await
            });
            let (loaded, queue_loaded) = tokio::join!(try_join_all(loads), queue_load);
            loaded.map_err(|error| SyncError::from_phase(SyncPhase::LoadingLocal, error))?;
            queue_loaded.map_err(|error| SyncError::from_phase(SyncPhase::LoadingLocal, error))?;
        }
        Ok(())
    }

    /// Reset items a previous run left `processing`, once per orchestrator.
    ///
    /// Skipped while a drain holds the queue: its `processing` item is live.
    async fn resume_interrupted(&self) -> Result<()> {
        if self.resumed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(_draining) = FlagGuard::acquire(&self.draining) else {
            return Ok(());
        };
        self.queue.resume_interrupted().await?;
        self.resumed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_cycle(&self) -> SyncResult<SyncReport> {
        self.status.set_phase(SyncPhase::LoadingLocal);
        self.load_local().await?;

        if !self.is_online() {
            tracing::info!("Offline, remote sync deferred");
            self.status.set_phase(SyncPhase::Idle);
            return Ok(SyncReport {
                offline: true,
                ..SyncReport::default()
            });
        }

        self.status.set_phase(SyncPhase::ProcessingQueue);
        let queue = self
            .tracked(SyncPhase::ProcessingQueue, "process-queue", self.process_queue())
            .await?;

        self.status.set_phase(SyncPhase::ReconcilingRemote);
        let reconciles = self.services.iter().map(|service| async move {
            let name = format!("sync-remote:{}", service.name());
            (
                service.name(),
                self.status.track(&name, service.sync_all_remote_to_local()).await,
            )
        });
        let mut reconciled = Vec::with_capacity(self.services.len());
        let mut first_error = None;
        for (name, result) in join_all(reconciles).await {
            match result {
                Ok(report) => reconciled.push((name, report)),
                Err(error) => {
                    tracing::warn!(service = name, "Remote reconcile failed: {error}");
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(channel) = &self.channel {
            channel.connect();
        }
        self.status.set_phase(SyncPhase::Listening);
        if let Some(error) = first_error {
            return Err(SyncError::from_phase(SyncPhase::ReconcilingRemote, error));
        }
        Ok(SyncReport {
            skipped: false,
            offline: false,
            queue,
            reconciled,
        })
    }

    /// Deliver pending items oldest first.
    ///
    /// Not-found failures drop the item; validation failures park it in
    /// `error`; any other failure puts it back to `pending` and ends the
    /// drain so later items never overtake it.
    pub async fn process_queue(&self) -> Result<QueueReport> {
        let Some(_draining) = FlagGuard::acquire(&self.draining) else {
            return Ok(QueueReport {
                skipped: true,
                ..QueueReport::default()
            });
        };

        let mut report = QueueReport::default();
        for queued in self.queue.dequeue_all().await? {
            // Earlier swaps may have rewritten this item's entity id
            let Some(item) = self.queue.get(&queued.id).await? else {
                continue;
            };
            if item.status != ActionStatus::Pending {
                continue;
            }
            let Some(service) = self
                .services
                .iter()
                .find(|service| service.handles(item.action_type))
            else {
                let message = format!("no handler for {}", item.action_type);
                tracing::error!(item_id = %item.id, "{message}");
                self.queue.mark_error(&item.id, &message).await?;
                report.failed += 1;
                continue;
            };

            self.queue.mark_processing(&item.id).await?;
            match service.process_queue_item(&item).await {
                Ok(()) => {
                    self.queue.remove(&item.id).await?;
                    report.processed += 1;
                }
                Err(error) if error.is_not_found() => {
                    tracing::info!(
                        item_id = %item.id,
                        action = %item.action_type,
                        entity_id = %item.related_entity_id,
                        "Target gone on the server, dropping queued action"
                    );
                    self.queue.remove(&item.id).await?;
                    report.absorbed += 1;
                }
                Err(error) if error.is_permanent() => {
                    tracing::warn!(
                        item_id = %item.id,
                        action = %item.action_type,
                        "Queued action rejected: {error}"
                    );
                    self.queue.mark_error(&item.id, &error.to_string()).await?;
                    report.failed += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        item_id = %item.id,
                        action = %item.action_type,
                        attempts = item.attempts + 1,
                        "Queued action failed, will retry: {error}"
                    );
                    self.queue.record_failure(&item.id, &error.to_string()).await?;
                    report.deferred = true;
                    report.last_error = Some(error.to_string());
                    break;
                }
            }
        }

        if report.deferred {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        } else {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
        Ok(report)
    }

    /// Fan a realtime event out to every service.
    pub async fn handle_realtime_event(&self, event: &RealtimeEvent) {
        if matches!(event, RealtimeEvent::Connected { .. }) {
            return;
        }
        for service in &self.services {
            if let Err(error) = service.handle_realtime_event(event).await {
                tracing::warn!(
                    service = service.name(),
                    kind = event.kind(),
                    "Failed to apply realtime event: {error}"
                );
            }
        }
    }

    /// Spawn the background loops and an initial cycle. Idempotent.
    ///
    /// The loops only hold weak handles; dropping the last `Arc` stops them
    /// just like [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        let this = Arc::downgrade(self);
        tasks.push(tokio::spawn(queue_loop(this.clone(), self.queue.subscribe())));
        if let Some(channel) = &self.channel {
            tasks.push(tokio::spawn(realtime_loop(this.clone(), channel.subscribe())));
            tasks.push(tokio::spawn(channel_state_loop(
                this.clone(),
                channel.watch_status(),
            )));
        }
        if let Some(network) = &self.network {
            tasks.push(tokio::spawn(network_loop(this.clone(), network.subscribe())));
            tasks.push(tokio::spawn(Arc::clone(network).run_probe_loop(PROBE_INTERVAL)));
        }
        tasks.push(tokio::spawn(periodic_loop(this, self.sync_interval)));
        tasks.push(tokio::spawn(sweep_loop(self.status.clone())));

        let orchestrator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            // Errors are already logged and recorded on the status
            let _ = orchestrator.sync_all().await;
        }));
        tracing::debug!(tasks = tasks.len(), "Sync orchestrator started");
    }

    /// Stop background work and the realtime connection.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        if let Some(channel) = &self.channel {
            channel.disconnect();
        }
        self.status.set_phase(SyncPhase::Idle);
        tracing::debug!("Sync orchestrator stopped");
    }

    fn is_online(&self) -> bool {
        self.network
            .as_ref()
            .map_or(true, |network| network.status().is_online())
    }

    async fn tracked<T>(
        &self,
        phase: SyncPhase,
        name: &str,
        operation: impl Future<Output = Result<T>>,
    ) -> SyncResult<T> {
        self.status
            .track(name, operation)
            .await
            .map_err(|error| SyncError::from_phase(phase, error))
    }

    /// One drain on behalf of `queue_loop`; returns when to try again.
    async fn drain_for_loop(&self) -> Option<Instant> {
        match self.process_queue().await {
            Ok(report) if report.skipped => Some(Instant::now() + self.retry.delay_for(0)),
            Ok(report) if report.deferred => {
                let failures = self.consecutive_failures.load(Ordering::SeqCst);
                let delay = self.retry.delay_for(failures.saturating_sub(1));
                tracing::debug!(?delay, failures, "Queue drain backing off");
                if let Some(error) = &report.last_error {
                    self.status.record_error(format!("process-queue: {error}"));
                }
                Some(Instant::now() + delay)
            }
            Ok(_) => None,
            Err(error) => {
                tracing::warn!("Queue drain failed: {error}");
                self.status.record_error(format!("process-queue: {error}"));
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                Some(Instant::now() + self.retry.delay_for(failures))
            }
        }
    }

    fn apply_channel_state(&self, state: &ChannelState) {
        if let Some(network) = &self.network {
            network.report_channel(state);
        }
        if let ChannelState::Failed {
            attempts,
            last_error,
        } = state
        {
            let error = SyncError::Realtime(format!(
                "gave up after {attempts} attempts: {last_error}"
            ));
            tracing::error!("{error}");
            self.status.record_error(error.to_string());
        }
    }

    async fn apply_network_status(&self, status: NetworkStatus) {
        match status {
            NetworkStatus::Online => {
                tracing::info!("Back online, syncing");
                if let Some(channel) = &self.channel {
                    channel.connect();
                }
                let _ = self.sync_all().await;
            }
            NetworkStatus::Offline => {
                tracing::info!("Connection lost, pausing sync");
                if let Some(channel) = &self.channel {
                    channel.disconnect();
                }
                self.status.set_phase(SyncPhase::Idle);
            }
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

// Background loops. Each upgrades its handle only while acting on a trigger
// and exits once the orchestrator is gone.

async fn queue_loop(
    this: Weak<SyncOrchestrator>,
    mut changes: broadcast::Receiver<QueueChange>,
) {
    let mut retry_at: Option<Instant> = None;
    loop {
        let trigger = tokio::select! {
            change = changes.recv() => match change {
                Ok(QueueChange::Enqueued(_) | QueueChange::Reloaded)
                | Err(RecvError::Lagged(_)) => QueueTrigger::Changed,
                Ok(_) => QueueTrigger::Ignore,
                Err(RecvError::Closed) => QueueTrigger::Stop,
            },
            () = wait_until(retry_at) => QueueTrigger::RetryDue,
        };
        match trigger {
            QueueTrigger::Stop => break,
            QueueTrigger::Ignore => continue,
            // Backoff in effect; the retry timer drains
            QueueTrigger::Changed if retry_at.is_some() => continue,
            QueueTrigger::Changed | QueueTrigger::RetryDue => {}
        }
        retry_at = None;
        let Some(orchestrator) = this.upgrade() else {
            break;
        };
        if orchestrator.is_online() {
            retry_at = orchestrator.drain_for_loop().await;
        }
    }
}

async fn realtime_loop(
    this: Weak<SyncOrchestrator>,
    mut events: broadcast::Receiver<RealtimeEvent>,
) {
    loop {
        let received = events.recv().await;
        let Some(orchestrator) = this.upgrade() else {
            break;
        };
        match received {
            Ok(event) => orchestrator.handle_realtime_event(&event).await,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Realtime events dropped, reconciling");
                let _ = orchestrator.sync_all().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn channel_state_loop(
    this: Weak<SyncOrchestrator>,
    mut states: watch::Receiver<ChannelState>,
) {
    loop {
        let state = states.borrow_and_update().clone();
        match this.upgrade() {
            Some(orchestrator) => orchestrator.apply_channel_state(&state),
            None => break,
        }
        if states.changed().await.is_err() {
            break;
        }
    }
}

async fn network_loop(
    this: Weak<SyncOrchestrator>,
    mut statuses: watch::Receiver<NetworkStatus>,
) {
    let mut last = *statuses.borrow_and_update();
    while statuses.changed().await.is_ok() {
        let status = *statuses.borrow_and_update();
        if status == last {
            continue;
        }
        last = status;
        let Some(orchestrator) = this.upgrade() else {
            break;
        };
        orchestrator.apply_network_status(status).await;
    }
}

async fn periodic_loop(this: Weak<SyncOrchestrator>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; start() runs that cycle itself
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(orchestrator) = this.upgrade() else {
            break;
        };
        if orchestrator.is_online() {
            let _ = orchestrator.sync_all().await;
        }
    }
}

async fn sweep_loop(status: SyncStatusTracker) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        status.sweep_timeouts();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, EntityId, Note, NoteChanges};
    use crate::realtime::{EventSource, EventStream};
    use crate::services::{CollectionSyncService, NoteSyncService, SettingsSyncService};
    use crate::sync::OperationOutcome;
    use crate::testing::{InjectedFailure, TestHarness};
    use crate::Error;
    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};
    use pretty_assertions::assert_eq;

    const FAST_RETRY: RetryPolicy =
        RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(100));

    struct Fixture {
        harness: TestHarness,
        notes: Arc<NoteSyncService>,
        collections: Arc<CollectionSyncService>,
        orchestrator: SyncOrchestrator,
    }

    async fn fixture() -> Fixture {
        fixture_with(Duration::from_secs(5), |orchestrator| orchestrator).await
    }

    async fn fixture_with(
        timeout: Duration,
        configure: impl FnOnce(SyncOrchestrator) -> SyncOrchestrator,
    ) -> Fixture {
        let harness = TestHarness::new().await;
        let ctx = harness.context();
        let notes = Arc::new(NoteSyncService::new(ctx.clone()));
        let collections = Arc::new(CollectionSyncService::new(ctx.clone()));
        let settings = Arc::new(SettingsSyncService::new(ctx.clone()));
        let services: Vec<Arc<dyn DomainSyncService>> = vec![collections.clone(), notes.clone()];
        let orchestrator = configure(SyncOrchestrator::new(
            ctx.queue.clone(),
            settings,
            services,
            SyncStatusTracker::new(timeout),
            Duration::from_secs(60),
        ));
        Fixture {
            harness,
            notes,
            collections,
            orchestrator,
        }
    }

    /// Poll `condition` for up to two seconds.
    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 2s");
    }

    async fn wait_for_first_cycle(orchestrator: &SyncOrchestrator) {
        let status = orchestrator.status().clone();
        eventually(|| status.snapshot().last_synced_at.is_some()).await;
    }

    /// Connections that open and then stay silent.
    #[derive(Default)]
    struct SilentSource {
        opens: AtomicU32,
    }

    #[async_trait]
    impl EventSource for SilentSource {
        async fn open(&self, _client_id: &str) -> Result<EventStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(stream::pending::<Result<String>>().boxed())
        }
    }

    struct RefusingSource;

    #[async_trait]
    impl EventSource for RefusingSource {
        async fn open(&self, _client_id: &str) -> Result<EventStream> {
            Err(Error::Network("connection refused".to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_note_syncs_to_server_identity() {
        let f = fixture().await;
        let note = f.notes.create_note("Groceries", None, None).await.unwrap();

        let report = f.orchestrator.sync_all().await.unwrap();

        assert_eq!(report.queue.processed, 1);
        let stored = f.harness.local.list_notes().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_ne!(stored[0].id, note.id);
        assert!(f.harness.local.list_queue().await.unwrap().is_empty());
        assert_eq!(f.orchestrator.state(), SyncPhase::Listening);
        let snapshot = f.harness.store.snapshot();
        assert_eq!(snapshot.notes.len(), 1);
        assert!(snapshot.queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_follows_creation_order() {
        let f = fixture().await;
        let mut created = Vec::new();
        for title in ["one", "two", "three"] {
            created.push(f.notes.create_note(title, None, None).await.unwrap().id);
        }

        f.orchestrator.process_queue().await.unwrap();

        let expected: Vec<String> = created
            .iter()
            .map(|id| format!("create_note {id}"))
            .collect();
        assert_eq!(f.harness.api.calls(), expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notes_follow_collection_swap_before_upload() {
        let f = fixture().await;
        let collection = f.collections.create_collection("Work").await.unwrap();
        f.notes
            .create_note("Agenda", None, Some(collection.id.clone()))
            .await
            .unwrap();

        f.orchestrator.sync_all().await.unwrap();

        let server_collections = f.harness.api.collections();
        let server_notes = f.harness.api.notes();
        assert_eq!(server_collections.len(), 1);
        assert_eq!(
            server_notes[0].collection_id,
            Some(server_collections[0].id.clone())
        );
        let local = f.harness.local.list_notes().await.unwrap();
        assert_eq!(local[0].collection_id, Some(server_collections[0].id.clone()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn not_found_items_are_absorbed() {
        let f = fixture().await;
        let mut ghost = Note::new("Ghost", None);
        ghost.id = EntityId::new("srv-ghost");
        ghost.server_created_at = Some(1);
        f.harness.local.upsert_note(&ghost).await.unwrap();
        f.harness
            .context()
            .queue
            .enqueue(ActionType::UpdateNote, ghost.id.clone())
            .await
            .unwrap();

        let report = f.orchestrator.process_queue().await.unwrap();

        assert_eq!(report.absorbed, 1);
        assert!(!report.deferred);
        assert!(f.harness.local.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_stops_the_drain() {
        let f = fixture().await;
        f.notes.create_note("first", None, None).await.unwrap();
        f.notes.create_note("second", None, None).await.unwrap();
        f.harness.api.fail_next(InjectedFailure::Transient);

        let report = f.orchestrator.process_queue().await.unwrap();

        assert!(report.deferred);
        assert_eq!(report.processed, 0);
        let queue = f.harness.local.list_queue().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].status, ActionStatus::Pending);
        assert_eq!(queue[0].attempts, 1);
        assert!(queue[0].error.is_some());
        assert_eq!(queue[1].attempts, 0);

        let retry = f.orchestrator.process_queue().await.unwrap();
        assert_eq!(retry.processed, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_items_are_parked() {
        let f = fixture().await;
        f.notes.create_note("invalid", None, None).await.unwrap();
        f.notes.create_note("valid", None, None).await.unwrap();
        f.harness.api.fail_next(InjectedFailure::Rejected);

        let report = f.orchestrator.process_queue().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        let queue = f.harness.local.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, ActionStatus::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reentrant_calls_are_skipped() {
        let f = fixture().await;
        f.notes.create_note("Waiting", None, None).await.unwrap();
        f.orchestrator.running.store(true, Ordering::SeqCst);
        f.orchestrator.draining.store(true, Ordering::SeqCst);

        assert!(f.orchestrator.sync_all().await.unwrap().skipped);
        assert!(f.orchestrator.process_queue().await.unwrap().skipped);
        assert!(f.harness.api.calls().is_empty());

        f.orchestrator.running.store(false, Ordering::SeqCst);
        f.orchestrator.draining.store(false, Ordering::SeqCst);
        let report = f.orchestrator.sync_all().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.queue.processed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconciliation_prunes_collection_deleted_by_peer() {
        let f = fixture().await;
        let shared = f.harness.seed_remote_collection("Shared");
        let note = f.harness.seed_remote_note("Inside", Some(shared.id.clone()));
        f.orchestrator.sync_all().await.unwrap();
        assert_eq!(f.harness.local.list_notes().await.unwrap().len(), 1);

        f.harness.api.drop_collection(&shared.id);
        f.harness.api.drop_note(&note.id);
        f.orchestrator.sync_all().await.unwrap();

        assert!(f.harness.local.list_collections().await.unwrap().is_empty());
        assert!(f.harness.local.list_notes().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_cycle_only_loads_local_state() {
        let harness = TestHarness::new().await;
        let ctx = harness.context();
        let notes = NoteSyncService::new(ctx.clone());
        notes.create_note("Offline", None, None).await.unwrap();
        let network = Arc::new(NetworkMonitor::new(None, Duration::ZERO));
        network.report_platform(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let orchestrator = SyncOrchestrator::new(
            ctx.queue.clone(),
            Arc::new(SettingsSyncService::new(ctx.clone())),
            vec![Arc::new(NoteSyncService::new(ctx.clone()))],
            SyncStatusTracker::new(Duration::from_secs(5)),
            Duration::from_secs(60),
        )
        .with_network(network);

        let report = orchestrator.sync_all().await.unwrap();

        assert!(report.offline);
        assert!(harness.api.calls().is_empty());
        assert_eq!(harness.store.snapshot().queue.len(), 1);
        assert_eq!(orchestrator.state(), SyncPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn realtime_events_reach_services() {
        let f = fixture().await;
        let collection = f.harness.seed_remote_collection("Peers");
        let note = f.harness.seed_remote_note("From B", Some(collection.id.clone()));

        f.orchestrator
            .handle_realtime_event(&RealtimeEvent::CollectionCreated {
                collection: collection.clone(),
            })
            .await;
        f.orchestrator
            .handle_realtime_event(&RealtimeEvent::NoteCreated { note: note.clone() })
            .await;

        assert!(f.harness.local.get_collection(&collection.id).await.unwrap().is_some());
        assert!(f.harness.local.get_note(&note.id).await.unwrap().is_some());
        assert!(f.harness.local.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_reconcile_surfaces_as_sync_error() {
        let f = fixture().await;
        f.harness.api.fail_next(InjectedFailure::Transient);

        let error = f.orchestrator.sync_all().await.unwrap_err();

        assert!(matches!(
            error,
            SyncError::Phase {
                phase: SyncPhase::ReconcilingRemote,
                ..
            }
        ));
        assert!(f.orchestrator.status().snapshot().last_error.is_some());
        assert_eq!(f.orchestrator.state(), SyncPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cycle_during_drain_keeps_in_flight_item() {
        let f = fixture().await;
        let orchestrator = Arc::new(f.orchestrator);
        let note = f.notes.create_note("v1", None, None).await.unwrap();
        let gate = f.harness.api.hold_creates();
        let drain = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.process_queue().await }
        });
        let store = f.harness.store.clone();
        eventually(|| {
            store
                .snapshot()
                .queue
                .first()
                .is_some_and(|item| item.status == ActionStatus::Processing)
        })
        .await;

        let report = orchestrator.sync_all().await.unwrap();
        assert!(report.queue.skipped);
        let queue = f.harness.local.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, ActionStatus::Processing);

        f.notes
            .update_note(
                &note.id,
                NoteChanges {
                    title: Some("v2".to_string()),
                    ..NoteChanges::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(f.harness.local.list_queue().await.unwrap().len(), 2);

        gate.add_permits(1);
        assert_eq!(drain.await.unwrap().unwrap().processed, 1);
        assert_eq!(orchestrator.process_queue().await.unwrap().processed, 1);

        let server = f.harness.api.notes();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].title, "v2");
        assert!(f.harness.local.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_items_are_resumed_on_first_load() {
        let f = fixture().await;
        let item = f
            .harness
            .queue
            .enqueue(ActionType::UpdateNote, EntityId::new("srv-n"))
            .await
            .unwrap();
        f.harness.queue.mark_processing(&item.id).await.unwrap();

        f.orchestrator.load_local().await.unwrap();
        assert_eq!(
            f.harness.local.list_queue().await.unwrap()[0].status,
            ActionStatus::Pending
        );

        f.harness.queue.mark_processing(&item.id).await.unwrap();
        f.orchestrator.load_local().await.unwrap();
        assert_eq!(
            f.harness.local.list_queue().await.unwrap()[0].status,
            ActionStatus::Processing
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_drain_is_flagged_without_duplicate_create() {
        let f = fixture_with(Duration::from_millis(50), |orchestrator| orchestrator).await;
        f.notes.create_note("Slow", None, None).await.unwrap();
        f.harness.api.delay_create_replies(Duration::from_millis(200));

        let report = f.orchestrator.sync_all().await.unwrap();

        assert_eq!(report.queue.processed, 1);
        assert!(f
            .orchestrator
            .status()
            .snapshot()
            .recent
            .iter()
            .any(|op| op.name == "process-queue" && op.outcome == OperationOutcome::TimedOut));

        f.orchestrator.sync_all().await.unwrap();
        assert_eq!(f.harness.api.notes().len(), 1);
        assert_eq!(f.harness.local.list_notes().await.unwrap().len(), 1);
        assert!(f.harness.local.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueued_items_are_drained_in_background() {
        let f = fixture_with(Duration::from_secs(5), |o| o.with_retry_policy(FAST_RETRY)).await;
        let orchestrator = Arc::new(f.orchestrator);
        orchestrator.start();
        wait_for_first_cycle(&orchestrator).await;

        f.notes.create_note("Live", None, None).await.unwrap();

        let api = f.harness.api.clone();
        eventually(|| api.notes().len() == 1).await;
        let store = f.harness.store.clone();
        eventually(|| store.snapshot().queue.is_empty()).await;
        orchestrator.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_drain_backs_off_after_transient_failure() {
        let f = fixture_with(Duration::from_secs(5), |o| o.with_retry_policy(FAST_RETRY)).await;
        let orchestrator = Arc::new(f.orchestrator);
        orchestrator.start();
        wait_for_first_cycle(&orchestrator).await;

        f.harness.api.fail_next(InjectedFailure::Transient);
        let note = f.notes.create_note("Retry", None, None).await.unwrap();

        let api = f.harness.api.clone();
        eventually(|| api.notes().len() == 1).await;
        let create = format!("create_note {}", note.id);
        assert_eq!(api.calls(), vec![create.clone(), create]);
        assert!(orchestrator
            .status()
            .snapshot()
            .last_error
            .is_some_and(|error| error.starts_with("process-queue:")));
        orchestrator.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coming_online_reconnects_and_syncs() {
        let network = Arc::new(NetworkMonitor::new(None, Duration::ZERO));
        network.report_platform(false);
        let source = Arc::new(SilentSource::default());
        let channel = Arc::new(RealtimeChannel::new(source.clone(), "tab-1", FAST_RETRY, 3));
        let f = fixture_with(Duration::from_secs(5), |o| {
            o.with_network(network.clone())
                .with_realtime(channel.clone())
                .with_retry_policy(FAST_RETRY)
        })
        .await;
        eventually(|| network.status() == NetworkStatus::Offline).await;
        let orchestrator = Arc::new(f.orchestrator);
        orchestrator.start();

        f.notes.create_note("Written offline", None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.harness.api.calls().is_empty());
        assert_eq!(source.opens.load(Ordering::SeqCst), 0);

        network.report_platform(true);

        let api = f.harness.api.clone();
        eventually(|| api.notes().len() == 1).await;
        eventually(|| channel.status().is_connected()).await;
        assert!(source.opens.load(Ordering::SeqCst) >= 1);
        orchestrator.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_realtime_reconnects_are_recorded() {
        let channel = Arc::new(RealtimeChannel::new(
            Arc::new(RefusingSource),
            "tab-1",
            FAST_RETRY,
            1,
        ));
        let f = fixture_with(Duration::from_secs(5), |o| o.with_realtime(channel.clone())).await;
        let orchestrator = Arc::new(f.orchestrator);
        orchestrator.start();

        let status = orchestrator.status().clone();
        eventually(|| {
            status
                .snapshot()
                .last_error
                .is_some_and(|error| error.contains("gave up after 2 attempts"))
        })
        .await;
        assert!(matches!(channel.status(), ChannelState::Failed { attempts: 2, .. }));
        orchestrator.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_the_last_handle_stops_background_work() {
        let f = fixture_with(Duration::from_secs(5), |o| o.with_retry_policy(FAST_RETRY)).await;
        let orchestrator = Arc::new(f.orchestrator);
        orchestrator.start();
        wait_for_first_cycle(&orchestrator).await;

        let weak = Arc::downgrade(&orchestrator);
        drop(orchestrator);
        eventually(|| weak.strong_count() == 0).await;

        f.notes.create_note("Unsent", None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.harness.api.calls().is_empty());
    }
}
