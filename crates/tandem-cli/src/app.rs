//! Composition root: builds every engine component once per process and
//! hands out explicit references.

use std::path::Path;
use std::sync::Arc;

use tandem_core::api::{HttpRemoteApi, OfflineRemoteApi, RemoteApi};
use tandem_core::config::ClientConfig;
use tandem_core::db::LocalStore;
use tandem_core::docsync::{
    DocumentAuthority, DocumentSyncManager, HttpDocumentAuthority, OfflineAuthority,
};
use tandem_core::network::{HttpProbe, NetworkMonitor};
use tandem_core::queue::ActionQueue;
use tandem_core::realtime::{HttpEventSource, RealtimeChannel};
use tandem_core::search::SearchIndex;
use tandem_core::services::{
    CollectionSyncService, DocumentStateSync, DomainSyncService, NoteSyncService,
    SettingsSyncService, SyncContext,
};
use tandem_core::store::Store;
use tandem_core::sync::{RetryPolicy, SwapListener, SyncOrchestrator, SyncReport, SyncStatusTracker};

use crate::error::CliError;

pub struct App {
    pub config: ClientConfig,
    pub local: LocalStore,
    pub store: Store,
    pub search: SearchIndex,
    pub notes: Arc<NoteSyncService>,
    pub collections: Arc<CollectionSyncService>,
    pub settings: Arc<SettingsSyncService>,
    pub documents: Arc<DocumentSyncManager>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl App {
    /// Open (or create) the database at `db_path` and wire the engine.
    pub async fn open(db_path: &Path, config: ClientConfig) -> Result<Self, CliError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let local = LocalStore::open_path(db_path).await?;
        let app = Self::build(config, local)?;
        app.orchestrator.load_local().await?;
        Ok(app)
    }

    pub fn build(config: ClientConfig, local: LocalStore) -> Result<Self, CliError> {
        let client_id = config.resolved_client_id();
        let store = Store::new();
        let queue = Arc::new(ActionQueue::new(local.clone(), store.clone()));
        let search = SearchIndex::new(local.clone());
        let status = SyncStatusTracker::new(config.operation_timeout());

        let (api, authority): (Arc<dyn RemoteApi>, Arc<dyn DocumentAuthority>) =
            if config.is_online_capable() {
                (
                    Arc::new(HttpRemoteApi::from_config(&config, client_id.clone())?),
                    Arc::new(HttpDocumentAuthority::from_config(&config, client_id.clone())?),
                )
            } else {
                tracing::debug!("No api_base_url configured, changes stay local");
                (Arc::new(OfflineRemoteApi), Arc::new(OfflineAuthority))
            };

        let documents = Arc::new(DocumentSyncManager::new(
            local.clone(),
            store.clone(),
            search.clone(),
            authority,
            status.clone(),
            config.document_flush_debounce(),
            config.document_compaction_threshold,
        ));
        let swap_listener: Arc<dyn SwapListener> = documents.clone();
        let ctx = SyncContext {
            local: local.clone(),
            store: store.clone(),
            queue: Arc::clone(&queue),
            api,
            search: search.clone(),
            swap_listener: Some(swap_listener),
        };

        let notes = Arc::new(NoteSyncService::new(ctx.clone()));
        let collections = Arc::new(CollectionSyncService::new(ctx.clone()));
        let settings = Arc::new(SettingsSyncService::new(ctx.clone()));
        let services: Vec<Arc<dyn DomainSyncService>> = vec![
            collections.clone(),
            notes.clone(),
            Arc::new(DocumentStateSync::new(ctx, Arc::clone(&documents))),
        ];
        let mut orchestrator = SyncOrchestrator::new(
            Arc::clone(&queue),
            settings.clone(),
            services,
            status,
            config.sync_interval(),
        );

        if let Some(base_url) = config.api_base_url.as_deref() {
            let probe = HttpProbe::new(base_url, config.request_timeout())?;
            orchestrator = orchestrator.with_network(Arc::new(NetworkMonitor::new(
                Some(Arc::new(probe)),
                config.network_debounce(),
            )));
            if let Some(endpoint) = config.realtime_endpoint() {
                let channel = RealtimeChannel::new(
                    Arc::new(HttpEventSource::new(endpoint)?),
                    client_id,
                    RetryPolicy::new(config.realtime_backoff_base(), config.realtime_backoff_cap()),
                    config.realtime_max_reconnect_attempts,
                );
                orchestrator = orchestrator.with_realtime(Arc::new(channel));
            }
        }

        Ok(Self {
            config,
            local,
            store,
            search,
            notes,
            collections,
            settings,
            documents,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub const fn remote_enabled(&self) -> bool {
        self.config.is_online_capable()
    }

    pub fn require_remote(&self) -> Result<(), CliError> {
        if self.remote_enabled() {
            Ok(())
        } else {
            Err(CliError::SyncNotConfigured)
        }
    }

    pub async fn sync_once(&self) -> Result<SyncReport, CliError> {
        self.require_remote()?;
        Ok(self.orchestrator.sync_all().await?)
    }

    /// Flush any open note body before the process exits.
    pub async fn close(&self) -> Result<(), CliError> {
        self.documents.close_note().await?;
        Ok(())
    }
}
