//! Note body replication.
//!
//! Bodies are replicated documents synced continuously against a
//! collaboration authority, outside the action queue. Locally each body is an
//! append log of update blobs (see [`UpdateLog`]) that is compacted into a
//! snapshot once it grows.
//!
//! At most one note is open for editing. Its edits are flushed to the log
//! after a quiet period and pushed through the session's own connection.
//! Revision events for any other note are converged through a short-lived
//! replica instead.

mod authority;
mod log;
mod replica;

pub use authority::{AuthoritySession, DocumentAuthority, HttpDocumentAuthority, OfflineAuthority};
pub use log::UpdateLog;
pub use replica::{DocumentReplica, ReplicaPhase, CONTENT_CONTAINER};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::LocalStore;
use crate::debounce::Debouncer;
use crate::models::{document_name, DocumentReplicaState, EntityId, SwapMapping};
use crate::search::SearchIndex;
use crate::store::{Store, StoreCommand};
use crate::sync::{SwapListener, SyncStatusTracker};
use crate::{Error, Result};

/// What [`DocumentSyncManager::handle_revision_event`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionOutcome {
    /// The local marker already covers the revision
    UpToDate,
    /// The note is open; its live session converged
    DeferredToLiveSession,
    /// A detached replica converged and was persisted
    Converged,
    /// No such note on this device
    UnknownNote,
}

struct OpenSession {
    replica: DocumentReplica,
    log: UpdateLog,
    pending: Vec<Vec<u8>>,
    remote: Option<Box<dyn AuthoritySession>>,
    /// Set while an identity swap rewrites the log
    paused: bool,
}

struct Shared {
    local: LocalStore,
    store: Store,
    search: SearchIndex,
    authority: Arc<dyn DocumentAuthority>,
    status: SyncStatusTracker,
    compaction_threshold: usize,
    session: Mutex<Option<OpenSession>>,
}

pub struct DocumentSyncManager {
    shared: Arc<Shared>,
    debouncer: Debouncer,
}

impl DocumentSyncManager {
    pub fn new(
        local: LocalStore,
        store: Store,
        search: SearchIndex,
        authority: Arc<dyn DocumentAuthority>,
        status: SyncStatusTracker,
        flush_delay: Duration,
        compaction_threshold: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                store,
                search,
                authority,
                status,
                compaction_threshold,
                session: Mutex::new(None),
            }),
            debouncer: Debouncer::new(flush_delay),
        }
    }

    /// Open a note for editing and return its current body.
    ///
    /// A note that is already open elsewhere is closed first. Failing to reach
    /// the authority is not an error: editing continues on the local replica.
    pub async fn open_note(&self, note_id: &EntityId) -> Result<String> {
        self.close_note().await?;
        let shared = &self.shared;
        if shared.local.get_note(note_id).await?.is_none() {
            return Err(Error::NotFound(format!("note {note_id}")));
        }

        let log = shared.log_for(note_id);
        let mut replica = DocumentReplica::new(note_id.clone());
        replica.load_local(&log).await?;
        let mut open = OpenSession {
            replica,
            log,
            pending: Vec::new(),
            remote: None,
            paused: false,
        };
        shared.sync_live(&mut open).await?;
        let text = open.replica.text();

        *shared.session.lock().await = Some(open);
        shared.store.apply(StoreCommand::SelectNote(Some(note_id.clone())));
        tracing::debug!(note_id = %note_id, "Opened note body");
        Ok(text)
    }

    /// Flush and close the open note, if any.
    pub async fn close_note(&self) -> Result<()> {
        self.debouncer.cancel();
        self.shared.flush().await?;
        let Some(mut open) = self.shared.session.lock().await.take() else {
            return Ok(());
        };
        if let Some(mut remote) = open.remote.take() {
            if let Err(error) = remote.close().await {
                tracing::debug!("Closing document session failed: {error}");
            }
        }
        let note_id = open.replica.note_id().clone();
        self.shared.store.apply(StoreCommand::SelectNote(None));
        tracing::debug!(note_id = %note_id, "Closed note body");
        Ok(())
    }

    pub async fn current_note(&self) -> Option<EntityId> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(|open| open.replica.note_id().clone())
    }

    pub async fn current_phase(&self) -> Option<ReplicaPhase> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(|open| open.replica.phase().clone())
    }

    /// Replace the open note's body; the write reaches the log after the
    /// debounce delay. Returns whether the text changed.
    pub async fn edit_text(&self, text: &str) -> Result<bool> {
        let changed = {
            let mut guard = self.shared.session.lock().await;
            let open = guard.as_mut().ok_or_else(no_open_note)?;
            match open.replica.set_text(text)? {
                Some(update) => {
                    open.pending.push(update);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.schedule_flush();
        }
        Ok(changed)
    }

    /// Merge an update produced by an external editor into the open note.
    pub async fn record_local_update(&self, update: Vec<u8>) -> Result<()> {
        {
            let mut guard = self.shared.session.lock().await;
            let open = guard.as_mut().ok_or_else(no_open_note)?;
            if !open.replica.apply_remote(&update)? {
                return Ok(());
            }
            open.pending.push(update);
        }
        self.schedule_flush();
        Ok(())
    }

    /// Write pending edits now instead of waiting for the debounce.
    pub async fn flush_now(&self) -> Result<()> {
        self.debouncer.cancel();
        self.shared.flush().await
    }

    /// Plain text of a note body, from the open session or the local log.
    pub async fn body_text(&self, note_id: &EntityId) -> Result<String> {
        {
            let guard = self.shared.session.lock().await;
            if let Some(open) = guard.as_ref().filter(|open| open.replica.note_id() == note_id) {
                return Ok(open.replica.text());
            }
        }
        let mut replica = DocumentReplica::new(note_id.clone());
        replica.load_local(&self.shared.log_for(note_id)).await?;
        Ok(replica.text())
    }

    /// React to the server announcing a new body revision for `note_id`.
    pub async fn handle_revision_event(
        &self,
        note_id: &EntityId,
        updated_at: i64,
    ) -> Result<RevisionOutcome> {
        let shared = &self.shared;
        let known = shared.local.get_document_state(note_id).await?;
        if known.is_some_and(|state| state.updated_at >= updated_at) {
            return Ok(RevisionOutcome::UpToDate);
        }
        if shared.local.get_note(note_id).await?.is_none() {
            return Ok(RevisionOutcome::UnknownNote);
        }

        {
            let mut guard = shared.session.lock().await;
            if let Some(open) = guard
                .as_mut()
                .filter(|open| open.replica.note_id() == note_id)
            {
                shared.sync_live(open).await?;
                drop(guard);
                shared.record_revision(note_id, updated_at).await?;
                return Ok(RevisionOutcome::DeferredToLiveSession);
            }
        }

        shared
            .status
            .track("converge-document", shared.converge_detached(note_id))
            .await?;
        shared.record_revision(note_id, updated_at).await?;
        Ok(RevisionOutcome::Converged)
    }

    /// Re-key the open session after its note changed identity.
    pub async fn rename(&self, from: &EntityId, to: &EntityId) {
        let resume = {
            let mut guard = self.shared.session.lock().await;
            let Some(open) = guard.as_mut().filter(|open| open.replica.note_id() == from) else {
                return;
            };
            open.replica.rekey(to.clone());
            open.log.rename(document_name(to));
            if let Some(mut remote) = open.remote.take() {
                if let Err(error) = remote.close().await {
                    tracing::debug!("Closing document session failed: {error}");
                }
            }
            open.paused = false;
            !open.pending.is_empty()
        };
        tracing::debug!(from = %from, to = %to, "Open note body follows new id");
        if resume {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        let shared = Arc::clone(&self.shared);
        self.debouncer.schedule(async move {
            if let Err(error) = shared.flush().await {
                tracing::warn!("Document flush failed: {error}");
            }
        });
    }
}

impl Shared {
    fn log_for(&self, note_id: &EntityId) -> UpdateLog {
        UpdateLog::new(
            self.local.clone(),
            document_name(note_id),
            self.compaction_threshold,
        )
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        let Some(open) = guard.as_mut() else {
            return Ok(());
        };
        if open.paused || open.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut open.pending);
        for (index, update) in pending.iter().enumerate() {
            if let Err(error) = open.log.append(update).await {
                open.pending = pending[index..].to_vec();
                return Err(error);
            }
        }
        tracing::debug!(
            note_id = %open.replica.note_id(),
            updates = pending.len(),
            "Flushed note body"
        );
        self.refresh_search(open.replica.note_id(), &open.replica.text())
            .await;
        self.sync_live(open).await
    }

    /// Converge the open note through its own connection, reconnecting when
    /// needed. Only local persistence failures are returned.
    async fn sync_live(&self, open: &mut OpenSession) -> Result<()> {
        if open.remote.is_none() {
            match self.authority.connect(open.log.doc_name()).await {
                Ok(remote) => open.remote = Some(remote),
                Err(error) => {
                    tracing::debug!(
                        note_id = %open.replica.note_id(),
                        "Document authority unavailable: {error}"
                    );
                    return Ok(());
                }
            }
        }
        let Some(remote) = open.remote.as_mut() else {
            return Ok(());
        };
        match open.replica.converge(remote.as_mut()).await {
            Ok(Some(received)) => {
                open.log.append(&received).await?;
                self.refresh_search(open.replica.note_id(), &open.replica.text())
                    .await;
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    note_id = %open.replica.note_id(),
                    "Live document sync failed: {error}"
                );
                open.remote = None;
            }
        }
        Ok(())
    }

    async fn converge_detached(&self, note_id: &EntityId) -> Result<()> {
        let log = self.log_for(note_id);
        let mut replica = DocumentReplica::new(note_id.clone());
        replica.load_local(&log).await?;

        let mut remote = self.authority.connect(log.doc_name()).await?;
        let result = replica.converge(remote.as_mut()).await;
        if let Err(error) = remote.close().await {
            tracing::debug!("Closing document session failed: {error}");
        }
        if let Some(received) = result? {
            log.append(&received).await?;
            log.compact().await?;
        }
        self.refresh_search(note_id, &replica.text()).await;
        tracing::debug!(note_id = %note_id, "Converged note body");
        Ok(())
    }

    async fn record_revision(&self, note_id: &EntityId, updated_at: i64) -> Result<()> {
        let state = DocumentReplicaState::new(note_id.clone(), updated_at);
        self.local.upsert_document_state(&state).await?;
        self.store.apply(StoreCommand::UpsertDocumentState(state));
        Ok(())
    }

    async fn refresh_search(&self, note_id: &EntityId, body: &str) {
        let title = match self.local.get_note(note_id).await {
            Ok(Some(note)) => note.title,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(note_id = %note_id, "Search refresh skipped: {error}");
                return;
            }
        };
        if let Err(error) = self.search.upsert(note_id, &title, body).await {
            tracing::warn!(note_id = %note_id, "Search refresh failed: {error}");
        }
    }
}

fn no_open_note() -> Error {
    Error::InvalidInput("no note is open for editing".to_string())
}

#[async_trait]
impl SwapListener for DocumentSyncManager {
    async fn before_note_swap(&self, mapping: &SwapMapping) -> Result<()> {
        if self.current_note().await.as_ref() != Some(&mapping.from) {
            return Ok(());
        }
        self.flush_now().await?;
        if let Some(open) = self.shared.session.lock().await.as_mut() {
            if open.replica.note_id() == &mapping.from {
                open.paused = true;
            }
        }
        Ok(())
    }

    async fn after_note_swap(&self, mapping: &SwapMapping) {
        self.rename(&mapping.from, &mapping.to).await;
    }

    async fn abort_note_swap(&self, mapping: &SwapMapping) {
        let resume = {
            let mut guard = self.shared.session.lock().await;
            match guard.as_mut() {
                Some(open) if open.replica.note_id() == &mapping.from => {
                    open.paused = false;
                    !open.pending.is_empty()
                }
                _ => false,
            }
        };
        if resume {
            self.schedule_flush();
        }
    }
}
