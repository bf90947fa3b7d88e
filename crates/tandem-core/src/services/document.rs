//! Document revision markers: reconciliation and realtime dispatch.

use std::sync::Arc;

use async_trait::async_trait;

use super::{DomainSyncService, ReconcileReport, SyncContext};
use crate::docsync::{DocumentSyncManager, RevisionOutcome};
use crate::models::{ActionQueueItem, ActionType};
use crate::realtime::RealtimeEvent;
use crate::store::StoreCommand;
use crate::{Error, Result};

/// Bodies never go through the action queue; this service only routes
/// revision markers to the [`DocumentSyncManager`].
pub struct DocumentStateSync {
    ctx: SyncContext,
    documents: Arc<DocumentSyncManager>,
}

impl DocumentStateSync {
    pub fn new(ctx: SyncContext, documents: Arc<DocumentSyncManager>) -> Self {
        Self { ctx, documents }
    }
}

#[async_trait]
impl DomainSyncService for DocumentStateSync {
    fn name(&self) -> &'static str {
        "documents"
    }

    fn handles(&self, _action: ActionType) -> bool {
        false
    }

    async fn load_local_to_store(&self) -> Result<()> {
        let states = self.ctx.local.list_document_states().await?;
        self.ctx.store.apply(StoreCommand::SetDocumentStates(states));
        Ok(())
    }

    /// Converge every body whose server revision is ahead of the local
    /// marker. One failing document does not stop the others.
    async fn sync_all_remote_to_local(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut first_error = None;
        for state in self.ctx.api.list_document_states().await? {
            match self
                .documents
                .handle_revision_event(&state.note_id, state.updated_at)
                .await
            {
                Ok(RevisionOutcome::Converged | RevisionOutcome::DeferredToLiveSession) => {
                    report.upserted += 1;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(note_id = %state.note_id, "Document reconcile failed: {error}");
                    report.deferred += 1;
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) if report.upserted == 0 => Err(error),
            _ => Ok(report),
        }
    }

    async fn process_queue_item(&self, item: &ActionQueueItem) -> Result<()> {
        Err(Error::InvalidInput(format!(
            "{} is not a document action",
            item.action_type
        )))
    }

    async fn handle_realtime_event(&self, event: &RealtimeEvent) -> Result<()> {
        if let RealtimeEvent::DocumentUpdated {
            note_id,
            updated_at,
        } = event
        {
            let outcome = self
                .documents
                .handle_revision_event(note_id, *updated_at)
                .await?;
            tracing::debug!(note_id = %note_id, ?outcome, "Handled document revision");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::docsync::DocumentReplica;
    use crate::models::{document_name, DocumentReplicaState, EntityId};
    use crate::sync::SyncStatusTracker;
    use crate::testing::{FakeAuthority, TestHarness};
    use pretty_assertions::assert_eq;

    fn service(harness: &TestHarness, authority: &FakeAuthority) -> DocumentStateSync {
        let ctx = harness.context();
        let documents = DocumentSyncManager::new(
            ctx.local.clone(),
            ctx.store.clone(),
            ctx.search.clone(),
            Arc::new(authority.clone()),
            SyncStatusTracker::new(Duration::from_secs(5)),
            Duration::from_millis(50),
            8,
        );
        DocumentStateSync::new(ctx, Arc::new(documents))
    }

    fn peer_body(note_id: &EntityId, text: &str) -> Vec<u8> {
        let mut peer = DocumentReplica::new(note_id.clone());
        peer.set_text(text).unwrap();
        peer.snapshot().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_server_revision_is_converged_once() {
        let harness = TestHarness::new().await;
        let authority = FakeAuthority::default();
        let documents = service(&harness, &authority);
        let note = harness.seed_remote_note("Minutes", None);
        harness.local.upsert_note(&note).await.unwrap();
        authority.seed(&document_name(&note.id), &peer_body(&note.id, "agreed on dates"));
        harness
            .api
            .put_document_state(DocumentReplicaState::new(note.id.clone(), 100));

        let report = documents.sync_all_remote_to_local().await.unwrap();

        assert_eq!(report.upserted, 1);
        let state = harness.local.get_document_state(&note.id).await.unwrap().unwrap();
        assert_eq!(state.updated_at, 100);
        let hits = harness.search.search("agreed", None).await.unwrap();
        assert_eq!(hits.len(), 1);

        let again = documents.sync_all_remote_to_local().await.unwrap();
        assert_eq!(again.upserted, 0);
        assert_eq!(authority.connections(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn revisions_for_unknown_notes_are_ignored() {
        let harness = TestHarness::new().await;
        let authority = FakeAuthority::default();
        let documents = service(&harness, &authority);

        documents
            .handle_realtime_event(&RealtimeEvent::DocumentUpdated {
                note_id: EntityId::new("srv-elsewhere"),
                updated_at: 5,
            })
            .await
            .unwrap();

        assert_eq!(authority.connections(), 0);
        assert!(harness.local.list_document_states().await.unwrap().is_empty());
    }
}
