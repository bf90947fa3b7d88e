//! Note mutations and note sync.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{protected_ids, remote_wins, DomainSyncService, ReconcileReport, SyncContext};
use crate::models::{ActionQueueItem, ActionType, EntityId, Note, NoteChanges};
use crate::realtime::RealtimeEvent;
use crate::store::StoreCommand;
use crate::sync::swap_note;
use crate::util::normalize_text_option;
use crate::{Error, Result};

pub struct NoteSyncService {
    ctx: SyncContext,
}

impl NoteSyncService {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Create a note locally and queue its upload.
    pub async fn create_note(
        &self,
        title: &str,
        description: Option<String>,
        collection_id: Option<EntityId>,
    ) -> Result<Note> {
        let title = validate_title(title)?;
        if let Some(collection_id) = &collection_id {
            self.require_collection(collection_id).await?;
        }
        let mut note = Note::new(title, collection_id);
        note.description = normalize_text_option(description);

        self.ctx.local.upsert_note(&note).await?;
        if let Err(error) = self.ctx.queue.enqueue(ActionType::CreateNote, note.id.clone()).await {
            self.rollback_insert(&note.id).await;
            return Err(error);
        }
        self.ctx.search.retitle(&note.id, &note.title).await?;
        self.ctx.store.apply(StoreCommand::UpsertNote(note.clone()));
        tracing::info!(note_id = %note.id, "Created note");
        Ok(note)
    }

    pub async fn update_note(&self, id: &EntityId, mut changes: NoteChanges) -> Result<Note> {
        let previous = self.require_note(id).await?;
        if let Some(title) = changes.title.take() {
            changes.title = Some(validate_title(&title)?);
        }
        if let Some(description) = changes.description.take() {
            changes.description = Some(normalize_text_option(description));
        }
        if let Some(Some(collection_id)) = &changes.collection_id {
            self.require_collection(collection_id).await?;
        }

        let mut note = previous.clone();
        note.apply(changes);
        self.ctx.local.upsert_note(&note).await?;
        if let Err(error) = self
            .ctx
            .queue
            .enqueue_coalesced(ActionType::UpdateNote, note.id.clone())
            .await
        {
            if let Err(restore) = self.ctx.local.upsert_note(&previous).await {
                tracing::error!(note_id = %id, "Failed to restore note after queue error: {restore}");
            }
            return Err(error);
        }
        if note.title != previous.title {
            self.ctx.search.retitle(&note.id, &note.title).await?;
        }
        self.ctx.store.apply(StoreCommand::UpsertNote(note.clone()));
        Ok(note)
    }

    /// Move a note into `collection_id`, or out of any collection with `None`.
    pub async fn move_note(&self, id: &EntityId, collection_id: Option<EntityId>) -> Result<Note> {
        self.update_note(
            id,
            NoteChanges {
                collection_id: Some(collection_id),
                ..NoteChanges::default()
            },
        )
        .await
    }

    /// Delete a note.
    ///
    /// A note whose create is still pending is dropped on the spot and never
    /// reaches the server. Otherwise the delete is queued before the local
    /// row goes away.
    pub async fn delete_note(&self, id: &EntityId) -> Result<()> {
        if self.ctx.local.cancel_pending_note_create(id).await? {
            self.ctx.store.apply(StoreCommand::RemoveNotes(vec![id.clone()]));
            self.ctx.queue.load_local_to_store().await?;
            tracing::info!(note_id = %id, "Discarded note that was never uploaded");
            return Ok(());
        }

        self.require_note(id).await?;
        let item = self.ctx.queue.enqueue(ActionType::DeleteNote, id.clone()).await?;
        if let Err(error) = self.ctx.local.delete_note(id).await {
            if let Err(undo) = self.ctx.queue.remove(&item.id).await {
                tracing::error!(note_id = %id, "Failed to drop queued delete: {undo}");
            }
            return Err(error);
        }
        self.ctx.store.apply(StoreCommand::RemoveNotes(vec![id.clone()]));
        tracing::info!(note_id = %id, "Deleted note");
        Ok(())
    }

    async fn require_note(&self, id: &EntityId) -> Result<Note> {
        self.ctx
            .local
            .get_note(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("note {id}")))
    }

    async fn require_collection(&self, id: &EntityId) -> Result<()> {
        if self.ctx.local.get_collection(id).await?.is_none() {
            return Err(Error::InvalidInput(format!("Unknown collection: {id}")));
        }
        Ok(())
    }

    async fn rollback_insert(&self, id: &EntityId) {
        if let Err(error) = self.ctx.local.delete_note(id).await {
            tracing::error!(note_id = %id, "Failed to roll back note insert: {error}");
        }
    }

    async fn upload_create(&self, id: &EntityId) -> Result<()> {
        let Some(sent) = self.ctx.local.get_note(id).await? else {
            tracing::debug!(note_id = %id, "Note vanished before upload");
            return Ok(());
        };
        let remote = self.ctx.api.create_note(&sent).await?;
        self.finish_upload(id, &sent, remote).await
    }

    async fn upload_update(&self, id: &EntityId) -> Result<()> {
        let Some(sent) = self.ctx.local.get_note(id).await? else {
            tracing::debug!(note_id = %id, "Note deleted before update was sent");
            return Ok(());
        };
        let remote = self.ctx.api.update_note(&sent).await?;
        self.finish_upload(id, &sent, remote).await
    }

    async fn finish_upload(&self, id: &EntityId, sent: &Note, remote: Note) -> Result<()> {
        let current = self.ctx.local.get_note(id).await?;
        if current.is_none() && &remote.id == id {
            // Deleted locally meanwhile; the queued delete follows
            return Ok(());
        }
        let merged = Note::reconcile_with_server(sent, current.as_ref(), remote);
        let title = merged.title.clone();
        let mapping = swap_note(&self.ctx, id, merged).await?;
        if current.is_some() {
            self.ctx.search.retitle(&mapping.to, &title).await?;
        }
        Ok(())
    }

    async fn apply_remote(&self, note: Note) -> Result<()> {
        let local = self.ctx.local.get_note(&note.id).await?;
        if !remote_wins(local.as_ref().map(|local| local.updated_at), note.updated_at) {
            tracing::debug!(note_id = %note.id, "Ignoring stale note event");
            return Ok(());
        }
        self.ctx.local.upsert_note(&note).await?;
        self.ctx.search.retitle(&note.id, &note.title).await?;
        self.ctx.store.apply(StoreCommand::UpsertNote(note));
        Ok(())
    }
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::InvalidInput("Note title must not be empty".to_string()));
    }
    Ok(title.to_string())
}

#[async_trait]
impl DomainSyncService for NoteSyncService {
    fn name(&self) -> &'static str {
        "notes"
    }

    fn handles(&self, action: ActionType) -> bool {
        matches!(
            action,
            ActionType::CreateNote | ActionType::UpdateNote | ActionType::DeleteNote
        )
    }

    async fn load_local_to_store(&self) -> Result<()> {
        let notes = self.ctx.local.list_notes().await?;
        tracing::debug!(count = notes.len(), "Loaded notes");
        self.ctx.store.apply(StoreCommand::SetNotes(notes));
        Ok(())
    }

    async fn sync_all_remote_to_local(&self) -> Result<ReconcileReport> {
        let remote = self.ctx.api.list_notes().await?;
        let local = self.ctx.local.list_notes().await?;
        let protected = protected_ids(
            &self.ctx,
            local.iter().filter(|note| !note.is_synced()).map(|note| &note.id),
        )
        .await?;

        let mut report = ReconcileReport::default();
        let keep: HashSet<EntityId> = remote.iter().map(|note| note.id.clone()).collect();
        for note in remote {
            if protected.contains(&note.id) {
                report.deferred += 1;
                continue;
            }
            if local.iter().any(|existing| existing == &note) {
                continue;
            }
            self.ctx.local.upsert_note(&note).await?;
            self.ctx.search.retitle(&note.id, &note.title).await?;
            report.upserted += 1;
        }

        let pruned = self.ctx.local.prune_notes(&keep, &protected).await?;
        report.pruned = pruned.len();
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), "Pruned notes deleted on the server");
        }
        self.ctx
            .store
            .apply(StoreCommand::SetNotes(self.ctx.local.list_notes().await?));
        Ok(report)
    }

    async fn process_queue_item(&self, item: &ActionQueueItem) -> Result<()> {
        let id = &item.related_entity_id;
        match item.action_type {
            ActionType::CreateNote => self.upload_create(id).await,
            ActionType::UpdateNote => self.upload_update(id).await,
            ActionType::DeleteNote => self.ctx.api.delete_note(id).await,
            other => Err(Error::InvalidInput(format!(
                "{other} is not a note action"
            ))),
        }
    }

    async fn handle_realtime_event(&self, event: &RealtimeEvent) -> Result<()> {
        match event {
            RealtimeEvent::NoteCreated { note } | RealtimeEvent::NoteUpdated { note } => {
                self.apply_remote(note.clone()).await
            }
            RealtimeEvent::NoteDeleted { id } => {
                if self.ctx.local.delete_note(id).await? {
                    tracing::info!(note_id = %id, "Note deleted by peer");
                }
                self.ctx.store.apply(StoreCommand::RemoveNotes(vec![id.clone()]));
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
