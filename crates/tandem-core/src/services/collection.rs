//! Collection mutations, membership and collection sync.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{
    protected_ids, pull_notes_for_collection, remote_wins, DomainSyncService, ReconcileReport,
    SyncContext,
};
use crate::models::{ActionQueueItem, ActionType, Collection, EntityId, Invitation, MemberRole};
use crate::realtime::RealtimeEvent;
use crate::store::StoreCommand;
use crate::sync::swap_collection;
use crate::{Error, Result};

pub struct CollectionSyncService {
    ctx: SyncContext,
}

impl CollectionSyncService {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn create_collection(&self, title: &str) -> Result<Collection> {
        let collection = Collection::new(validate_title(title)?);
        self.ctx.local.upsert_collection(&collection).await?;
        if let Err(error) = self
            .ctx
            .queue
            .enqueue(ActionType::CreateCollection, collection.id.clone())
            .await
        {
            if let Err(undo) = self.ctx.local.delete_collection(&collection.id).await {
                tracing::error!(collection_id = %collection.id, "Failed to roll back collection insert: {undo}");
            }
            return Err(error);
        }
        self.ctx
            .store
            .apply(StoreCommand::UpsertCollection(collection.clone()));
        tracing::info!(collection_id = %collection.id, "Created collection");
        Ok(collection)
    }

    pub async fn rename_collection(&self, id: &EntityId, title: &str) -> Result<Collection> {
        let title = validate_title(title)?;
        let previous = self.require_collection(id).await?;
        let mut collection = previous.clone();
        collection.rename(title);

        self.ctx.local.upsert_collection(&collection).await?;
        if let Err(error) = self
            .ctx
            .queue
            .enqueue_coalesced(ActionType::UpdateCollection, id.clone())
            .await
        {
            if let Err(undo) = self.ctx.local.upsert_collection(&previous).await {
                tracing::error!(collection_id = %id, "Failed to restore collection: {undo}");
            }
            return Err(error);
        }
        self.ctx
            .store
            .apply(StoreCommand::UpsertCollection(collection.clone()));
        Ok(collection)
    }

    /// Delete a collection and the notes inside it.
    pub async fn delete_collection(&self, id: &EntityId) -> Result<()> {
        self.remove_with(ActionType::DeleteCollection, id).await
    }

    /// Stop being a member; the collection and its notes disappear locally.
    pub async fn leave_collection(&self, id: &EntityId) -> Result<()> {
        self.remove_with(ActionType::LeaveCollection, id).await
    }

    pub async fn invite_member(
        &self,
        collection_id: &EntityId,
        email: &str,
        role: MemberRole,
    ) -> Result<Invitation> {
        require_synced(collection_id)?;
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::InvalidInput(format!("Invalid email address: {email}")));
        }
        if role == MemberRole::Owner {
            return Err(Error::InvalidInput(
                "Invitations cannot grant ownership".to_string(),
            ));
        }
        let invitation = self.ctx.api.invite_member(collection_id, email, role).await?;
        tracing::info!(collection_id = %collection_id, invitation_id = %invitation.id, "Invited member");
        Ok(invitation)
    }

    /// Accept an invitation and pull the joined collection with its notes.
    pub async fn accept_invitation(&self, invitation_id: &str) -> Result<Collection> {
        let collection = self.ctx.api.accept_invitation(invitation_id).await?;
        self.store_collection(&collection).await?;
        let pulled = pull_notes_for_collection(&self.ctx, &collection.id).await?;
        tracing::info!(collection_id = %collection.id, notes = pulled, "Joined collection");
        Ok(collection)
    }

    pub async fn reject_invitation(&self, invitation_id: &str) -> Result<()> {
        self.ctx.api.reject_invitation(invitation_id).await
    }

    pub async fn cancel_invitation(&self, invitation_id: &str) -> Result<()> {
        self.ctx.api.cancel_invitation(invitation_id).await
    }

    pub async fn remove_member(&self, collection_id: &EntityId, user_id: &str) -> Result<()> {
        require_synced(collection_id)?;
        self.ctx.api.remove_member(collection_id, user_id).await?;
        if let Some(mut collection) = self.ctx.local.get_collection(collection_id).await? {
            collection.members.retain(|member| member.user_id != user_id);
            self.store_collection(&collection).await?;
        }
        Ok(())
    }

    pub async fn change_member_role(
        &self,
        collection_id: &EntityId,
        user_id: &str,
        role: MemberRole,
    ) -> Result<Collection> {
        require_synced(collection_id)?;
        let collection = self
            .ctx
            .api
            .change_member_role(collection_id, user_id, role)
            .await?;
        self.store_collection(&collection).await?;
        Ok(collection)
    }

    async fn remove_with(&self, action: ActionType, id: &EntityId) -> Result<()> {
        if let Some(notes) = self.ctx.local.cancel_pending_collection_create(id).await? {
            self.forget_locally(id, notes);
            self.ctx.queue.load_local_to_store().await?;
            tracing::info!(collection_id = %id, "Discarded collection that was never uploaded");
            return Ok(());
        }

        self.require_collection(id).await?;
        let item = self.ctx.queue.enqueue(action, id.clone()).await?;
        match self.ctx.local.delete_collection(id).await {
            Ok(notes) => {
                self.forget_locally(id, notes);
                self.ctx.queue.load_local_to_store().await?;
                tracing::info!(collection_id = %id, action = %action, "Removed collection");
                Ok(())
            }
            Err(error) => {
                if let Err(undo) = self.ctx.queue.remove(&item.id).await {
                    tracing::error!(collection_id = %id, "Failed to drop queued {action}: {undo}");
                }
                Err(error)
            }
        }
    }

    fn forget_locally(&self, id: &EntityId, notes: Vec<EntityId>) {
        self.ctx.store.apply_all([
            StoreCommand::RemoveNotes(notes),
            StoreCommand::RemoveCollection(id.clone()),
        ]);
    }

    async fn require_collection(&self, id: &EntityId) -> Result<Collection> {
        self.ctx
            .local
            .get_collection(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("collection {id}")))
    }

    async fn store_collection(&self, collection: &Collection) -> Result<()> {
        self.ctx.local.upsert_collection(collection).await?;
        self.ctx
            .store
            .apply(StoreCommand::UpsertCollection(collection.clone()));
        Ok(())
    }

    async fn apply_remote(&self, collection: &Collection) -> Result<()> {
        let local = self.ctx.local.get_collection(&collection.id).await?;
        if !remote_wins(local.map(|local| local.updated_at), collection.updated_at) {
            tracing::debug!(collection_id = %collection.id, "Ignoring stale collection event");
            return Ok(());
        }
        self.store_collection(collection).await
    }

    async fn upload(&self, id: &EntityId, create: bool) -> Result<()> {
        let Some(sent) = self.ctx.local.get_collection(id).await? else {
            tracing::debug!(collection_id = %id, "Collection removed before upload");
            return Ok(());
        };
        let remote = if create {
            self.ctx.api.create_collection(&sent).await?
        } else {
            self.ctx.api.update_collection(&sent).await?
        };
        let current = self.ctx.local.get_collection(id).await?;
        if current.is_none() && &remote.id == id {
            return Ok(());
        }
        let merged = Collection::reconcile_with_server(&sent, current.as_ref(), remote);
        swap_collection(&self.ctx, id, merged).await?;
        Ok(())
    }

    async fn drop_collection_locally(&self, id: &EntityId) -> Result<()> {
        let notes = self.ctx.local.delete_collection(id).await?;
        tracing::info!(collection_id = %id, notes = notes.len(), "Collection no longer accessible");
        self.forget_locally(id, notes);
        self.ctx.queue.load_local_to_store().await
    }
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::InvalidInput(
            "Collection title must not be empty".to_string(),
        ));
    }
    Ok(title.to_string())
}

/// Membership endpoints only know server ids.
fn require_synced(collection_id: &EntityId) -> Result<()> {
    if collection_id.is_local() {
        return Err(Error::InvalidInput(format!(
            "Collection {collection_id} has not been synced yet"
        )));
    }
    Ok(())
}

#[async_trait]
impl DomainSyncService for CollectionSyncService {
    fn name(&self) -> &'static str {
        "collections"
    }

    fn handles(&self, action: ActionType) -> bool {
        matches!(
            action,
            ActionType::CreateCollection
                | ActionType::UpdateCollection
                | ActionType::DeleteCollection
                | ActionType::LeaveCollection
        )
    }

    async fn load_local_to_store(&self) -> Result<()> {
        let collections = self.ctx.local.list_collections().await?;
        tracing::debug!(count = collections.len(), "Loaded collections");
        self.ctx
            .store
            .apply(StoreCommand::SetCollections(collections));
        Ok(())
    }

    async fn sync_all_remote_to_local(&self) -> Result<ReconcileReport> {
        let remote = self.ctx.api.list_collections().await?;
        let local = self.ctx.local.list_collections().await?;
        let protected = protected_ids(
            &self.ctx,
            local
                .iter()
                .filter(|collection| !collection.is_synced())
                .map(|collection| &collection.id),
        )
        .await?;

        let mut report = ReconcileReport::default();
        let keep: HashSet<EntityId> = remote.iter().map(|collection| collection.id.clone()).collect();
        for collection in remote {
            if protected.contains(&collection.id) {
                report.deferred += 1;
                continue;
            }
            if local.iter().any(|existing| existing == &collection) {
                continue;
            }
            self.ctx.local.upsert_collection(&collection).await?;
            report.upserted += 1;
        }

        let pruned = self.ctx.local.prune_collections(&keep, &protected).await?;
        report.pruned = pruned.len();
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), "Pruned collections deleted on the server");
        }
        self.ctx.store.apply(StoreCommand::SetCollections(
            self.ctx.local.list_collections().await?,
        ));
        Ok(report)
    }

    async fn process_queue_item(&self, item: &ActionQueueItem) -> Result<()> {
        let id = &item.related_entity_id;
        match item.action_type {
            ActionType::CreateCollection => self.upload(id, true).await,
            ActionType::UpdateCollection => self.upload(id, false).await,
            ActionType::DeleteCollection => self.ctx.api.delete_collection(id).await,
            ActionType::LeaveCollection => self.ctx.api.leave_collection(id).await,
            other => Err(Error::InvalidInput(format!(
                "{other} is not a collection action"
            ))),
        }
    }

    async fn handle_realtime_event(&self, event: &RealtimeEvent) -> Result<()> {
        match event {
            RealtimeEvent::CollectionCreated { collection }
            | RealtimeEvent::CollectionUpdated { collection }
            | RealtimeEvent::MembershipRoleChanged { collection, .. } => {
                self.apply_remote(collection).await
            }
            RealtimeEvent::CollectionDeleted { id } => self.drop_collection_locally(id).await,
            RealtimeEvent::MembershipJoined { collection, user_id } => {
                let known = self.ctx.local.get_collection(&collection.id).await?.is_some();
                self.store_collection(collection).await?;
                if !known {
                    let pulled = pull_notes_for_collection(&self.ctx, &collection.id).await?;
                    tracing::info!(
                        collection_id = %collection.id,
                        user_id = %user_id,
                        notes = pulled,
                        "Gained access to collection"
                    );
                }
                Ok(())
            }
            RealtimeEvent::MembershipLeft {
                collection_id,
                collection,
                ..
            } => match collection {
                Some(collection) => self.store_collection(collection).await,
                None => self.drop_collection_locally(collection_id).await,
            },
            _ => Ok(()),
        }
    }
}
