//! Per-entity-kind sync logic.
//!
//! Each service loads its entities from the local store into the reactive
//! store, reconciles them against the server's full list, delivers queued
//! mutations of its kind and applies realtime events directly.

mod collection;
mod document;
mod note;
mod settings;

pub use collection::CollectionSyncService;
pub use document::DocumentStateSync;
pub use note::NoteSyncService;
pub use settings::SettingsSyncService;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::RemoteApi;
use crate::db::LocalStore;
use crate::models::{ActionQueueItem, ActionType, EntityId, Note};
use crate::queue::ActionQueue;
use crate::realtime::RealtimeEvent;
use crate::search::SearchIndex;
use crate::store::{Store, StoreCommand};
use crate::sync::SwapListener;
use crate::Result;

/// Shared handles every service works through.
#[derive(Clone)]
pub struct SyncContext {
    pub local: LocalStore,
    pub store: Store,
    pub queue: Arc<ActionQueue>,
    pub api: Arc<dyn RemoteApi>,
    pub search: SearchIndex,
    pub swap_listener: Option<Arc<dyn SwapListener>>,
}

/// Counts from one full remote-to-local pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub pruned: usize,
    /// Server rows skipped because a local mutation is still queued
    pub deferred: usize,
}

#[async_trait]
pub trait DomainSyncService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `process_queue_item` accepts this action type.
    fn handles(&self, action: ActionType) -> bool;

    /// Replace the store's view with what is persisted locally.
    async fn load_local_to_store(&self) -> Result<()>;

    /// Make local state match the server's full list for this kind.
    async fn sync_all_remote_to_local(&self) -> Result<ReconcileReport>;

    /// Deliver one queued mutation. A not-found error means the target is
    /// already gone server-side.
    async fn process_queue_item(&self, item: &ActionQueueItem) -> Result<()>;

    /// Apply a peer's change directly; events of other kinds are ignored.
    async fn handle_realtime_event(&self, event: &RealtimeEvent) -> Result<()>;
}

/// Whether an incoming row should overwrite the local one.
///
/// Later `updated_at` wins; ties go to the server copy.
pub(crate) fn remote_wins(local_updated_at: Option<i64>, remote_updated_at: i64) -> bool {
    local_updated_at.map_or(true, |local| remote_updated_at >= local)
}

/// Reconcile the notes of one collection against the server.
///
/// Used after joining a collection, where a full pass would be wasteful.
pub(crate) async fn pull_notes_for_collection(
    ctx: &SyncContext,
    collection_id: &EntityId,
) -> Result<usize> {
    let remote: Vec<Note> = ctx
        .api
        .list_notes()
        .await?
        .into_iter()
        .filter(|note| note.collection_id.as_ref() == Some(collection_id))
        .collect();
    let protected = ctx.local.active_queue_entities().await?;
    let mut pulled = 0;
    for note in remote {
        if protected.contains(&note.id) {
            continue;
        }
        ctx.local.upsert_note(&note).await?;
        ctx.search.retitle(&note.id, &note.title).await?;
        ctx.store.apply(StoreCommand::UpsertNote(note));
        pulled += 1;
    }
    Ok(pulled)
}

/// Ids that a reconciliation prune must leave alone: anything with queued
/// work plus anything that never reached the server.
pub(crate) async fn protected_ids<'a>(
    ctx: &SyncContext,
    provisional: impl Iterator<Item = &'a EntityId>,
) -> Result<HashSet<EntityId>> {
    let mut protected = ctx.local.active_queue_entities().await?;
    protected.extend(provisional.cloned());
    Ok(protected)
}
