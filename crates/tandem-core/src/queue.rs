//! Durable outbox of pending mutations.
//!
//! Every mutator writes to the local database first and only then updates the
//! in-memory queue view, so a crash never loses an action the user saw succeed.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::broadcast;

use crate::db::LocalStore;
use crate::models::{ActionQueueItem, ActionStatus, ActionType, EntityId, EntityKind};
use crate::store::{Store, StoreCommand};
use crate::util::now_ms;
use crate::Result;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Notification emitted after a durable queue mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueChange {
    Enqueued(ActionQueueItem),
    StatusChanged { id: String, status: ActionStatus },
    Removed(String),
    Reloaded,
}

pub struct ActionQueue {
    local: LocalStore,
    store: Store,
    changes: broadcast::Sender<QueueChange>,
    last_created_at: AtomicI64,
}

impl ActionQueue {
    pub fn new(local: LocalStore, store: Store) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            local,
            store,
            changes,
            last_created_at: AtomicI64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueChange> {
        self.changes.subscribe()
    }

    /// Put items left `processing` by an interrupted run back to `pending`.
    ///
    /// Only safe while nothing in this process is draining the queue.
    /// Returns the number of reset items.
    pub async fn resume_interrupted(&self) -> Result<u64> {
        let reset = self.local.reset_processing_queue_items().await?;
        if reset > 0 {
            tracing::info!(reset, "Resumed interrupted queue items");
        }
        Ok(reset)
    }

    /// Load persisted items into the store as they are. Also used after a
    /// bulk change made outside this type.
    pub async fn load_local_to_store(&self) -> Result<()> {
        let items = self.local.list_queue().await?;
        if let Some(latest) = items.iter().map(|item| item.created_at).max() {
            self.last_created_at.fetch_max(latest, Ordering::SeqCst);
        }
        self.store.apply(StoreCommand::SetQueue(items));
        self.notify(QueueChange::Reloaded);
        Ok(())
    }

    /// Persist a new pending item, then publish it.
    pub async fn enqueue(
        &self,
        action_type: ActionType,
        related_entity_id: EntityId,
    ) -> Result<ActionQueueItem> {
        let item = ActionQueueItem::new(action_type, related_entity_id, self.next_created_at());
        self.local.insert_queue_item(&item).await?;
        tracing::debug!(
            item_id = %item.id,
            action = %item.action_type,
            entity_id = %item.related_entity_id,
            "Enqueued action"
        );
        self.store.apply(StoreCommand::UpsertQueueItem(item.clone()));
        self.notify(QueueChange::Enqueued(item.clone()));
        Ok(item)
    }

    /// Enqueue unless a pending create/update already covers the entity.
    ///
    /// Create and update handlers read the latest local row when they run, so
    /// one pending item carries every later edit. Items already `processing`
    /// do not count: their payload may predate this edit.
    pub async fn enqueue_coalesced(
        &self,
        action_type: ActionType,
        related_entity_id: EntityId,
    ) -> Result<Option<ActionQueueItem>> {
        if action_type.is_upsert() {
            let covering = covering_types(action_type.kind());
            if let Some(existing) = self
                .local
                .find_active_queue_item(&related_entity_id, covering, &[ActionStatus::Pending])
                .await?
            {
                tracing::debug!(
                    existing = %existing.id,
                    action = %action_type,
                    entity_id = %related_entity_id,
                    "Coalesced into pending action"
                );
                return Ok(None);
            }
        }
        self.enqueue(action_type, related_entity_id).await.map(Some)
    }

    /// All pending items, oldest first.
    pub async fn dequeue_all(&self) -> Result<Vec<ActionQueueItem>> {
        self.local.list_queue_by_status(ActionStatus::Pending).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ActionQueueItem>> {
        self.local.get_queue_item(id).await
    }

    pub async fn mark_processing(&self, id: &str) -> Result<()> {
        self.set_status(id, ActionStatus::Processing, None).await
    }

    pub async fn mark_pending(&self, id: &str) -> Result<()> {
        self.set_status(id, ActionStatus::Pending, None).await
    }

    /// Park an item that will never succeed; it is not retried.
    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        self.set_status(id, ActionStatus::Error, Some(message)).await
    }

    /// Revert to pending after a retryable failure, keeping the error text.
    pub async fn record_failure(&self, id: &str, message: &str) -> Result<()> {
        if self.local.record_queue_failure(id, message).await? {
            self.refresh_item(id).await?;
            self.notify(QueueChange::StatusChanged {
                id: id.to_string(),
                status: ActionStatus::Pending,
            });
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.local.delete_queue_item(id).await?;
        self.store.apply(StoreCommand::RemoveQueueItem(id.to_string()));
        self.notify(QueueChange::Removed(id.to_string()));
        Ok(())
    }

    /// Whether any pending or processing item references `entity_id`.
    pub async fn has_active(&self, entity_id: &EntityId) -> Result<bool> {
        Ok(self
            .local
            .find_active_queue_item(
                entity_id,
                &ActionType::ALL,
                &[ActionStatus::Pending, ActionStatus::Processing],
            )
            .await?
            .is_some())
    }

    async fn set_status(&self, id: &str, status: ActionStatus, error: Option<&str>) -> Result<()> {
        if self.local.set_queue_status(id, status, error).await? {
            self.refresh_item(id).await?;
            self.notify(QueueChange::StatusChanged {
                id: id.to_string(),
                status,
            });
        }
        Ok(())
    }

    async fn refresh_item(&self, id: &str) -> Result<()> {
        if let Some(item) = self.local.get_queue_item(id).await? {
            self.store.apply(StoreCommand::UpsertQueueItem(item));
        }
        Ok(())
    }

    // Strictly increasing so items enqueued within one millisecond keep their order.
    fn next_created_at(&self) -> i64 {
        let now = now_ms();
        let previous = self
            .last_created_at
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn notify(&self, change: QueueChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

const fn covering_types(kind: EntityKind) -> &'static [ActionType] {
    match kind {
        EntityKind::Note => &[ActionType::CreateNote, ActionType::UpdateNote],
        EntityKind::Collection => &[ActionType::CreateCollection, ActionType::UpdateCollection],
        EntityKind::Setting => &[ActionType::UpdateSetting],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn setup() -> (ActionQueue, Store, LocalStore) {
        let local = LocalStore::open_in_memory().await.unwrap();
        let store = Store::new();
        (ActionQueue::new(local.clone(), store.clone()), store, local)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_is_durable_before_visible() {
        let (queue, store, local) = setup().await;
        let mut changes = queue.subscribe();

        let item = queue
            .enqueue(ActionType::CreateNote, EntityId::new("local-1"))
            .await
            .unwrap();

        assert_eq!(local.list_queue().await.unwrap(), vec![item.clone()]);
        assert_eq!(store.snapshot().queue, vec![item.clone()]);
        assert_eq!(changes.recv().await.unwrap(), QueueChange::Enqueued(item));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dequeue_all_is_ordered_and_pending_only() {
        let (queue, _, _) = setup().await;
        let first = queue
            .enqueue(ActionType::CreateCollection, EntityId::new("c"))
            .await
            .unwrap();
        let second = queue
            .enqueue(ActionType::CreateNote, EntityId::new("n"))
            .await
            .unwrap();
        let third = queue
            .enqueue(ActionType::DeleteNote, EntityId::new("m"))
            .await
            .unwrap();
        queue.mark_processing(&second.id).await.unwrap();

        let ids: Vec<String> = queue
            .dequeue_all()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(ids, vec![first.id, third.id]);
        assert!(first.created_at < second.created_at && second.created_at < third.created_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn updates_coalesce_into_pending_create() {
        let (queue, store, _) = setup().await;
        let id = EntityId::new("local-n");
        queue.enqueue(ActionType::CreateNote, id.clone()).await.unwrap();

        let coalesced = queue
            .enqueue_coalesced(ActionType::UpdateNote, id.clone())
            .await
            .unwrap();
        assert!(coalesced.is_none());
        assert_eq!(store.snapshot().queue.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn processing_create_does_not_absorb_update() {
        let (queue, store, _) = setup().await;
        let id = EntityId::new("local-n");
        let create = queue.enqueue(ActionType::CreateNote, id.clone()).await.unwrap();
        queue.mark_processing(&create.id).await.unwrap();

        let update = queue
            .enqueue_coalesced(ActionType::UpdateNote, id)
            .await
            .unwrap();
        assert!(update.is_some());
        assert_eq!(store.snapshot().queue.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deletes_are_never_coalesced() {
        let (queue, _, _) = setup().await;
        let id = EntityId::new("srv-n");
        queue.enqueue(ActionType::UpdateNote, id.clone()).await.unwrap();
        assert!(queue
            .enqueue_coalesced(ActionType::DeleteNote, id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_items_resume_only_on_request() {
        let (queue, store, local) = setup().await;
        let item = ActionQueueItem::new(ActionType::UpdateNote, EntityId::new("n"), 10);
        local.insert_queue_item(&item).await.unwrap();
        local
            .set_queue_status(&item.id, ActionStatus::Processing, None)
            .await
            .unwrap();

        queue.load_local_to_store().await.unwrap();
        assert_eq!(store.snapshot().queue[0].status, ActionStatus::Processing);

        assert_eq!(queue.resume_interrupted().await.unwrap(), 1);
        queue.load_local_to_store().await.unwrap();
        assert_eq!(store.snapshot().queue[0].status, ActionStatus::Pending);

        let next = queue
            .enqueue(ActionType::UpdateNote, EntityId::new("m"))
            .await
            .unwrap();
        assert!(next.created_at > 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_and_error_bookkeeping() {
        let (queue, store, _) = setup().await;
        let item = queue
            .enqueue(ActionType::UpdateNote, EntityId::new("n"))
            .await
            .unwrap();

        queue.record_failure(&item.id, "503 unavailable").await.unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.queue[0].attempts, 1);
        assert_eq!(snapshot.queue[0].status, ActionStatus::Pending);

        queue.mark_error(&item.id, "rejected").await.unwrap();
        assert_eq!(store.snapshot().queue[0].status, ActionStatus::Error);
        assert!(queue.dequeue_all().await.unwrap().is_empty());

        queue.remove(&item.id).await.unwrap();
        assert!(store.snapshot().queue.is_empty());
    }
}
