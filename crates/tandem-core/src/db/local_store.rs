//! Thread-safe facade over every repository.
//!
//! Domain code talks to the local database only through `LocalStore`, which
//! hands out entity-scoped repositories under one connection lock. Writes that
//! must land together (swaps, create cancellation, pruning, compaction) run in
//! a single explicit transaction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::Connection;
use tokio::sync::Mutex;

use super::{
    finish_transaction, CollectionRepository, Database, DocumentRepository,
    LibSqlCollectionRepository, LibSqlDocumentRepository, LibSqlNoteRepository,
    LibSqlQueueRepository, LibSqlSearchRepository, LibSqlSettingsRepository, LoggedUpdate,
    NoteRepository, QueueRepository, SearchHit, SearchRepository, SettingsRepository,
};
use crate::models::{
    document_name, ActionQueueItem, ActionStatus, ActionType, Collection, DocumentReplicaState,
    EntityId, Note, Setting,
};
use crate::Result;

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the store at `db_path`.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path).await?;
        tracing::debug!(path = %db_path.display(), "Opened local store");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    // Notes

    pub async fn list_notes(&self) -> Result<Vec<Note>> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection()).list().await
    }

    pub async fn get_note(&self, id: &EntityId) -> Result<Option<Note>> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection()).get(id).await
    }

    pub async fn notes_in_collection(&self, collection_id: &EntityId) -> Result<Vec<Note>> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .list_by_collection(collection_id)
            .await
    }

    pub async fn upsert_note(&self, note: &Note) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection()).upsert(note).await
    }

    /// Remove a note together with its document data and search row.
    pub async fn delete_note(&self, id: &EntityId) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = purge_note(conn, id).await;
        finish_transaction(conn, result).await
    }

    /// Full-reconciliation prune for notes; returns removed ids.
    pub async fn prune_notes(
        &self,
        keep: &HashSet<EntityId>,
        protected: &HashSet<EntityId>,
    ) -> Result<Vec<EntityId>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = prune_notes_in(conn, keep, protected).await;
        finish_transaction(conn, result).await
    }

    // Collections

    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        let db = self.db.lock().await;
        LibSqlCollectionRepository::new(db.connection()).list().await
    }

    pub async fn get_collection(&self, id: &EntityId) -> Result<Option<Collection>> {
        let db = self.db.lock().await;
        LibSqlCollectionRepository::new(db.connection()).get(id).await
    }

    pub async fn upsert_collection(&self, collection: &Collection) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlCollectionRepository::new(db.connection())
            .upsert(collection)
            .await
    }

    /// Remove a collection and every note inside it; returns the removed note ids.
    ///
    /// Queue items of the removed notes are dropped as well since their
    /// parent is gone.
    pub async fn delete_collection(&self, id: &EntityId) -> Result<Vec<EntityId>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = remove_collection_with_notes(conn, id).await;
        finish_transaction(conn, result).await
    }

    pub async fn prune_collections(
        &self,
        keep: &HashSet<EntityId>,
        protected: &HashSet<EntityId>,
    ) -> Result<Vec<EntityId>> {
        let db = self.db.lock().await;
        LibSqlCollectionRepository::new(db.connection())
            .delete_missing(keep, protected)
            .await
    }

    // Settings

    pub async fn list_settings(&self) -> Result<Vec<Setting>> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection()).list().await
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection()).get(key).await
    }

    pub async fn upsert_setting(&self, setting: &Setting) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection())
            .upsert(setting)
            .await
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection()).delete(key).await
    }

    pub async fn prune_settings(
        &self,
        keep: &HashSet<String>,
        protected: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection())
            .delete_missing(keep, protected)
            .await
    }

    // Action queue

    pub async fn insert_queue_item(&self, item: &ActionQueueItem) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).insert(item).await
    }

    pub async fn list_queue(&self) -> Result<Vec<ActionQueueItem>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).list().await
    }

    pub async fn list_queue_by_status(&self, status: ActionStatus) -> Result<Vec<ActionQueueItem>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .list_by_status(status)
            .await
    }

    pub async fn get_queue_item(&self, id: &str) -> Result<Option<ActionQueueItem>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).get(id).await
    }

    pub async fn set_queue_status(
        &self,
        id: &str,
        status: ActionStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .set_status(id, status, error)
            .await
    }

    pub async fn record_queue_failure(&self, id: &str, error: &str) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .record_failure(id, error)
            .await
    }

    pub async fn delete_queue_item(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).delete(id).await
    }

    pub async fn find_active_queue_item(
        &self,
        entity_id: &EntityId,
        types: &[ActionType],
        statuses: &[ActionStatus],
    ) -> Result<Option<ActionQueueItem>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .find_active(entity_id, types, statuses)
            .await
    }

    pub async fn reset_processing_queue_items(&self) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .reset_processing()
            .await
    }

    /// Ids of entities with pending or processing queue items.
    pub async fn active_queue_entities(&self) -> Result<HashSet<EntityId>> {
        Ok(self
            .list_queue()
            .await?
            .into_iter()
            .filter(|item| item.status.is_active())
            .map(|item| item.related_entity_id)
            .collect())
    }

    // Documents

    pub async fn list_document_states(&self) -> Result<Vec<DocumentReplicaState>> {
        let db = self.db.lock().await;
        LibSqlDocumentRepository::new(db.connection())
            .list_states()
            .await
    }

    pub async fn get_document_state(&self, note_id: &EntityId) -> Result<Option<DocumentReplicaState>> {
        let db = self.db.lock().await;
        LibSqlDocumentRepository::new(db.connection())
            .get_state(note_id)
            .await
    }

    pub async fn upsert_document_state(&self, state: &DocumentReplicaState) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlDocumentRepository::new(db.connection())
            .upsert_state(state)
            .await
    }

    pub async fn append_document_update(&self, doc_name: &str, data: &[u8]) -> Result<i64> {
        let db = self.db.lock().await;
        LibSqlDocumentRepository::new(db.connection())
            .append_update(doc_name, data)
            .await
    }

    pub async fn load_document_updates(&self, doc_name: &str) -> Result<Vec<LoggedUpdate>> {
        let db = self.db.lock().await;
        LibSqlDocumentRepository::new(db.connection())
            .load_updates(doc_name)
            .await
    }

    pub async fn count_document_updates(&self, doc_name: &str) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlDocumentRepository::new(db.connection())
            .count_updates(doc_name)
            .await
    }

    /// Replace log entries up to `up_to` with a merged snapshot.
    pub async fn compact_document(&self, doc_name: &str, snapshot: &[u8], up_to: i64) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = LibSqlDocumentRepository::new(conn)
            .replace_with_snapshot(doc_name, snapshot, up_to)
            .await;
        finish_transaction(conn, result).await
    }

    // Search rows

    pub async fn upsert_search_row(&self, note_id: &EntityId, title: &str, body: &str) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = LibSqlSearchRepository::new(conn)
            .upsert(note_id, title, body)
            .await;
        finish_transaction(conn, result).await
    }

    /// Replace the indexed title, keeping whatever body is indexed already.
    pub async fn retitle_search_row(&self, note_id: &EntityId, title: &str) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = retitle_search_in(conn, note_id, title).await;
        finish_transaction(conn, result).await
    }

    pub async fn remove_search_row(&self, note_id: &EntityId) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlSearchRepository::new(db.connection())
            .remove(note_id)
            .await
    }

    pub async fn search_notes(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let db = self.db.lock().await;
        LibSqlSearchRepository::new(db.connection())
            .search(query, limit)
            .await
    }

    // Multi-table transactions

    /// Replace a note's provisional row with its server counterpart.
    ///
    /// Queue references, the document replica (state row and update log) and
    /// the search row follow the new id in the same transaction. When the
    /// local row is already gone only the references are rewritten.
    pub async fn swap_note(&self, local_id: &EntityId, remote: &Note) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = swap_note_in(conn, local_id, remote).await;
        finish_transaction(conn, result).await
    }

    /// Replace a collection's provisional row and re-point its notes.
    ///
    /// Returns the number of notes whose `collection_id` was rewritten.
    pub async fn swap_collection(&self, local_id: &EntityId, remote: &Collection) -> Result<u64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = swap_collection_in(conn, local_id, remote).await;
        finish_transaction(conn, result).await
    }

    /// Drop a note that never reached the server.
    ///
    /// Returns `false` (and changes nothing) unless a pending `CREATE_NOTE`
    /// exists for it.
    pub async fn cancel_pending_note_create(&self, id: &EntityId) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = cancel_note_create_in(conn, id).await;
        finish_transaction(conn, result).await
    }

    /// Drop a collection that never reached the server, with its notes.
    ///
    /// Returns `None` when no pending `CREATE_COLLECTION` exists, otherwise the
    /// removed note ids.
    pub async fn cancel_pending_collection_create(
        &self,
        id: &EntityId,
    ) -> Result<Option<Vec<EntityId>>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = cancel_collection_create_in(conn, id).await;
        finish_transaction(conn, result).await
    }
}

async fn prune_notes_in(
    conn: &Connection,
    keep: &HashSet<EntityId>,
    protected: &HashSet<EntityId>,
) -> Result<Vec<EntityId>> {
    let removed = LibSqlNoteRepository::new(conn)
        .delete_missing(keep, protected)
        .await?;
    for id in &removed {
        purge_note(conn, id).await?;
    }
    Ok(removed)
}

async fn swap_note_in(conn: &Connection, local_id: &EntityId, remote: &Note) -> Result<()> {
    let notes = LibSqlNoteRepository::new(conn);
    if notes.get(local_id).await?.is_some() || local_id == &remote.id {
        notes.swap(local_id, remote).await?;
    }
    if local_id != &remote.id {
        LibSqlQueueRepository::new(conn)
            .rewrite_entity_id(local_id, &remote.id)
            .await?;
        LibSqlDocumentRepository::new(conn)
            .rename(local_id, &remote.id)
            .await?;
        LibSqlSearchRepository::new(conn)
            .rename(local_id, &remote.id)
            .await?;
    }
    Ok(())
}

async fn swap_collection_in(
    conn: &Connection,
    local_id: &EntityId,
    remote: &Collection,
) -> Result<u64> {
    let collections = LibSqlCollectionRepository::new(conn);
    if collections.get(local_id).await?.is_some() || local_id == &remote.id {
        collections.swap(local_id, remote).await?;
    }
    if local_id == &remote.id {
        return Ok(0);
    }
    let moved = LibSqlNoteRepository::new(conn)
        .reassign_collection(local_id, &remote.id)
        .await?;
    LibSqlQueueRepository::new(conn)
        .rewrite_entity_id(local_id, &remote.id)
        .await?;
    Ok(moved)
}

async fn cancel_note_create_in(conn: &Connection, id: &EntityId) -> Result<bool> {
    let queue = LibSqlQueueRepository::new(conn);
    let pending = queue
        .find_active(id, &[ActionType::CreateNote], &[ActionStatus::Pending])
        .await?;
    if pending.is_none() {
        return Ok(false);
    }
    queue.delete_for_entity(id).await?;
    purge_note(conn, id).await?;
    Ok(true)
}

async fn cancel_collection_create_in(
    conn: &Connection,
    id: &EntityId,
) -> Result<Option<Vec<EntityId>>> {
    let queue = LibSqlQueueRepository::new(conn);
    let pending = queue
        .find_active(id, &[ActionType::CreateCollection], &[ActionStatus::Pending])
        .await?;
    if pending.is_none() {
        return Ok(None);
    }
    queue.delete_for_entity(id).await?;
    Ok(Some(remove_collection_with_notes(conn, id).await?))
}

async fn retitle_search_in(conn: &Connection, note_id: &EntityId, title: &str) -> Result<()> {
    let search = LibSqlSearchRepository::new(conn);
    let body = search.body(note_id).await?.unwrap_or_default();
    search.upsert(note_id, title, &body).await
}

async fn purge_note(conn: &Connection, id: &EntityId) -> Result<bool> {
    let removed = LibSqlNoteRepository::new(conn).delete(id).await?;
    let documents = LibSqlDocumentRepository::new(conn);
    documents.delete_state(id).await?;
    documents.delete_updates(&document_name(id)).await?;
    LibSqlSearchRepository::new(conn).remove(id).await?;
    Ok(removed)
}

async fn remove_collection_with_notes(conn: &Connection, id: &EntityId) -> Result<Vec<EntityId>> {
    let notes = LibSqlNoteRepository::new(conn).list_by_collection(id).await?;
    let queue = LibSqlQueueRepository::new(conn);
    let mut removed = Vec::with_capacity(notes.len());
    for note in notes {
        queue.delete_for_entity(&note.id).await?;
        purge_note(conn, &note.id).await?;
        removed.push(note.id);
    }
    LibSqlCollectionRepository::new(conn).delete(id).await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn note_in(collection: Option<&EntityId>) -> Note {
        Note::new("note", collection.cloned())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn swap_collection_rewrites_every_reference() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let local = Collection::new("Trip");
        store.upsert_collection(&local).await.unwrap();
        let first = note_in(Some(&local.id));
        let second = note_in(Some(&local.id));
        let unrelated = note_in(None);
        for note in [&first, &second, &unrelated] {
            store.upsert_note(note).await.unwrap();
        }
        store
            .insert_queue_item(&ActionQueueItem::new(
                ActionType::UpdateCollection,
                local.id.clone(),
                1,
            ))
            .await
            .unwrap();

        let remote = Collection {
            id: EntityId::new("srv-c"),
            server_created_at: Some(100),
            ..local.clone()
        };
        let moved = store.swap_collection(&local.id, &remote).await.unwrap();

        assert_eq!(moved, 2);
        assert!(store.get_collection(&local.id).await.unwrap().is_none());
        assert!(store.get_collection(&remote.id).await.unwrap().is_some());
        let notes = store.list_notes().await.unwrap();
        assert!(notes
            .iter()
            .all(|note| note.collection_id.as_ref() != Some(&local.id)));
        assert_eq!(store.notes_in_collection(&remote.id).await.unwrap().len(), 2);
        assert_eq!(
            store.list_queue().await.unwrap()[0].related_entity_id,
            remote.id
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn swap_note_with_identical_id_is_plain_update() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let note = Note {
            id: EntityId::new("srv-1"),
            ..note_in(None)
        };
        store.upsert_note(&note).await.unwrap();
        store
            .upsert_document_state(&DocumentReplicaState::new(note.id.clone(), 1))
            .await
            .unwrap();

        let refreshed = Note {
            server_updated_at: Some(42),
            ..note.clone()
        };
        store.swap_note(&note.id, &refreshed).await.unwrap();

        assert_eq!(store.list_notes().await.unwrap(), vec![refreshed]);
        assert!(store.get_document_state(&note.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn swap_note_moves_document_and_search_rows() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let local = note_in(None);
        store.upsert_note(&local).await.unwrap();
        store
            .append_document_update(&document_name(&local.id), b"body")
            .await
            .unwrap();
        store
            .upsert_search_row(&local.id, "note", "hello world")
            .await
            .unwrap();

        let remote = Note {
            id: EntityId::new("srv-9"),
            ..local.clone()
        };
        store.swap_note(&local.id, &remote).await.unwrap();

        assert_eq!(
            store
                .count_document_updates(&document_name(&remote.id))
                .await
                .unwrap(),
            1
        );
        let hits = store.search_notes("hello", 10).await.unwrap();
        assert_eq!(hits[0].note_id, remote.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn swap_note_does_not_resurrect_deleted_row() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let local_id = EntityId::mint_local();
        let remote = Note {
            id: EntityId::new("srv-2"),
            ..note_in(None)
        };

        store.swap_note(&local_id, &remote).await.unwrap();

        assert!(store.list_notes().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_pending_create_removes_row_and_queue_items() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let note = note_in(None);
        store.upsert_note(&note).await.unwrap();
        store
            .insert_queue_item(&ActionQueueItem::new(ActionType::CreateNote, note.id.clone(), 1))
            .await
            .unwrap();

        assert!(store.cancel_pending_note_create(&note.id).await.unwrap());
        assert!(store.list_notes().await.unwrap().is_empty());
        assert!(store.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_is_refused_while_create_is_processing() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let note = note_in(None);
        store.upsert_note(&note).await.unwrap();
        let item = ActionQueueItem::new(ActionType::CreateNote, note.id.clone(), 1);
        store.insert_queue_item(&item).await.unwrap();
        store
            .set_queue_status(&item.id, ActionStatus::Processing, None)
            .await
            .unwrap();

        assert!(!store.cancel_pending_note_create(&note.id).await.unwrap());
        assert_eq!(store.list_notes().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_pending_collection_takes_its_notes() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let collection = Collection::new("Drafts");
        store.upsert_collection(&collection).await.unwrap();
        let inner = note_in(Some(&collection.id));
        store.upsert_note(&inner).await.unwrap();
        for (action, id) in [
            (ActionType::CreateCollection, &collection.id),
            (ActionType::CreateNote, &inner.id),
        ] {
            store
                .insert_queue_item(&ActionQueueItem::new(action, id.clone(), 1))
                .await
                .unwrap();
        }

        let removed = store
            .cancel_pending_collection_create(&collection.id)
            .await
            .unwrap();

        assert_eq!(removed, Some(vec![inner.id.clone()]));
        assert!(store.list_collections().await.unwrap().is_empty());
        assert!(store.list_notes().await.unwrap().is_empty());
        assert!(store.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prune_notes_keeps_server_list_and_protected() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let ids: Vec<EntityId> = ["A", "B", "C"].into_iter().map(EntityId::from).collect();
        for id in &ids {
            store
                .upsert_note(&Note {
                    id: id.clone(),
                    ..note_in(None)
                })
                .await
                .unwrap();
        }

        let keep: HashSet<EntityId> = [ids[0].clone(), ids[2].clone()].into_iter().collect();
        let removed = store.prune_notes(&keep, &HashSet::new()).await.unwrap();

        assert_eq!(removed, vec![ids[1].clone()]);
        let mut remaining: Vec<EntityId> = store
            .list_notes()
            .await
            .unwrap()
            .into_iter()
            .map(|note| note.id)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![ids[0].clone(), ids[2].clone()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("tandem.db");
        let store = LocalStore::open_path(&path).await.unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(path.exists());
    }
}
