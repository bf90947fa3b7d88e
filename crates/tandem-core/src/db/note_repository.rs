//! Note repository implementation

use std::collections::HashSet;

use libsql::{Connection, Row};

use super::{int_or_null, optional_int, optional_text, text_or_null};
use crate::error::Result;
use crate::models::{EntityId, Note};

const NOTE_COLUMNS: &str = "id, title, description, collection_id, created_at, updated_at, \
     server_created_at, server_updated_at, document_replica_id";

/// Trait for note storage operations (async)
#[allow(async_fn_in_trait)]
pub trait NoteRepository {
    /// All notes, most recently updated first
    async fn list(&self) -> Result<Vec<Note>>;

    async fn get(&self, id: &EntityId) -> Result<Option<Note>>;

    async fn list_by_collection(&self, collection_id: &EntityId) -> Result<Vec<Note>>;

    /// Insert or overwrite the row keyed by `note.id`
    async fn upsert(&self, note: &Note) -> Result<()>;

    /// Returns whether a row was removed
    async fn delete(&self, id: &EntityId) -> Result<bool>;

    /// Delete every note not in `keep` and not in `protected`; returns the removed ids
    async fn delete_missing(
        &self,
        keep: &HashSet<EntityId>,
        protected: &HashSet<EntityId>,
    ) -> Result<Vec<EntityId>>;

    /// Replace the row at `local_id` with `remote` (same transaction as the caller)
    async fn swap(&self, local_id: &EntityId, remote: &Note) -> Result<()>;

    /// Point every note of `from` at collection `to`; returns affected rows
    async fn reassign_collection(&self, from: &EntityId, to: &EntityId) -> Result<u64>;
}

/// libSQL implementation of `NoteRepository`
pub struct LibSqlNoteRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlNoteRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_note(row: &Row) -> Result<Note> {
        Ok(Note {
            id: EntityId::new(row.get::<String>(0)?),
            title: row.get(1)?,
            description: optional_text(row.get_value(2)?),
            collection_id: optional_text(row.get_value(3)?).map(EntityId::new),
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            server_created_at: optional_int(row.get_value(6)?),
            server_updated_at: optional_int(row.get_value(7)?),
            document_replica_id: optional_text(row.get_value(8)?).map(EntityId::new),
        })
    }

    async fn query_notes(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Note>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut notes = Vec::new();
        while let Some(row) = rows.next().await? {
            notes.push(Self::parse_note(&row)?);
        }
        Ok(notes)
    }
}

impl NoteRepository for LibSqlNoteRepository<'_> {
    async fn list(&self) -> Result<Vec<Note>> {
        self.query_notes(
            &format!("SELECT {NOTE_COLUMNS} FROM notes ORDER BY updated_at DESC, id ASC"),
            (),
        )
        .await
    }

    async fn get(&self, id: &EntityId) -> Result<Option<Note>> {
        let notes = self
            .query_notes(
                &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?"),
                libsql::params![id.as_str()],
            )
            .await?;
        Ok(notes.into_iter().next())
    }

    async fn list_by_collection(&self, collection_id: &EntityId) -> Result<Vec<Note>> {
        self.query_notes(
            &format!(
                "SELECT {NOTE_COLUMNS} FROM notes WHERE collection_id = ? ORDER BY updated_at DESC"
            ),
            libsql::params![collection_id.as_str()],
        )
        .await
    }

    async fn upsert(&self, note: &Note) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notes (id, title, description, collection_id, created_at, updated_at,
                    server_created_at, server_updated_at, document_replica_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    collection_id = excluded.collection_id,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    server_created_at = excluded.server_created_at,
                    server_updated_at = excluded.server_updated_at,
                    document_replica_id = excluded.document_replica_id",
                libsql::params![
                    note.id.as_str(),
                    note.title.as_str(),
                    text_or_null(note.description.as_deref()),
                    text_or_null(note.collection_id.as_ref().map(EntityId::as_str)),
                    note.created_at,
                    note.updated_at,
                    int_or_null(note.server_created_at),
                    int_or_null(note.server_updated_at),
                    text_or_null(note.document_replica_id.as_ref().map(EntityId::as_str)),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &EntityId) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM notes WHERE id = ?", libsql::params![id.as_str()])
            .await?;
        Ok(affected > 0)
    }

    async fn delete_missing(
        &self,
        keep: &HashSet<EntityId>,
        protected: &HashSet<EntityId>,
    ) -> Result<Vec<EntityId>> {
        let mut removed = Vec::new();
        for note in self.list().await? {
            if keep.contains(&note.id) || protected.contains(&note.id) {
                continue;
            }
            self.delete(&note.id).await?;
            removed.push(note.id);
        }
        Ok(removed)
    }

    async fn swap(&self, local_id: &EntityId, remote: &Note) -> Result<()> {
        self.upsert(remote).await?;
        if local_id != &remote.id {
            self.delete(local_id).await?;
        }
        Ok(())
    }

    async fn reassign_collection(&self, from: &EntityId, to: &EntityId) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "UPDATE notes SET collection_id = ? WHERE collection_id = ?",
                libsql::params![to.as_str(), from.as_str()],
            )
            .await?;
        Ok(affected)
    }
}
