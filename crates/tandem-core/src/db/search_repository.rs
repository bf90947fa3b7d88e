//! Full-text index rows for note bodies

use libsql::Connection;

use crate::error::Result;
use crate::models::EntityId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub note_id: EntityId,
    pub title: String,
}

/// Storage for the FTS5 `note_search` table
#[allow(async_fn_in_trait)]
pub trait SearchRepository {
    async fn upsert(&self, note_id: &EntityId, title: &str, body: &str) -> Result<()>;

    async fn remove(&self, note_id: &EntityId) -> Result<bool>;

    async fn rename(&self, from: &EntityId, to: &EntityId) -> Result<()>;

    /// Indexed body text, if the note has a row
    async fn body(&self, note_id: &EntityId) -> Result<Option<String>>;

    /// Match an FTS5 query expression, best matches first
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

pub struct LibSqlSearchRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSearchRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SearchRepository for LibSqlSearchRepository<'_> {
    async fn upsert(&self, note_id: &EntityId, title: &str, body: &str) -> Result<()> {
        self.remove(note_id).await?;
        self.conn
            .execute(
                "INSERT INTO note_search (note_id, title, body) VALUES (?, ?, ?)",
                libsql::params![note_id.as_str(), title, body],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, note_id: &EntityId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM note_search WHERE note_id = ?",
                libsql::params![note_id.as_str()],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn rename(&self, from: &EntityId, to: &EntityId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE note_search SET note_id = ? WHERE note_id = ?",
                libsql::params![to.as_str(), from.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn body(&self, note_id: &EntityId) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT body FROM note_search WHERE note_id = ? LIMIT 1",
                libsql::params![note_id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT note_id, title FROM note_search WHERE note_search MATCH ? ORDER BY rank LIMIT ?",
                libsql::params![query, limit],
            )
            .await?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next().await? {
            hits.push(SearchHit {
                note_id: EntityId::new(row.get::<String>(0)?),
                title: row.get(1)?,
            });
        }
        Ok(hits)
    }
}
