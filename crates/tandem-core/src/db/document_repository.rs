//! Document replica state and update log persistence

use libsql::{Connection, Value};

use crate::error::{Error, Result};
use crate::models::{document_name, DocumentReplicaState, EntityId};
use crate::util::now_ms;

/// One entry of a document's append log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedUpdate {
    pub id: i64,
    pub data: Vec<u8>,
}

/// Storage for document revision markers and the append-only update log
#[allow(async_fn_in_trait)]
pub trait DocumentRepository {
    async fn list_states(&self) -> Result<Vec<DocumentReplicaState>>;

    async fn get_state(&self, note_id: &EntityId) -> Result<Option<DocumentReplicaState>>;

    async fn upsert_state(&self, state: &DocumentReplicaState) -> Result<()>;

    async fn delete_state(&self, note_id: &EntityId) -> Result<bool>;

    /// Append an update blob; returns its log id
    async fn append_update(&self, doc_name: &str, data: &[u8]) -> Result<i64>;

    /// Log entries in append order
    async fn load_updates(&self, doc_name: &str) -> Result<Vec<LoggedUpdate>>;

    async fn count_updates(&self, doc_name: &str) -> Result<u64>;

    /// Drop entries up to and including `up_to` and store `snapshot` in their place
    async fn replace_with_snapshot(&self, doc_name: &str, snapshot: &[u8], up_to: i64) -> Result<()>;

    async fn delete_updates(&self, doc_name: &str) -> Result<u64>;

    /// Move the state row and update log of `from` to `to`
    async fn rename(&self, from: &EntityId, to: &EntityId) -> Result<()>;
}

/// libSQL implementation of `DocumentRepository`
pub struct LibSqlDocumentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlDocumentRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_state(row: &libsql::Row) -> Result<DocumentReplicaState> {
        Ok(DocumentReplicaState {
            id: EntityId::new(row.get::<String>(0)?),
            note_id: EntityId::new(row.get::<String>(1)?),
            updated_at: row.get(2)?,
        })
    }
}

impl DocumentRepository for LibSqlDocumentRepository<'_> {
    async fn list_states(&self) -> Result<Vec<DocumentReplicaState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, note_id, updated_at FROM document_replica_state ORDER BY id",
                (),
            )
            .await?;
        let mut states = Vec::new();
        while let Some(row) = rows.next().await? {
            states.push(Self::parse_state(&row)?);
        }
        Ok(states)
    }

    async fn get_state(&self, note_id: &EntityId) -> Result<Option<DocumentReplicaState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, note_id, updated_at FROM document_replica_state WHERE note_id = ?",
                libsql::params![note_id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_state(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_state(&self, state: &DocumentReplicaState) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO document_replica_state (id, note_id, updated_at) VALUES (?, ?, ?)",
                libsql::params![state.id.as_str(), state.note_id.as_str(), state.updated_at],
            )
            .await?;
        Ok(())
    }

    async fn delete_state(&self, note_id: &EntityId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM document_replica_state WHERE note_id = ?",
                libsql::params![note_id.as_str()],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn append_update(&self, doc_name: &str, data: &[u8]) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO document_updates (doc_name, data, created_at) VALUES (?, ?, ?)",
                libsql::params![doc_name, Value::Blob(data.to_vec()), now_ms()],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn load_updates(&self, doc_name: &str) -> Result<Vec<LoggedUpdate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, data FROM document_updates WHERE doc_name = ? ORDER BY id ASC",
                libsql::params![doc_name],
            )
            .await?;
        let mut updates = Vec::new();
        while let Some(row) = rows.next().await? {
            let data = match row.get_value(1)? {
                Value::Blob(bytes) => bytes,
                other => {
                    return Err(Error::Database(format!(
                        "unexpected update payload type for {doc_name}: {other:?}"
                    )))
                }
            };
            updates.push(LoggedUpdate {
                id: row.get(0)?,
                data,
            });
        }
        Ok(updates)
    }

    async fn count_updates(&self, doc_name: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM document_updates WHERE doc_name = ?",
                libsql::params![doc_name],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn replace_with_snapshot(&self, doc_name: &str, snapshot: &[u8], up_to: i64) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM document_updates WHERE doc_name = ? AND id <= ?",
                libsql::params![doc_name, up_to],
            )
            .await?;
        // Keep the snapshot ahead of entries appended after `up_to`
        self.conn
            .execute(
                "INSERT INTO document_updates (id, doc_name, data, created_at) VALUES (?, ?, ?, ?)",
                libsql::params![up_to, doc_name, Value::Blob(snapshot.to_vec()), now_ms()],
            )
            .await?;
        Ok(())
    }

    async fn delete_updates(&self, doc_name: &str) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM document_updates WHERE doc_name = ?",
                libsql::params![doc_name],
            )
            .await?;
        Ok(affected)
    }

    async fn rename(&self, from: &EntityId, to: &EntityId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE document_replica_state SET id = ?, note_id = ? WHERE note_id = ?",
                libsql::params![to.as_str(), to.as_str(), from.as_str()],
            )
            .await?;
        self.conn
            .execute(
                "UPDATE document_updates SET doc_name = ? WHERE doc_name = ?",
                libsql::params![document_name(to), document_name(from)],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_append_and_load_in_order() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlDocumentRepository::new(db.connection());

        repo.append_update("note:n1", b"one").await.unwrap();
        repo.append_update("note:n1", b"two").await.unwrap();
        repo.append_update("note:n2", b"other").await.unwrap();

        let updates = repo.load_updates("note:n1").await.unwrap();
        let payloads: Vec<&[u8]> = updates.iter().map(|u| u.data.as_slice()).collect();
        assert_eq!(payloads, vec![b"one".as_slice(), b"two".as_slice()]);
        assert_eq!(repo.count_updates("note:n2").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_replaces_older_entries_only() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlDocumentRepository::new(db.connection());

        repo.append_update("note:n1", b"a").await.unwrap();
        let second = repo.append_update("note:n1", b"b").await.unwrap();
        repo.append_update("note:n1", b"late").await.unwrap();

        repo.replace_with_snapshot("note:n1", b"ab", second).await.unwrap();

        let payloads: Vec<Vec<u8>> = repo
            .load_updates("note:n1")
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.data)
            .collect();
        assert_eq!(payloads, vec![b"ab".to_vec(), b"late".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rename_moves_state_and_log() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlDocumentRepository::new(db.connection());
        let from = EntityId::new("local-n");
        let to = EntityId::new("srv-n");

        repo.upsert_state(&DocumentReplicaState::new(from.clone(), 10))
            .await
            .unwrap();
        repo.append_update(&document_name(&from), b"x").await.unwrap();

        repo.rename(&from, &to).await.unwrap();

        assert!(repo.get_state(&from).await.unwrap().is_none());
        assert_eq!(
            repo.get_state(&to).await.unwrap(),
            Some(DocumentReplicaState::new(to.clone(), 10))
        );
        assert_eq!(repo.count_updates(&document_name(&to)).await.unwrap(), 1);
        assert_eq!(repo.count_updates(&document_name(&from)).await.unwrap(), 0);
    }
}
