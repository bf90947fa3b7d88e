//! Collection repository implementation

use std::collections::HashSet;

use libsql::{Connection, Row};

use super::{int_or_null, optional_int, optional_text, text_or_null};
use crate::error::Result;
use crate::models::{Collection, CollectionMember, EntityId};

const COLLECTION_COLUMNS: &str = "id, title, owner_id, member_refs, created_at, updated_at, \
     server_created_at, server_updated_at";

/// Trait for collection storage operations (async)
#[allow(async_fn_in_trait)]
pub trait CollectionRepository {
    async fn list(&self) -> Result<Vec<Collection>>;

    async fn get(&self, id: &EntityId) -> Result<Option<Collection>>;

    async fn upsert(&self, collection: &Collection) -> Result<()>;

    async fn delete(&self, id: &EntityId) -> Result<bool>;

    async fn delete_missing(
        &self,
        keep: &HashSet<EntityId>,
        protected: &HashSet<EntityId>,
    ) -> Result<Vec<EntityId>>;

    /// Replace the row at `local_id` with `remote`.
    ///
    /// Note references are rewritten by the caller inside the same transaction.
    async fn swap(&self, local_id: &EntityId, remote: &Collection) -> Result<()>;
}

/// libSQL implementation of `CollectionRepository`
pub struct LibSqlCollectionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCollectionRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_collection(row: &Row) -> Result<Collection> {
        let member_refs: String = row.get(3)?;
        let members: Vec<CollectionMember> = serde_json::from_str(&member_refs)?;
        Ok(Collection {
            id: EntityId::new(row.get::<String>(0)?),
            title: row.get(1)?,
            owner_id: optional_text(row.get_value(2)?),
            members,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            server_created_at: optional_int(row.get_value(6)?),
            server_updated_at: optional_int(row.get_value(7)?),
        })
    }
}

impl CollectionRepository for LibSqlCollectionRepository<'_> {
    async fn list(&self) -> Result<Vec<Collection>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {COLLECTION_COLUMNS} FROM collections ORDER BY title COLLATE NOCASE, id"),
                (),
            )
            .await?;
        let mut collections = Vec::new();
        while let Some(row) = rows.next().await? {
            collections.push(Self::parse_collection(&row)?);
        }
        Ok(collections)
    }

    async fn get(&self, id: &EntityId) -> Result<Option<Collection>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {COLLECTION_COLUMNS} FROM collections WHERE id = ?"),
                libsql::params![id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_collection(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, collection: &Collection) -> Result<()> {
        let member_refs = serde_json::to_string(&collection.members)?;
        self.conn
            .execute(
                "INSERT INTO collections (id, title, owner_id, member_refs, created_at, updated_at,
                    server_created_at, server_updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    owner_id = excluded.owner_id,
                    member_refs = excluded.member_refs,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    server_created_at = excluded.server_created_at,
                    server_updated_at = excluded.server_updated_at",
                libsql::params![
                    collection.id.as_str(),
                    collection.title.as_str(),
                    text_or_null(collection.owner_id.as_deref()),
                    member_refs,
                    collection.created_at,
                    collection.updated_at,
                    int_or_null(collection.server_created_at),
                    int_or_null(collection.server_updated_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &EntityId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM collections WHERE id = ?",
                libsql::params![id.as_str()],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn delete_missing(
        &self,
        keep: &HashSet<EntityId>,
        protected: &HashSet<EntityId>,
    ) -> Result<Vec<EntityId>> {
        let mut removed = Vec::new();
        for collection in self.list().await? {
            if keep.contains(&collection.id) || protected.contains(&collection.id) {
                continue;
            }
            self.delete(&collection.id).await?;
            removed.push(collection.id);
        }
        Ok(removed)
    }

    async fn swap(&self, local_id: &EntityId, remote: &Collection) -> Result<()> {
        self.upsert(remote).await?;
        if local_id != &remote.id {
            self.delete(local_id).await?;
        }
        Ok(())
    }
}
