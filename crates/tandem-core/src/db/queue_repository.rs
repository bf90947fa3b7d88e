//! Action queue persistence

use libsql::{Connection, Row};

use super::{optional_text, text_or_null};
use crate::error::Result;
use crate::models::{ActionQueueItem, ActionStatus, ActionType, EntityId};

const QUEUE_COLUMNS: &str =
    "id, action_type, related_entity_id, status, created_at, error, attempts";

/// Durable outbox storage (async)
#[allow(async_fn_in_trait)]
pub trait QueueRepository {
    async fn insert(&self, item: &ActionQueueItem) -> Result<()>;

    /// All items, oldest first
    async fn list(&self) -> Result<Vec<ActionQueueItem>>;

    async fn list_by_status(&self, status: ActionStatus) -> Result<Vec<ActionQueueItem>>;

    async fn get(&self, id: &str) -> Result<Option<ActionQueueItem>>;

    /// Returns whether the item existed
    async fn set_status(&self, id: &str, status: ActionStatus, error: Option<&str>) -> Result<bool>;

    /// Revert to pending, keep the error and bump the attempt counter
    async fn record_failure(&self, id: &str, error: &str) -> Result<bool>;

    async fn delete(&self, id: &str) -> Result<bool>;

    /// Remove every item referencing `entity_id`
    async fn delete_for_entity(&self, entity_id: &EntityId) -> Result<u64>;

    /// Oldest active item for `entity_id` whose type is one of `types`
    async fn find_active(
        &self,
        entity_id: &EntityId,
        types: &[ActionType],
        statuses: &[ActionStatus],
    ) -> Result<Option<ActionQueueItem>>;

    /// Reset items left in `processing` by an interrupted run
    async fn reset_processing(&self) -> Result<u64>;

    async fn rewrite_entity_id(&self, from: &EntityId, to: &EntityId) -> Result<u64>;
}

/// libSQL implementation of `QueueRepository`
pub struct LibSqlQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlQueueRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_item(row: &Row) -> Result<ActionQueueItem> {
        let action_type: String = row.get(1)?;
        let status: String = row.get(3)?;
        let attempts: i64 = row.get(6)?;
        Ok(ActionQueueItem {
            id: row.get(0)?,
            action_type: action_type.parse()?,
            related_entity_id: EntityId::new(row.get::<String>(2)?),
            status: status.parse()?,
            created_at: row.get(4)?,
            error: optional_text(row.get_value(5)?),
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        })
    }

    async fn query_items(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ActionQueueItem>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(Self::parse_item(&row)?);
        }
        Ok(items)
    }
}

impl QueueRepository for LibSqlQueueRepository<'_> {
    async fn insert(&self, item: &ActionQueueItem) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO action_queue (id, action_type, related_entity_id, status, created_at, error, attempts)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    item.id.as_str(),
                    item.action_type.as_str(),
                    item.related_entity_id.as_str(),
                    item.status.as_str(),
                    item.created_at,
                    text_or_null(item.error.as_deref()),
                    i64::from(item.attempts),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ActionQueueItem>> {
        self.query_items(
            &format!("SELECT {QUEUE_COLUMNS} FROM action_queue ORDER BY created_at ASC, rowid ASC"),
            (),
        )
        .await
    }

    async fn list_by_status(&self, status: ActionStatus) -> Result<Vec<ActionQueueItem>> {
        self.query_items(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM action_queue WHERE status = ? ORDER BY created_at ASC, rowid ASC"
            ),
            libsql::params![status.as_str()],
        )
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<ActionQueueItem>> {
        let items = self
            .query_items(
                &format!("SELECT {QUEUE_COLUMNS} FROM action_queue WHERE id = ?"),
                libsql::params![id],
            )
            .await?;
        Ok(items.into_iter().next())
    }

    async fn set_status(&self, id: &str, status: ActionStatus, error: Option<&str>) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE action_queue SET status = ?, error = ? WHERE id = ?",
                libsql::params![status.as_str(), text_or_null(error), id],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn record_failure(&self, id: &str, error: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE action_queue SET status = 'pending', error = ?, attempts = attempts + 1 WHERE id = ?",
                libsql::params![error, id],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM action_queue WHERE id = ?", libsql::params![id])
            .await?;
        Ok(affected > 0)
    }

    async fn delete_for_entity(&self, entity_id: &EntityId) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM action_queue WHERE related_entity_id = ?",
                libsql::params![entity_id.as_str()],
            )
            .await?;
        Ok(affected)
    }

    async fn find_active(
        &self,
        entity_id: &EntityId,
        types: &[ActionType],
        statuses: &[ActionStatus],
    ) -> Result<Option<ActionQueueItem>> {
        let items = self
            .query_items(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM action_queue WHERE related_entity_id = ? ORDER BY created_at ASC, rowid ASC"
                ),
                libsql::params![entity_id.as_str()],
            )
            .await?;
        Ok(items.into_iter().find(|item| {
            types.contains(&item.action_type) && statuses.contains(&item.status)
        }))
    }

    async fn reset_processing(&self) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "UPDATE action_queue SET status = 'pending' WHERE status = 'processing'",
                (),
            )
            .await?;
        Ok(affected)
    }

    async fn rewrite_entity_id(&self, from: &EntityId, to: &EntityId) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "UPDATE action_queue SET related_entity_id = ? WHERE related_entity_id = ?",
                libsql::params![to.as_str(), from.as_str()],
            )
            .await?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn item(action: ActionType, entity: &str, created_at: i64) -> ActionQueueItem {
        ActionQueueItem::new(action, EntityId::new(entity), created_at)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_orders_by_created_at_not_insertion() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());

        repo.insert(&item(ActionType::UpdateNote, "n1", 30)).await.unwrap();
        repo.insert(&item(ActionType::CreateNote, "n1", 10)).await.unwrap();
        repo.insert(&item(ActionType::CreateCollection, "c1", 20))
            .await
            .unwrap();

        let order: Vec<i64> = repo
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.created_at)
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_transitions_and_failure_counter() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());
        let queued = item(ActionType::CreateNote, "n1", 1);
        repo.insert(&queued).await.unwrap();

        repo.set_status(&queued.id, ActionStatus::Processing, None)
            .await
            .unwrap();
        assert_eq!(
            repo.list_by_status(ActionStatus::Processing).await.unwrap().len(),
            1
        );

        repo.record_failure(&queued.id, "connection reset").await.unwrap();
        let reloaded = repo.get(&queued.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ActionStatus::Pending);
        assert_eq!(reloaded.attempts, 1);
        assert_eq!(reloaded.error.as_deref(), Some("connection reset"));

        assert!(!repo.set_status("missing", ActionStatus::Error, Some("x")).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reset_processing() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());
        let first = item(ActionType::CreateNote, "n1", 1);
        let second = item(ActionType::CreateNote, "n2", 2);
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();
        repo.set_status(&first.id, ActionStatus::Processing, None)
            .await
            .unwrap();

        assert_eq!(repo.reset_processing().await.unwrap(), 1);
        assert_eq!(
            repo.list_by_status(ActionStatus::Pending).await.unwrap().len(),
            2
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_find_active_filters_type_and_status() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());
        let create = item(ActionType::CreateNote, "n1", 1);
        repo.insert(&create).await.unwrap();

        let pending_only = [ActionStatus::Pending];
        let found = repo
            .find_active(&EntityId::new("n1"), &[ActionType::CreateNote], &pending_only)
            .await
            .unwrap();
        assert_eq!(found.map(|item| item.id), Some(create.id.clone()));

        repo.set_status(&create.id, ActionStatus::Processing, None)
            .await
            .unwrap();
        assert!(repo
            .find_active(&EntityId::new("n1"), &[ActionType::CreateNote], &pending_only)
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_active(&EntityId::new("n1"), &[ActionType::UpdateNote], &[ActionStatus::Processing])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rewrite_entity_id() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.insert(&item(ActionType::UpdateNote, "local-n", 1)).await.unwrap();

        let affected = repo
            .rewrite_entity_id(&EntityId::new("local-n"), &EntityId::new("srv-n"))
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(repo.list().await.unwrap()[0].related_entity_id, EntityId::new("srv-n"));
    }
}
