//! Settings repository implementation

use std::collections::HashSet;

use libsql::Connection;

use crate::error::Result;
use crate::models::Setting;

/// Trait for settings storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SettingsRepository {
    async fn list(&self) -> Result<Vec<Setting>>;

    async fn get(&self, key: &str) -> Result<Option<Setting>>;

    async fn upsert(&self, setting: &Setting) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove settings whose key is absent from `keep`, except `protected` keys
    async fn delete_missing(&self, keep: &HashSet<String>, protected: &HashSet<String>) -> Result<Vec<String>>;
}

/// libSQL implementation of `SettingsRepository`
pub struct LibSqlSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_setting(row: &libsql::Row) -> Result<Setting> {
        let raw: String = row.get(1)?;
        Ok(Setting {
            key: row.get(0)?,
            value: serde_json::from_str(&raw)?,
            updated_at: row.get(2)?,
        })
    }
}

impl SettingsRepository for LibSqlSettingsRepository<'_> {
    async fn list(&self) -> Result<Vec<Setting>> {
        let mut rows = self
            .conn
            .query("SELECT key, value, updated_at FROM settings ORDER BY key", ())
            .await?;
        let mut settings = Vec::new();
        while let Some(row) = rows.next().await? {
            settings.push(Self::parse_setting(&row)?);
        }
        Ok(settings)
    }

    async fn get(&self, key: &str) -> Result<Option<Setting>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, value, updated_at FROM settings WHERE key = ?",
                [key],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_setting(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, setting: &Setting) -> Result<()> {
        let value = serde_json::to_string(&setting.value)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?, ?, ?)",
                libsql::params![setting.key.as_str(), value, setting.updated_at],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?", [key])
            .await?;
        Ok(affected > 0)
    }

    async fn delete_missing(&self, keep: &HashSet<String>, protected: &HashSet<String>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for setting in self.list().await? {
            if keep.contains(&setting.key) || protected.contains(&setting.key) {
                continue;
            }
            self.delete(&setting.key).await?;
            removed.push(setting.key);
        }
        Ok(removed)
    }
}
