//! Settings persistence and the opt-in settings sync.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use super::{remote_wins, DomainSyncService, ReconcileReport, SyncContext};
use crate::models::{ActionQueueItem, ActionType, EntityId, Setting, SYNC_SETTINGS_KEY};
use crate::realtime::RealtimeEvent;
use crate::store::StoreCommand;
use crate::{Error, Result};

/// Settings stay on the device unless the `syncSettings` flag is on. The
/// flag itself is never uploaded.
pub struct SettingsSyncService {
    ctx: SyncContext,
}

impl SettingsSyncService {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn sync_enabled(&self) -> Result<bool> {
        Ok(self
            .ctx
            .local
            .get_setting(SYNC_SETTINGS_KEY)
            .await?
            .is_some_and(|setting| setting.as_flag()))
    }

    pub async fn set_sync_enabled(&self, enabled: bool) -> Result<Setting> {
        self.set_setting(SYNC_SETTINGS_KEY, Value::Bool(enabled)).await
    }

    /// Store a setting and queue its upload when settings sync is on.
    ///
    /// Turning sync on queues one bulk push of every local setting.
    pub async fn set_setting(&self, key: &str, value: Value) -> Result<Setting> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput("Setting key must not be empty".to_string()));
        }
        let was_enabled = self.sync_enabled().await?;
        let previous = self.ctx.local.get_setting(key).await?;
        let setting = Setting::new(key, value);
        self.ctx.local.upsert_setting(&setting).await?;

        let queued = if setting.is_local_only() {
            if setting.as_flag() && !was_enabled {
                self.ctx
                    .queue
                    .enqueue_coalesced(ActionType::SyncSettings, EntityId::new(SYNC_SETTINGS_KEY))
                    .await
                    .map(|_| ())
            } else {
                Ok(())
            }
        } else if was_enabled {
            self.ctx
                .queue
                .enqueue_coalesced(ActionType::UpdateSetting, EntityId::new(key))
                .await
                .map(|_| ())
        } else {
            Ok(())
        };

        if let Err(error) = queued {
            self.restore(key, previous).await;
            return Err(error);
        }
        self.ctx.store.apply(StoreCommand::UpsertSetting(setting.clone()));
        Ok(setting)
    }

    async fn restore(&self, key: &str, previous: Option<Setting>) {
        let result = match previous {
            Some(previous) => self.ctx.local.upsert_setting(&previous).await,
            None => self.ctx.local.delete_setting(key).await.map(|_| ()),
        };
        if let Err(error) = result {
            tracing::error!(key, "Failed to restore setting after queue error: {error}");
        }
    }

    /// Store a server copy unless the local one is newer.
    async fn apply_remote(&self, setting: Setting) -> Result<bool> {
        if setting.is_local_only() {
            return Ok(false);
        }
        let local = self.ctx.local.get_setting(&setting.key).await?;
        if local.as_ref() == Some(&setting)
            || !remote_wins(local.map(|local| local.updated_at), setting.updated_at)
        {
            return Ok(false);
        }
        self.ctx.local.upsert_setting(&setting).await?;
        self.ctx.store.apply(StoreCommand::UpsertSetting(setting));
        Ok(true)
    }

    async fn upload_one(&self, key: &str) -> Result<()> {
        let Some(setting) = self.ctx.local.get_setting(key).await? else {
            return Ok(());
        };
        let remote = self.ctx.api.update_setting(&setting).await?;
        self.apply_remote(remote).await?;
        Ok(())
    }

    async fn upload_all(&self) -> Result<()> {
        let settings: Vec<Setting> = self
            .ctx
            .local
            .list_settings()
            .await?
            .into_iter()
            .filter(|setting| !setting.is_local_only())
            .collect();
        let count = settings.len();
        for setting in self.ctx.api.sync_settings(&settings).await? {
            self.apply_remote(setting).await?;
        }
        tracing::info!(count, "Pushed local settings");
        Ok(())
    }
}

#[async_trait]
impl DomainSyncService for SettingsSyncService {
    fn name(&self) -> &'static str {
        "settings"
    }

    fn handles(&self, action: ActionType) -> bool {
        matches!(action, ActionType::UpdateSetting | ActionType::SyncSettings)
    }

    async fn load_local_to_store(&self) -> Result<()> {
        let settings = self.ctx.local.list_settings().await?;
        self.ctx.store.apply(StoreCommand::SetSettings(settings));
        Ok(())
    }

    async fn sync_all_remote_to_local(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if !self.sync_enabled().await? {
            return Ok(report);
        }
        let queued = self.ctx.local.active_queue_entities().await?;
        let remote = self.ctx.api.list_settings().await?;
        let keep: HashSet<String> = remote.iter().map(|setting| setting.key.clone()).collect();

        for setting in remote {
            if queued.contains(&EntityId::new(setting.key.as_str())) {
                report.deferred += 1;
                continue;
            }
            if self.apply_remote(setting).await? {
                report.upserted += 1;
            }
        }

        // A queued bulk push still owns every local key
        if !queued.contains(&EntityId::new(SYNC_SETTINGS_KEY)) {
            let mut protected: HashSet<String> = queued
                .into_iter()
                .map(|id| id.as_str().to_string())
                .collect();
            protected.insert(SYNC_SETTINGS_KEY.to_string());
            let pruned = self.ctx.local.prune_settings(&keep, &protected).await?;
            report.pruned = pruned.len();
            for key in pruned {
                self.ctx.store.apply(StoreCommand::RemoveSetting(key));
            }
        }
        Ok(report)
    }

    async fn process_queue_item(&self, item: &ActionQueueItem) -> Result<()> {
        if !self.sync_enabled().await? {
            tracing::debug!(item_id = %item.id, "Settings sync disabled, dropping queued item");
            return Ok(());
        }
        match item.action_type {
            ActionType::UpdateSetting => self.upload_one(item.related_entity_id.as_str()).await,
            ActionType::SyncSettings => self.upload_all().await,
            other => Err(Error::InvalidInput(format!(
                "{other} is not a settings action"
            ))),
        }
    }

    async fn handle_realtime_event(&self, event: &RealtimeEvent) -> Result<()> {
        if let RealtimeEvent::SettingUpdated { setting } = event {
            if self.sync_enabled().await? {
                self.apply_remote(setting.clone()).await?;
            }
        }
        Ok(())
    }
}
