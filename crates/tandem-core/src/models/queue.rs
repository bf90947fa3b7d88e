//! Action queue items

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::EntityId;

/// Kind of mutation waiting to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CreateNote,
    UpdateNote,
    DeleteNote,
    CreateCollection,
    UpdateCollection,
    DeleteCollection,
    LeaveCollection,
    UpdateSetting,
    SyncSettings,
}

/// Entity family an action belongs to; used to route items to services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Note,
    Collection,
    Setting,
}

impl ActionType {
    pub const ALL: [Self; 9] = [
        Self::CreateNote,
        Self::UpdateNote,
        Self::DeleteNote,
        Self::CreateCollection,
        Self::UpdateCollection,
        Self::DeleteCollection,
        Self::LeaveCollection,
        Self::UpdateSetting,
        Self::SyncSettings,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateNote => "CREATE_NOTE",
            Self::UpdateNote => "UPDATE_NOTE",
            Self::DeleteNote => "DELETE_NOTE",
            Self::CreateCollection => "CREATE_COLLECTION",
            Self::UpdateCollection => "UPDATE_COLLECTION",
            Self::DeleteCollection => "DELETE_COLLECTION",
            Self::LeaveCollection => "LEAVE_COLLECTION",
            Self::UpdateSetting => "UPDATE_SETTING",
            Self::SyncSettings => "SYNC_SETTINGS",
        }
    }

    pub const fn kind(self) -> EntityKind {
        match self {
            Self::CreateNote | Self::UpdateNote | Self::DeleteNote => EntityKind::Note,
            Self::CreateCollection
            | Self::UpdateCollection
            | Self::DeleteCollection
            | Self::LeaveCollection => EntityKind::Collection,
            Self::UpdateSetting | Self::SyncSettings => EntityKind::Setting,
        }
    }

    pub const fn is_create(self) -> bool {
        matches!(self, Self::CreateNote | Self::CreateCollection)
    }

    /// Create/update class used for coalescing.
    pub const fn is_upsert(self) -> bool {
        matches!(
            self,
            Self::CreateNote
                | Self::UpdateNote
                | Self::CreateCollection
                | Self::UpdateCollection
                | Self::UpdateSetting
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown action type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Processing,
    Error,
}

impl ActionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }

    /// Active items block coalescing and pruning.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown action status: {other}"
            ))),
        }
    }
}

/// One durable, not-yet-confirmed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionQueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub related_entity_id: EntityId,
    pub status: ActionStatus,
    pub created_at: i64,
    #[serde(default)]
    pub error: Option<String>,
    /// Failed delivery attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl ActionQueueItem {
    pub fn new(action_type: ActionType, related_entity_id: EntityId, created_at: i64) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            action_type,
            related_entity_id,
            status: ActionStatus::Pending,
            created_at,
            error: None,
            attempts: 0,
        }
    }
}
