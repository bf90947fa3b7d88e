//! Collection and membership models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::EntityId;
use crate::util::{next_timestamp, now_ms};

/// A shared folder of notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: EntityId,
    pub title: String,
    /// Owning user, assigned by the server
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub members: Vec<CollectionMember>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub server_created_at: Option<i64>,
    #[serde(default)]
    pub server_updated_at: Option<i64>,
}

impl Collection {
    /// Create a collection with a provisional id.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: EntityId::mint_local(),
            title: title.into(),
            owner_id: None,
            members: Vec::new(),
            created_at: now,
            updated_at: now,
            server_created_at: None,
            server_updated_at: None,
        }
    }

    pub const fn is_synced(&self) -> bool {
        self.server_created_at.is_some()
    }

    pub fn rename(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.updated_at = next_timestamp(self.updated_at);
    }

    /// Same merge rule as notes: newer local edits survive the create round-trip.
    #[must_use]
    pub fn reconcile_with_server(sent: &Self, current: Option<&Self>, remote: Self) -> Self {
        match current {
            Some(current) if current.updated_at > sent.updated_at => Self {
                id: remote.id,
                owner_id: remote.owner_id,
                members: remote.members,
                server_created_at: remote.server_created_at,
                server_updated_at: remote.server_updated_at,
                ..current.clone()
            },
            _ => remote,
        }
    }
}

/// Role of a user inside a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Editor,
    #[default]
    Viewer,
}

impl MemberRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "editor" => Ok(Self::Editor),
            "viewer" => Ok(Self::Viewer),
            other => Err(crate::Error::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMember {
    pub user_id: String,
    #[serde(default)]
    pub role: MemberRole,
}

/// A pending invitation to join a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: String,
    pub collection_id: EntityId,
    pub email: String,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub created_at: Option<i64>,
}
