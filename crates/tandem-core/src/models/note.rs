//! Note model

use serde::{Deserialize, Serialize};

use super::EntityId;
use crate::util::{next_timestamp, now_ms};

/// A note's metadata row. The rich-text body lives in its document replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Provisional or canonical identifier
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Owning collection, if any
    #[serde(default)]
    pub collection_id: Option<EntityId>,
    /// Client-authoritative creation timestamp (Unix ms)
    pub created_at: i64,
    /// Client-authoritative update timestamp (Unix ms)
    pub updated_at: i64,
    /// Server-authoritative timestamps; absent until the note was persisted remotely
    #[serde(default)]
    pub server_created_at: Option<i64>,
    #[serde(default)]
    pub server_updated_at: Option<i64>,
    /// Handle of the note's document replica
    #[serde(default)]
    pub document_replica_id: Option<EntityId>,
}

/// Partial update applied by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteChanges {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub collection_id: Option<Option<EntityId>>,
}

impl Note {
    /// Create a note with a provisional id.
    #[must_use]
    pub fn new(title: impl Into<String>, collection_id: Option<EntityId>) -> Self {
        let now = now_ms();
        Self {
            id: EntityId::mint_local(),
            title: title.into(),
            description: None,
            collection_id,
            created_at: now,
            updated_at: now,
            server_created_at: None,
            server_updated_at: None,
            document_replica_id: None,
        }
    }

    /// Whether the note was persisted remotely at least once.
    pub const fn is_synced(&self) -> bool {
        self.server_created_at.is_some()
    }

    /// Apply user changes and bump `updated_at`.
    pub fn apply(&mut self, changes: NoteChanges) {
        if let Some(title) = changes.title {
            self.title = title;
        }
        if let Some(description) = changes.description {
            self.description = description;
        }
        if let Some(collection_id) = changes.collection_id {
            self.collection_id = collection_id;
        }
        self.updated_at = next_timestamp(self.updated_at);
    }

    /// Combine the server's answer with the freshest local row.
    ///
    /// The server owns identity and server timestamps. When the user kept
    /// editing after `sent` was uploaded, the local content wins so the
    /// follow-up update carries it.
    #[must_use]
    pub fn reconcile_with_server(sent: &Self, current: Option<&Self>, remote: Self) -> Self {
        match current {
            Some(current) if current.updated_at > sent.updated_at => Self {
                id: remote.id,
                server_created_at: remote.server_created_at,
                server_updated_at: remote.server_updated_at,
                document_replica_id: remote
                    .document_replica_id
                    .or_else(|| current.document_replica_id.clone()),
                ..current.clone()
            },
            _ => remote,
        }
    }
}
