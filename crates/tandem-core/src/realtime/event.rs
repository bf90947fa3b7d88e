//! Realtime event wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Collection, EntityId, MemberRole, Note, Setting};
use crate::Result;

/// One server-observed state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RealtimeEvent {
    /// Handshake carrying the server-confirmed client id
    Connected { client_id: String },
    NoteCreated { note: Note },
    NoteUpdated { note: Note },
    NoteDeleted { id: EntityId },
    CollectionCreated { collection: Collection },
    CollectionUpdated { collection: Collection },
    CollectionDeleted { id: EntityId },
    /// A note body reached a new revision on the server
    DocumentUpdated { note_id: EntityId, updated_at: i64 },
    MembershipJoined { collection: Collection, user_id: String },
    /// `collection` is present when another member left; absent when this
    /// user lost access
    MembershipLeft {
        collection_id: EntityId,
        user_id: String,
        #[serde(default)]
        collection: Option<Collection>,
    },
    MembershipRoleChanged {
        collection: Collection,
        user_id: String,
        role: MemberRole,
    },
    SettingUpdated { setting: Setting },
}

const KNOWN_TYPES: &[&str] = &[
    "connected",
    "note-created",
    "note-updated",
    "note-deleted",
    "collection-created",
    "collection-updated",
    "collection-deleted",
    "document-updated",
    "membership-joined",
    "membership-left",
    "membership-role-changed",
    "setting-updated",
];

impl RealtimeEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::NoteCreated { .. } => "note-created",
            Self::NoteUpdated { .. } => "note-updated",
            Self::NoteDeleted { .. } => "note-deleted",
            Self::CollectionCreated { .. } => "collection-created",
            Self::CollectionUpdated { .. } => "collection-updated",
            Self::CollectionDeleted { .. } => "collection-deleted",
            Self::DocumentUpdated { .. } => "document-updated",
            Self::MembershipJoined { .. } => "membership-joined",
            Self::MembershipLeft { .. } => "membership-left",
            Self::MembershipRoleChanged { .. } => "membership-role-changed",
            Self::SettingUpdated { .. } => "setting-updated",
        }
    }
}

/// A decoded event plus the client that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeMessage {
    pub event: RealtimeEvent,
    pub origin_client_id: Option<String>,
}

/// Decode one message payload.
///
/// Unknown `type` values yield `Ok(None)` so older clients keep working when
/// the server adds event kinds. A known kind with a malformed body is an error.
pub fn decode_event(payload: &str) -> Result<Option<RealtimeMessage>> {
    let value: Value = serde_json::from_str(payload)?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Ok(None);
    };
    if !KNOWN_TYPES.contains(&kind) {
        tracing::debug!(kind, "Ignoring unknown realtime event");
        return Ok(None);
    }
    let origin_client_id = value
        .get("originClientId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let event = serde_json::from_value(value)?;
    Ok(Some(RealtimeMessage {
        event,
        origin_client_id,
    }))
}
